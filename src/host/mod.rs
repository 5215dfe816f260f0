//! Demo host object model.
//!
//! A small solar system and one vessel, stored in generational arenas.
//! Parts point at their parent and children by index, never by reference,
//! so the graph can be mutated freely from the execution slot.
//!
//! [`Universe::advance`] is the host's own update step; the server binary
//! calls it once per tick before dispatching requests.

pub mod services;

use std::f64::consts::TAU;

use log::info;

/// Ambient temperature parts relax towards (kelvin).
const AMBIENT_K: f64 = 293.15;

/// Fraction of the gap to ambient closed per second.
const COOLING_PER_SEC: f64 = 0.05;

// ── Arena ────────────────────────────────────────────────────

/// Highest generation a slot reaches. A slot removed at this generation is
/// retired instead of reused, so an index is never valid for two values.
pub const MAX_GENERATION: u32 = (1 << 24) - 1;

/// Generational index into an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index {
    slot: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> Index {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return Index {
                slot,
                generation: entry.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Index {
            slot,
            generation: 0,
        }
    }

    /// Remove the value; every outstanding index to it becomes stale.
    pub fn remove(&mut self, index: Index) -> Option<T> {
        let entry = self.slots.get_mut(index.slot as usize)?;
        if entry.generation != index.generation {
            return None;
        }
        let value = entry.value.take()?;
        if entry.generation < MAX_GENERATION {
            entry.generation += 1;
            self.free.push(index.slot);
        }
        Some(value)
    }

    pub fn get(&self, index: Index) -> Option<&T> {
        self.slots
            .get(index.slot as usize)
            .filter(|s| s.generation == index.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        self.slots
            .get_mut(index.slot as usize)
            .filter(|s| s.generation == index.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Index {
                        slot: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Index, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.value.as_mut().map(|v| {
                (
                    Index {
                        slot: i as u32,
                        generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Object model ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CelestialBody {
    pub name: String,
    /// kg
    pub mass: f64,
    /// m/s²
    pub surface_gravity: f64,
    /// seconds
    pub rotational_period: f64,
    pub has_atmosphere: bool,
    /// radians, in [0, 2π)
    pub rotation_angle: f64,
}

#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub parent: Option<Index>,
    pub children: Vec<Index>,
    /// kelvin
    pub temperature: f64,
    pub max_temperature: f64,
}

/// The whole simulated world.
pub struct Universe {
    /// Universal time in seconds.
    pub ut: f64,
    pub bodies: Arena<CelestialBody>,
    pub parts: Arena<Part>,
}

impl Universe {
    pub fn new() -> Self {
        Self {
            ut: 0.0,
            bodies: Arena::new(),
            parts: Arena::new(),
        }
    }

    /// Three bodies and a four-part vessel with one radial attachment.
    pub fn demo() -> Self {
        let mut u = Self::new();
        for (name, mass, gravity, period, atmosphere) in [
            ("Sun", 1.756_546_5e28, 17.1, 432_000.0, true),
            ("Kerbin", 5.291_515_8e22, 9.81, 21_549.425, true),
            ("Mun", 9.759_906_6e20, 1.63, 138_984.38, false),
        ] {
            u.bodies.insert(CelestialBody {
                name: name.into(),
                mass,
                surface_gravity: gravity,
                rotational_period: period,
                has_atmosphere: atmosphere,
                rotation_angle: 0.0,
            });
        }

        let pod = u.add_part("mk1pod", None, 2400.0);
        let tank = u.add_part("fuelTank", Some(pod), 2000.0);
        u.add_part("liquidEngine", Some(tank), 2000.0);
        u.add_part("solarPanels", Some(pod), 1200.0);
        u
    }

    pub fn add_part(&mut self, name: &str, parent: Option<Index>, max_temperature: f64) -> Index {
        let index = self.parts.insert(Part {
            name: name.into(),
            parent,
            children: Vec::new(),
            temperature: AMBIENT_K,
            max_temperature,
        });
        if let Some(p) = parent.and_then(|p| self.parts.get_mut(p)) {
            p.children.push(index);
        }
        index
    }

    /// Destroy a part and everything attached below it.
    pub fn destroy_part(&mut self, index: Index) -> usize {
        let Some(part) = self.parts.remove(index) else {
            return 0;
        };
        if let Some(parent) = part.parent.and_then(|p| self.parts.get_mut(p)) {
            parent.children.retain(|c| *c != index);
        }
        1 + part
            .children
            .into_iter()
            .map(|c| self.destroy_part(c))
            .sum::<usize>()
    }

    /// Advance the simulation by `dt` seconds.
    pub fn advance(&mut self, dt: f64) {
        self.ut += dt;
        for (_, body) in self.bodies.iter_mut() {
            if body.rotational_period > 0.0 {
                body.rotation_angle = (self.ut / body.rotational_period * TAU).rem_euclid(TAU);
            }
        }

        let relax = (COOLING_PER_SEC * dt).min(1.0);
        let mut overheated = Vec::new();
        for (index, part) in self.parts.iter_mut() {
            if part.temperature > part.max_temperature {
                overheated.push(index);
            } else {
                part.temperature += (AMBIENT_K - part.temperature) * relax;
            }
        }
        for index in overheated {
            if let Some(name) = self.parts.get(index).map(|p| p.name.clone()) {
                let n = self.destroy_part(index);
                info!("Host: {} overheated, {} parts destroyed", name, n);
            }
        }
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::demo()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_index_is_stale_and_slot_reused() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        assert_eq!(arena.remove(a), Some(1));
        assert!(arena.get(a).is_none());
        let b = arena.insert(2);
        assert_ne!(a, b, "reused slot carries a new generation");
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn exhausted_slot_is_retired() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        arena.slots[a.slot as usize].generation = MAX_GENERATION;
        let a = Index {
            slot: a.slot,
            generation: MAX_GENERATION,
        };

        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b");
        assert_ne!(b.slot, a.slot, "retired slot is not handed out again");
        assert!(arena.get(a).is_none());
        assert_eq!(arena.remove(a), None);
    }

    #[test]
    fn demo_vessel_links_parent_and_children() {
        let u = Universe::demo();
        let (pod, p) = u.parts.iter().find(|(_, p)| p.name == "mk1pod").unwrap();
        assert!(p.parent.is_none());
        assert_eq!(p.children.len(), 2);
        for child in &p.children {
            assert_eq!(u.parts.get(*child).unwrap().parent, Some(pod));
        }
    }

    #[test]
    fn rotation_angle_wraps() {
        let mut u = Universe::demo();
        let period = u.bodies.iter().next().unwrap().1.rotational_period;
        u.advance(period * 1.25);
        let angle = u.bodies.iter().next().unwrap().1.rotation_angle;
        assert!((angle - TAU * 0.25).abs() < 1e-6);
    }

    #[test]
    fn overheated_part_destroys_subtree() {
        let mut u = Universe::demo();
        let (tank, _) = u.parts.iter().find(|(_, p)| p.name == "fuelTank").unwrap();
        u.parts.get_mut(tank).unwrap().temperature = 5000.0;
        u.advance(0.02);
        assert!(u.parts.get(tank).is_none());
        assert_eq!(u.parts.len(), 2, "tank and engine gone");
        let (_, pod) = u.parts.iter().find(|(_, p)| p.name == "mk1pod").unwrap();
        assert_eq!(pod.children.len(), 1);
    }

    #[test]
    fn parts_cool_towards_ambient() {
        let mut u = Universe::demo();
        let (pod, _) = u.parts.iter().find(|(_, p)| p.name == "mk1pod").unwrap();
        u.parts.get_mut(pod).unwrap().temperature = 1000.0;
        u.advance(1.0);
        let t = u.parts.get(pod).unwrap().temperature;
        assert!(t < 1000.0 && t > AMBIENT_K);
    }
}
