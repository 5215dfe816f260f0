//! Stream subscriptions: recomputed every tick, pushed on change.
//!
//! The `StreamManager` owns every client's subscriptions. Each tick it
//! re-invokes the subscribed calls through the [`Dispatcher`] and collects,
//! per client, the results that differ from what that client last saw.
//!
//! ```text
//!   AddStream(call) ──▶ Subscription { client, call, last: None }
//!                                  │
//!        tick ──▶ invoke(call) ──▶ outcome != last ? ──▶ StreamBatch
//!                                  │
//!   RemoveStream(id) / disconnect ─┴──▶ dropped
//! ```

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use super::engine::Dispatcher;
use super::messages::{
    ClientId, ErrorKind, Failure, Outcome, ProcedureCall, StreamId, StreamMessage, StreamResult,
};
use crate::scheduler::ServerStatus;

struct Subscription {
    client: ClientId,
    call: ProcedureCall,
    /// Dedupe key, kept so removal can clear the index.
    key: Vec<u8>,
    /// Encoded form of the last outcome handed out; `None` until the first.
    /// Compared bytewise so float results change exactly when their bits do.
    last: Option<Vec<u8>>,
}

/// Results for one client produced by one [`StreamManager::tick`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub client: ClientId,
    pub message: StreamMessage,
}

pub struct StreamManager {
    subscriptions: BTreeMap<StreamId, Subscription>,
    index: HashMap<(ClientId, Vec<u8>), StreamId>,
    next_id: StreamId,
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            subscriptions: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }

    /// Subscribe `client` to `call`. Subscribing twice to the same call
    /// returns the existing handle.
    pub fn add(&mut self, client: ClientId, call: ProcedureCall) -> Result<StreamId, Failure> {
        let key = postcard::to_allocvec(&call).map_err(|e| Failure::failed(e.to_string()))?;
        if let Some(&id) = self.index.get(&(client, key.clone())) {
            debug!("RPC[{}]: stream {} already exists for {}", client, id, call);
            return Ok(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        info!("RPC[{}]: stream {} added for {}", client, id, call);
        self.index.insert((client, key.clone()), id);
        self.subscriptions.insert(
            id,
            Subscription {
                client,
                call,
                key,
                last: None,
            },
        );
        Ok(id)
    }

    /// Remove one of `client`'s subscriptions.
    pub fn remove(&mut self, client: ClientId, id: StreamId) -> Result<(), Failure> {
        match self.subscriptions.get(&id) {
            Some(sub) if sub.client == client => {}
            _ => {
                return Err(Failure::new(
                    ErrorKind::SubscriptionNotFound,
                    format!("no stream with id {id}"),
                ));
            }
        }
        if let Some(sub) = self.subscriptions.remove(&id) {
            self.index.remove(&(client, sub.key));
            info!("RPC[{}]: stream {} removed", client, id);
        }
        Ok(())
    }

    /// Drop every subscription owned by `client`. Returns how many went.
    pub fn remove_client(&mut self, client: ClientId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.client != client);
        self.index.retain(|(c, _), _| *c != client);
        let removed = before - self.subscriptions.len();
        if removed > 0 {
            info!("RPC[{}]: dropped {} streams", client, removed);
        }
        removed
    }

    /// Forget what `client` has seen, so every subscription is resent on
    /// the next tick. Used when a fresh stream connection is attached.
    pub fn mark_unseen(&mut self, client: ClientId) {
        for sub in self.subscriptions.values_mut().filter(|s| s.client == client) {
            sub.last = None;
        }
    }

    /// Re-evaluate every subscription whose client is `deliverable` and
    /// collect the changed results, one batch per client.
    pub fn tick<H>(
        &mut self,
        dispatcher: &Dispatcher<H>,
        host: &mut H,
        status: &ServerStatus,
        deliverable: impl Fn(ClientId) -> bool,
    ) -> Vec<StreamBatch> {
        let mut batches: BTreeMap<ClientId, Vec<StreamResult>> = BTreeMap::new();

        for (&id, sub) in &mut self.subscriptions {
            if !deliverable(sub.client) {
                continue;
            }
            let outcome: Outcome = dispatcher
                .invoke(host, sub.client, None, status, &sub.call)
                .into();
            let encoded = postcard::to_allocvec(&outcome).ok();
            if encoded.is_none() || sub.last != encoded {
                batches
                    .entry(sub.client)
                    .or_default()
                    .push(StreamResult { id, outcome });
            }
            sub.last = encoded;
        }

        batches
            .into_iter()
            .map(|(client, results)| StreamBatch {
                client,
                message: StreamMessage { results },
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn count_for(&self, client: ClientId) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.client == client)
            .count()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.subscriptions.contains_key(&id)
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::catalogue::{CatalogueBuilder, Signature};
    use crate::rpc::messages::Value;

    const ALICE: ClientId = ClientId::from_bytes([1; 16]);
    const BOB: ClientId = ClientId::from_bytes([2; 16]);

    struct Host {
        counter: i64,
        reading: f64,
    }

    fn dispatcher() -> Dispatcher<Host> {
        let mut b = CatalogueBuilder::<Host>::new();
        b.procedure("Svc", "Constant", Signature::new(), |_, _| Ok(Value::Int(42)))
            .procedure("Svc", "Counter", Signature::new(), |ctx, _| {
                Ok(Value::Int(ctx.host.counter))
            })
            .procedure("Svc", "Broken", Signature::new(), |_, _| {
                Err(Failure::failed("sensor offline"))
            })
            .procedure("Svc", "Reading", Signature::new(), |ctx, _| {
                Ok(Value::Float(ctx.host.reading))
            });
        Dispatcher::new(b.build().unwrap())
    }

    fn call(procedure: &str) -> ProcedureCall {
        ProcedureCall::new("Svc", procedure, vec![])
    }

    fn tick(streams: &mut StreamManager, d: &Dispatcher<Host>, host: &mut Host) -> Vec<StreamBatch> {
        streams.tick(d, host, &ServerStatus::default(), |_| true)
    }

    #[test]
    fn handles_start_at_one_and_are_not_reused() {
        let mut s = StreamManager::new();
        let a = s.add(ALICE, call("Constant")).unwrap();
        assert_eq!(a, 1);
        s.remove(ALICE, a).unwrap();
        let b = s.add(ALICE, call("Constant")).unwrap();
        assert_eq!(b, 2);
    }

    #[test]
    fn resubscribe_returns_same_handle() {
        let mut s = StreamManager::new();
        let a = s.add(ALICE, call("Counter")).unwrap();
        assert_eq!(s.add(ALICE, call("Counter")).unwrap(), a);
        assert_eq!(s.len(), 1);
        assert_ne!(s.add(BOB, call("Counter")).unwrap(), a);
    }

    #[test]
    fn remove_unknown_has_no_side_effect() {
        let mut s = StreamManager::new();
        let a = s.add(ALICE, call("Counter")).unwrap();
        let err = s.remove(ALICE, 77).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SubscriptionNotFound);
        assert!(s.remove(BOB, a).is_err());
        assert!(s.contains(a));
    }

    #[test]
    fn constant_is_pushed_once() {
        let d = dispatcher();
        let mut host = Host { counter: 0, reading: 0.0 };
        let mut s = StreamManager::new();
        let id = s.add(ALICE, call("Constant")).unwrap();

        let first = tick(&mut s, &d, &mut host);
        assert_eq!(
            first,
            vec![StreamBatch {
                client: ALICE,
                message: StreamMessage {
                    results: vec![StreamResult {
                        id,
                        outcome: Outcome::Success(Value::Int(42)),
                    }],
                },
            }]
        );
        for _ in 0..5 {
            assert!(tick(&mut s, &d, &mut host).is_empty());
        }
    }

    #[test]
    fn changes_are_pushed() {
        let d = dispatcher();
        let mut host = Host { counter: 0, reading: 0.0 };
        let mut s = StreamManager::new();
        s.add(ALICE, call("Counter")).unwrap();

        assert_eq!(tick(&mut s, &d, &mut host).len(), 1);
        assert!(tick(&mut s, &d, &mut host).is_empty());
        host.counter = 1;
        let batches = tick(&mut s, &d, &mut host);
        assert_eq!(
            batches[0].message.results[0].outcome,
            Outcome::Success(Value::Int(1))
        );
    }

    #[test]
    fn float_changes_follow_bit_patterns() {
        let d = dispatcher();
        let mut host = Host {
            counter: 0,
            reading: f64::NAN,
        };
        let mut s = StreamManager::new();
        s.add(ALICE, call("Reading")).unwrap();

        assert_eq!(tick(&mut s, &d, &mut host).len(), 1);
        assert!(tick(&mut s, &d, &mut host).is_empty(), "same NaN again");
        assert!(tick(&mut s, &d, &mut host).is_empty());

        host.reading = 0.0;
        assert_eq!(tick(&mut s, &d, &mut host).len(), 1);
        host.reading = -0.0;
        let batches = tick(&mut s, &d, &mut host);
        assert_eq!(batches.len(), 1, "sign of zero is a change");
        let Outcome::Success(Value::Float(v)) = &batches[0].message.results[0].outcome else {
            panic!("expected a float");
        };
        assert!(*v == 0.0 && v.is_sign_negative());
    }

    #[test]
    fn failure_is_delivered_and_subscription_kept() {
        let d = dispatcher();
        let mut host = Host { counter: 0, reading: 0.0 };
        let mut s = StreamManager::new();
        let broken = s.add(ALICE, call("Broken")).unwrap();
        s.add(ALICE, call("Constant")).unwrap();

        let batches = tick(&mut s, &d, &mut host);
        assert_eq!(batches.len(), 1, "one batch per client");
        let results = &batches[0].message.results;
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].outcome.failure().map(|f| f.kind),
            Some(ErrorKind::ProcedureFailed)
        );
        assert!(s.contains(broken));
        assert!(tick(&mut s, &d, &mut host).is_empty());
    }

    #[test]
    fn undeliverable_subscription_stays_new() {
        let d = dispatcher();
        let mut host = Host { counter: 0, reading: 0.0 };
        let mut s = StreamManager::new();
        s.add(ALICE, call("Constant")).unwrap();

        let none = s.tick(&d, &mut host, &ServerStatus::default(), |_| false);
        assert!(none.is_empty());
        assert_eq!(tick(&mut s, &d, &mut host).len(), 1);
    }

    #[test]
    fn mark_unseen_resends_and_remove_client_drops() {
        let d = dispatcher();
        let mut host = Host { counter: 0, reading: 0.0 };
        let mut s = StreamManager::new();
        s.add(ALICE, call("Constant")).unwrap();
        s.add(BOB, call("Constant")).unwrap();
        tick(&mut s, &d, &mut host);

        s.mark_unseen(ALICE);
        let batches = tick(&mut s, &d, &mut host);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].client, ALICE);

        assert_eq!(s.remove_client(ALICE), 1);
        assert_eq!(s.count_for(ALICE), 0);
        assert_eq!(s.count_for(BOB), 1);
        // Re-adding after removal gets a fresh handle.
        assert_eq!(s.add(ALICE, call("Constant")).unwrap(), 3);
    }
}
