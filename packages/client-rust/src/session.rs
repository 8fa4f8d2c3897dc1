//! Session table: in-flight asynchronous calls awaiting a reply.
//!
//! Every outbound call with a reply registers one [`Session`] keyed by a
//! fresh sequence id. A session leaves the table exactly once: resolved by a
//! matching reply or exception, or expired by a sweep. Its callback runs
//! exactly once, after the table lock is released.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tickrpc_core::{from_payload, SequenceId, Value};
use tracing::{debug, error};

use crate::connection::ConnectionKey;
use crate::error::RpcError;

/// Completion callback for one call.
///
/// Invoked on the thread driving `RpcClient::update`, never concurrently with
/// another callback from the same client, and never while a connection lock
/// is held: it may issue new calls.
pub type ReplyCallback = Box<dyn FnOnce(Result<Reply, RpcError>) + Send>;

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Decoded payload of a successful reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    value: Value,
}

impl Reply {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Converts the payload into the expected result type.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Codec` if the payload does not have `T`'s shape.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        Ok(from_payload(self.value)?)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One outstanding call.
pub struct Session {
    pub sequence_id: SequenceId,
    pub created_at: Instant,
    pub timeout: Duration,
    pub connection: ConnectionKey,
    callback: ReplyCallback,
}

impl Session {
    /// Whether the timeout budget is used up at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.timeout
    }

    /// Runs the callback with `result`, consuming the session.
    ///
    /// A panicking callback is logged and contained, so callers completing
    /// several sessions in a row still run every remaining callback.
    pub fn complete(self, result: Result<Reply, RpcError>) {
        let Self {
            sequence_id,
            callback,
            ..
        } = self;
        if panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
            error!(sequence_id, "reply callback panicked");
        }
    }

    fn expire(self, now: Instant) {
        let err = RpcError::Timeout {
            timeout: self.timeout,
            elapsed: now.saturating_duration_since(self.created_at),
        };
        self.complete(Err(err));
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sequence_id", &self.sequence_id)
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SessionTable
// ---------------------------------------------------------------------------

struct Inner {
    next_id: SequenceId,
    sessions: HashMap<SequenceId, Session>,
}

impl Inner {
    fn allocate(&mut self) -> SequenceId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Sequence id -> pending session.
pub struct SessionTable {
    inner: Mutex<Inner>,
}

impl SessionTable {
    /// Creates an empty table. The first id handed out is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Registers a session created now.
    pub fn register(
        &self,
        callback: ReplyCallback,
        timeout: Duration,
        connection: ConnectionKey,
    ) -> SequenceId {
        self.register_at(callback, timeout, connection, Instant::now())
    }

    /// Registers a session created at `created_at`.
    ///
    /// Allocation and insertion happen under one lock, so concurrent callers
    /// never observe or reuse each other's ids.
    pub fn register_at(
        &self,
        callback: ReplyCallback,
        timeout: Duration,
        connection: ConnectionKey,
        created_at: Instant,
    ) -> SequenceId {
        let mut inner = self.inner.lock();
        let sequence_id = inner.allocate();
        inner.sessions.insert(
            sequence_id,
            Session {
                sequence_id,
                created_at,
                timeout,
                connection,
                callback,
            },
        );
        sequence_id
    }

    /// Allocates an id without registering a session (oneway calls).
    pub fn next_sequence_id(&self) -> SequenceId {
        self.inner.lock().allocate()
    }

    /// Removes and returns the session for `sequence_id`.
    pub fn resolve(&self, sequence_id: SequenceId) -> Option<Session> {
        self.inner.lock().sessions.remove(&sequence_id)
    }

    /// Removes a session without running its callback.
    ///
    /// Used when the request never made it onto the wire.
    pub fn withdraw(&self, sequence_id: SequenceId) -> bool {
        self.resolve(sequence_id).is_some()
    }

    /// Expires every session whose budget is used up at `now`.
    ///
    /// Returns the number of sessions expired.
    pub fn sweep(&self, now: Instant) -> usize {
        self.sweep_matching(now, |_| true)
    }

    /// Expires the sessions of one connection whose budget is used up at `now`.
    pub fn sweep_connection(&self, now: Instant, connection: &ConnectionKey) -> usize {
        self.sweep_matching(now, |session| &session.connection == connection)
    }

    fn sweep_matching(&self, now: Instant, filter: impl Fn(&Session) -> bool) -> usize {
        let expired: Vec<Session> = {
            let mut inner = self.inner.lock();
            let ids: Vec<SequenceId> = inner
                .sessions
                .values()
                .filter(|s| filter(s) && s.is_expired(now))
                .map(|s| s.sequence_id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.sessions.remove(&id))
                .collect()
        };

        let count = expired.len();
        for session in expired {
            debug!(
                sequence_id = session.sequence_id,
                connection = %session.connection,
                "session timed out"
            );
            session.expire(now);
        }
        count
    }

    #[must_use]
    pub fn contains(&self, sequence_id: SequenceId) -> bool {
        self.inner.lock().sessions.contains_key(&sequence_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTable")
            .field("pending", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    pub(crate) type Outcomes = Arc<Mutex<Vec<(&'static str, Result<Reply, RpcError>)>>>;

    /// Callback that records its outcome under `label`.
    pub(crate) fn recorder(outcomes: &Outcomes, label: &'static str) -> ReplyCallback {
        let outcomes = Arc::clone(outcomes);
        Box::new(move |result| outcomes.lock().push((label, result)))
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("mem:test")
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let table = SessionTable::new();
        let outcomes = Outcomes::default();
        let a = table.register(recorder(&outcomes, "a"), Duration::from_secs(5), key());
        let b = table.next_sequence_id();
        let c = table.register(recorder(&outcomes, "c"), Duration::from_secs(5), key());
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(table.len(), 2);
        assert!(!table.contains(b));
    }

    #[test]
    fn timed_out_session_fires_once_and_leaves() {
        let table = SessionTable::new();
        let outcomes = Outcomes::default();
        let t0 = Instant::now();
        let id = table.register_at(recorder(&outcomes, "a"), Duration::from_millis(1_000), key(), t0);
        assert_eq!(id, 1);

        assert_eq!(table.sweep(t0 + Duration::from_millis(999)), 0);
        assert!(table.contains(1));

        assert_eq!(table.sweep(t0 + Duration::from_millis(1_100)), 1);
        assert!(!table.contains(1));
        assert_eq!(table.sweep(t0 + Duration::from_millis(5_000)), 0);

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0].1 {
            Err(RpcError::Timeout { timeout, elapsed }) => {
                assert_eq!(*timeout, Duration::from_millis(1_000));
                assert_eq!(*elapsed, Duration::from_millis(1_100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn resolved_session_is_never_swept() {
        let table = SessionTable::new();
        let outcomes = Outcomes::default();
        let t0 = Instant::now();
        let id = table.register_at(recorder(&outcomes, "a"), Duration::from_secs(1), key(), t0);

        let session = table.resolve(id).unwrap();
        session.complete(Ok(Reply::new(Value::from(1))));
        assert!(table.resolve(id).is_none());
        assert_eq!(table.sweep(t0 + Duration::from_secs(10)), 0);

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].1.is_ok());
    }

    #[test]
    fn sweep_connection_only_touches_that_connection() {
        let table = SessionTable::new();
        let outcomes = Outcomes::default();
        let t0 = Instant::now();
        let other = ConnectionKey::new("mem:other");
        table.register_at(recorder(&outcomes, "mine"), Duration::from_secs(1), key(), t0);
        table.register_at(recorder(&outcomes, "theirs"), Duration::from_secs(1), other.clone(), t0);

        assert_eq!(table.sweep_connection(t0 + Duration::from_secs(2), &key()), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(outcomes.lock()[0].0, "mine");
        assert_eq!(table.sweep_connection(t0 + Duration::from_secs(2), &other), 1);
    }

    #[test]
    fn withdrawn_session_never_runs_its_callback() {
        let table = SessionTable::new();
        let outcomes = Outcomes::default();
        let t0 = Instant::now();
        let id = table.register_at(recorder(&outcomes, "a"), Duration::from_secs(1), key(), t0);

        assert!(table.withdraw(id));
        assert!(!table.withdraw(id));
        table.sweep(t0 + Duration::from_secs(10));
        assert!(outcomes.lock().is_empty());
    }

    #[test]
    fn callback_may_register_new_sessions_during_sweep() {
        let table = Arc::new(SessionTable::new());
        let t0 = Instant::now();
        let inner = Arc::clone(&table);
        let callback: ReplyCallback = Box::new(move |_| {
            inner.register_at(Box::new(|_| {}), Duration::from_secs(1), key(), t0);
        });
        table.register_at(callback, Duration::from_secs(1), key(), t0);

        assert_eq!(table.sweep(t0 + Duration::from_secs(1)), 1);
        assert!(table.contains(2));
    }

    #[test]
    fn concurrent_registration_yields_unique_ids() {
        let table = Arc::new(SessionTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..250)
                        .map(|_| table.register(Box::new(|_| {}), Duration::from_secs(5), key()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 2_000);
        assert_eq!(table.len(), 2_000);
    }

    #[test]
    fn panicking_timeout_callback_does_not_lose_the_others() {
        let table = SessionTable::new();
        let outcomes = Outcomes::default();
        let t0 = Instant::now();
        table.register_at(
            Box::new(|_| panic!("callback failure")),
            Duration::from_secs(1),
            key(),
            t0,
        );
        for label in ["b", "c", "d"] {
            table.register_at(recorder(&outcomes, label), Duration::from_secs(1), key(), t0);
        }

        assert_eq!(table.sweep(t0 + Duration::from_secs(2)), 4);
        assert!(table.is_empty());

        let mut fired: Vec<_> = outcomes.lock().iter().map(|(label, _)| *label).collect();
        fired.sort_unstable();
        assert_eq!(fired, vec!["b", "c", "d"]);
    }

    #[test]
    fn reply_decodes_typed_payload() {
        let reply = Reply::new(Value::Array(vec![Value::from("a"), Value::from(2)]));
        let (s, n): (String, u32) = reply.decode().unwrap();
        assert_eq!((s.as_str(), n), ("a", 2));

        let reply = Reply::new(Value::from("not a number"));
        assert!(matches!(reply.decode::<u32>(), Err(RpcError::Codec(_))));
    }

    proptest! {
        #[test]
        fn interleaved_register_and_resolve_never_reuses_ids(
            ops in proptest::collection::vec(any::<bool>(), 1..200)
        ) {
            let table = SessionTable::new();
            let mut issued = HashSet::new();
            let mut pending = Vec::new();
            let mut last = 0;
            for register in ops {
                if register || pending.is_empty() {
                    let id = table.register(Box::new(|_| {}), Duration::from_secs(5), key());
                    prop_assert!(id > last);
                    prop_assert!(issued.insert(id));
                    last = id;
                    pending.push(id);
                } else {
                    let id = pending.remove(0);
                    prop_assert!(table.resolve(id).is_some());
                }
            }
            prop_assert_eq!(table.len(), pending.len());
        }

        #[test]
        fn never_expires_before_budget(budget_ms in 1_000u64..10_000, early_ms in 0u64..1_000) {
            let table = SessionTable::new();
            let t0 = Instant::now();
            table.register_at(Box::new(|_| {}), Duration::from_millis(budget_ms), key(), t0);
            let probe = t0 + Duration::from_millis(budget_ms.saturating_sub(early_ms + 1));
            prop_assert_eq!(table.sweep(probe), 0);
            prop_assert_eq!(table.sweep(t0 + Duration::from_millis(budget_ms)), 1);
        }
    }
}
