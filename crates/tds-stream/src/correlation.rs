//! Request/response correlation.
//!
//! Every command is stamped with the next id from a per-session counter
//! (starting at zero) and its completion callback is parked here until the
//! matching response arrives. The table itself holds no lock; the session
//! wraps it in a mutex and always invokes callbacks *after* releasing it, so a
//! callback may send further commands without deadlocking.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tds_core::error::{Result, TdsError};
use tracing::error;

use crate::proto::Response;

/// One-shot completion for a request: the response, or the error that ended
/// the wait (timeout, session closed, transport failure).
pub type ResponseCallback = Box<dyn FnOnce(Result<Response>) + Send>;

struct Pending {
    callback: ResponseCallback,
    issued_at: Instant,
}

/// In-flight requests keyed by correlation id.
pub struct CorrelationTable {
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Assign the next id and park `callback` under it.
    pub fn register(&mut self, callback: ResponseCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            Pending {
                callback,
                issued_at: Instant::now(),
            },
        );
        id
    }

    /// Remove and return the callback for `id`, if still pending.
    ///
    /// A second call for the same id returns `None`, so each callback runs at
    /// most once. Unknown ids (late or duplicate acknowledgements) also
    /// return `None`.
    pub fn take(&mut self, id: u64) -> Option<ResponseCallback> {
        self.pending.remove(&id).map(|p| p.callback)
    }

    /// Remove every entry older than `timeout`.
    pub fn expire(&mut self, timeout: Duration) -> Vec<(u64, ResponseCallback)> {
        let now = Instant::now();
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.issued_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p.callback)))
            .collect()
    }

    /// Remove every entry, e.g. when the session closes.
    pub fn drain(&mut self) -> Vec<(u64, ResponseCallback)> {
        self.pending.drain().map(|(id, p)| (id, p.callback)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `callback` with `result`. A panic inside it is logged and contained.
pub(crate) fn complete(id: u64, callback: ResponseCallback, result: Result<Response>) {
    if panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        error!("[correlation] callback for request #{id} panicked");
    }
}

/// Deliver `err` to each drained callback.
pub(crate) fn fail_all(entries: Vec<(u64, ResponseCallback)>, err: impl Fn(u64) -> TdsError) {
    for (id, callback) in entries {
        complete(id, callback, Err(err(id)));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::proto::decode_frame;

    fn counting(counter: &Arc<AtomicUsize>) -> ResponseCallback {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn response(id: u64) -> Response {
        let text = format!(
            r#"{{"response":[{{"service":"ADMIN","command":"QOS","timestamp":1,"requestid":"{id}","content":{{"code":0}}}}]}}"#
        );
        decode_frame(&text).unwrap().responses.remove(0)
    }

    #[test]
    fn ids_start_at_zero_and_strictly_increase() {
        let mut table = CorrelationTable::new();
        let ids: Vec<u64> = (0..50).map(|_| table.register(Box::new(|_| {}))).collect();
        assert_eq!(ids[0], 0);
        assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(table.len(), 50);
    }

    #[test]
    fn each_id_is_fulfilled_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = CorrelationTable::new();
        let id = table.register(counting(&calls));

        if let Some(cb) = table.take(id) {
            cb(Ok(response(id)));
        }
        assert!(table.take(id).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut table = CorrelationTable::new();
        table.register(Box::new(|_| {}));
        assert!(table.take(99).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fulfilled_ids_are_never_reused() {
        let mut table = CorrelationTable::new();
        let first = table.register(Box::new(|_| {}));
        table.take(first);
        let second = table.register(Box::new(|_| {}));
        assert!(second > first);
    }

    #[test]
    fn expire_only_removes_stale_entries() {
        let mut table = CorrelationTable::new();
        let old = table.register(Box::new(|_| {}));
        std::thread::sleep(Duration::from_millis(30));
        let fresh = table.register(Box::new(|_| {}));

        let expired = table.expire(Duration::from_millis(20));
        assert_eq!(expired.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![old]);
        assert!(table.take(fresh).is_some());
    }

    #[test]
    fn panicking_callback_does_not_stop_the_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = CorrelationTable::new();
        table.register(Box::new(|_| panic!("callback failure")));
        table.register(counting(&calls));
        table.register(counting(&calls));

        fail_all(table.drain(), |_| TdsError::SessionClosed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drained_callbacks_receive_the_error() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut table = CorrelationTable::new();
        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            table.register(Box::new(move |r| seen.lock().push(r.err())));
        }
        fail_all(table.drain(), |id| TdsError::Timeout { request_id: id });

        let mut seen = seen.lock().clone();
        seen.sort_by_key(|e| match e {
            Some(TdsError::Timeout { request_id }) => *request_id,
            _ => u64::MAX,
        });
        assert_eq!(
            seen,
            (0..3).map(|id| Some(TdsError::Timeout { request_id: id })).collect::<Vec<_>>()
        );
    }
}
