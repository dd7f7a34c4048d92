//! In-flight requests to one peer.
//!
//! Each entry is removed from the table before its responder fires, so a
//! request is resolved exactly once: by a response, by [`RequestTable::expire`]
//! or by [`RequestTable::close`], whichever takes it first.

use std::collections::HashMap;

use hexchain_core::{HexBlock, HexHeader};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::RequestError;

/// Body of a response, matched to its request by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Block(Option<HexBlock>),
    Header(Option<HexHeader>),
}

pub type ResponseReceiver = oneshot::Receiver<Result<Response, RequestError>>;

struct Pending {
    deadline: Instant,
    responder: oneshot::Sender<Result<Response, RequestError>>,
}

struct Inner {
    next_id: u64,
    pending: HashMap<u64, Pending>,
    closed: bool,
}

pub struct RequestTable {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RequestTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                pending: HashMap::new(),
                closed: false,
            }),
            capacity,
        }
    }

    /// Reserve an id for a request that fails at `deadline`.
    pub fn register(&self, deadline: Instant) -> Result<(u64, ResponseReceiver), RequestError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RequestError::PeerDisconnected);
        }
        if inner.pending.len() >= self.capacity {
            return Err(RequestError::TooManyRequests);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let (responder, rx) = oneshot::channel();
        inner.pending.insert(id, Pending { deadline, responder });
        Ok((id, rx))
    }

    /// Deliver a response. False if the id is unknown or already resolved.
    pub fn resolve(&self, id: u64, response: Response) -> bool {
        let Some(pending) = self.inner.lock().pending.remove(&id) else {
            return false;
        };
        // The caller may have given up waiting; the entry is gone either way.
        let _ = pending.responder.send(Ok(response));
        true
    }

    /// Drop a request without resolving it, e.g. when it was never sent.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.lock().pending.remove(&id).is_some()
    }

    /// Fail every request whose deadline is at or before `now`. Returns the
    /// number failed.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<Pending> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| inner.pending.remove(id)).collect()
        };
        let count = expired.len();
        for pending in expired {
            let _ = pending.responder.send(Err(RequestError::TimedOut));
        }
        count
    }

    /// Fail everything pending and refuse new requests.
    pub fn close(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.responder.send(Err(RequestError::PeerDisconnected));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn expires_exactly_once() {
        let table = RequestTable::new(8);
        let now = Instant::now();
        let (_, mut rx) = table.register(now + Duration::from_secs(30)).unwrap();

        assert_eq!(table.expire(now + Duration::from_secs(29)), 0);
        assert_eq!(table.expire(now + Duration::from_secs(30)), 1);
        assert_eq!(table.expire(now + Duration::from_secs(60)), 0);
        assert_eq!(table.close(), 0);

        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::TimedOut));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_beats_expiry() {
        let table = RequestTable::new(8);
        let now = Instant::now();
        let (id, rx) = table.register(now).unwrap();

        assert!(table.resolve(id, Response::Header(None)));
        assert!(!table.resolve(id, Response::Header(None)));
        assert_eq!(table.expire(now + Duration::from_secs(1)), 0);
        assert_eq!(rx.await.unwrap(), Ok(Response::Header(None)));
    }

    #[tokio::test]
    async fn close_fails_pending_and_refuses_new() {
        let table = RequestTable::new(8);
        let deadline = Instant::now() + Duration::from_secs(30);
        let (_, a) = table.register(deadline).unwrap();
        let (_, b) = table.register(deadline).unwrap();

        assert_eq!(table.close(), 2);
        assert!(table.is_empty());
        assert_eq!(a.await.unwrap(), Err(RequestError::PeerDisconnected));
        assert_eq!(b.await.unwrap(), Err(RequestError::PeerDisconnected));
        assert_eq!(table.register(deadline).unwrap_err(), RequestError::PeerDisconnected);
    }

    #[test]
    fn capacity_is_enforced() {
        let table = RequestTable::new(2);
        let deadline = Instant::now();
        let (first, _a) = table.register(deadline).unwrap();
        let _b = table.register(deadline).unwrap();
        assert_eq!(table.register(deadline).unwrap_err(), RequestError::TooManyRequests);

        assert!(table.cancel(first));
        assert!(table.register(deadline).is_ok());
        assert_eq!(table.len(), 2);
    }
}
