//! Self-healing access to a traversal session.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::session::{TraversalDialer, TraversalSession};
use crate::error::Result;

/// Lifecycle of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    /// No session.
    Disconnected,
    /// A dial is in progress.
    Connecting,
    /// The last probe or dial succeeded.
    Healthy,
    /// The session failed and is re-dialed on the next access.
    Unhealthy,
}

impl fmt::Display for TraversalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TraversalState::Disconnected => "disconnected",
            TraversalState::Connecting => "connecting",
            TraversalState::Healthy => "healthy",
            TraversalState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

struct Slot {
    session: Option<Arc<dyn TraversalSession>>,
    state: TraversalState,
}

/// Hands out a live session, re-dialing when the current one stops
/// answering.
pub struct TraversalClient {
    dialer: Arc<dyn TraversalDialer>,
    slot: Mutex<Slot>,
    state: parking_lot::Mutex<TraversalState>,
}

impl TraversalClient {
    /// Client that dials lazily on the first [`get`](Self::get).
    pub fn new(dialer: Arc<dyn TraversalDialer>) -> Self {
        Self {
            dialer,
            slot: Mutex::new(Slot {
                session: None,
                state: TraversalState::Disconnected,
            }),
            state: parking_lot::Mutex::new(TraversalState::Disconnected),
        }
    }

    /// Current state.
    pub fn state(&self) -> TraversalState {
        *self.state.lock()
    }

    fn set_state(&self, slot: &mut Slot, state: TraversalState) {
        slot.state = state;
        *self.state.lock() = state;
    }

    /// A healthy session. The current one is probed first; when the probe
    /// fails it is closed and exactly one new dial is made. Concurrent
    /// callers wait for each other, so a failure never triggers parallel
    /// dials.
    pub async fn get(&self) -> Result<Arc<dyn TraversalSession>> {
        let mut slot = self.slot.lock().await;

        if slot.state == TraversalState::Healthy {
            if let Some(session) = slot.session.clone() {
                match session.binding().await {
                    Ok(_) => return Ok(session),
                    Err(e) => {
                        warn!(server = %session.server(), error = %e, "traversal session probe failed");
                        self.set_state(&mut slot, TraversalState::Unhealthy);
                    }
                }
            }
        }

        if let Some(old) = slot.session.take() {
            if let Err(e) = old.close().await {
                debug!(error = %e, "closing stale traversal session failed");
            }
        }

        self.set_state(&mut slot, TraversalState::Connecting);
        match self.dialer.dial().await {
            Ok(session) => {
                info!(server = %session.server(), "traversal session ready");
                slot.session = Some(Arc::clone(&session));
                self.set_state(&mut slot, TraversalState::Healthy);
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "traversal dial failed");
                self.set_state(&mut slot, TraversalState::Disconnected);
                Err(e)
            }
        }
    }

    /// Force a re-dial on the next [`get`](Self::get).
    pub async fn mark_unhealthy(&self) {
        let mut slot = self.slot.lock().await;
        if slot.session.is_some() {
            self.set_state(&mut slot, TraversalState::Unhealthy);
        }
    }

    /// Drop the session.
    pub async fn close(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let old = slot.session.take();
        self.set_state(&mut slot, TraversalState::Disconnected);
        match old {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::traversal::AllocateOutcome;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) struct MockSession {
        pub alive: AtomicBool,
        pub allocations: AtomicUsize,
        pub closed: AtomicBool,
    }

    #[async_trait]
    impl TraversalSession for MockSession {
        fn server(&self) -> String {
            "mock:3478".into()
        }

        async fn binding(&self) -> Result<SocketAddr> {
            if self.alive.load(Ordering::SeqCst) {
                Ok("198.51.100.7:50000".parse().unwrap())
            } else {
                Err(Error::network("no answer"))
            }
        }

        async fn allocate(&self) -> Result<AllocateOutcome> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(Error::network("no answer"));
            }
            if self.allocations.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(AllocateOutcome::Allocated("203.0.113.5:49152".parse().unwrap()))
            } else {
                Ok(AllocateOutcome::AlreadyAllocated)
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingDialer {
        pub dials: AtomicUsize,
        pub fail: AtomicBool,
        pub sessions: parking_lot::Mutex<Vec<Arc<MockSession>>>,
    }

    impl CountingDialer {
        pub fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        pub fn last(&self) -> Arc<MockSession> {
            Arc::clone(self.sessions.lock().last().unwrap())
        }
    }

    #[async_trait]
    impl TraversalDialer for CountingDialer {
        async fn dial(&self) -> Result<Arc<dyn TraversalSession>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::network("server down"));
            }
            let session = Arc::new(MockSession {
                alive: AtomicBool::new(true),
                allocations: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            });
            self.sessions.lock().push(Arc::clone(&session));
            Ok(session)
        }
    }

    #[tokio::test]
    async fn healthy_session_is_reused() {
        let dialer = Arc::new(CountingDialer::default());
        let client = TraversalClient::new(dialer.clone());
        assert_eq!(client.state(), TraversalState::Disconnected);

        client.get().await.unwrap();
        client.get().await.unwrap();
        assert_eq!(dialer.dials(), 1);
        assert_eq!(client.state(), TraversalState::Healthy);
    }

    #[tokio::test]
    async fn forced_unhealthy_redials_exactly_once() {
        let dialer = Arc::new(CountingDialer::default());
        let client = TraversalClient::new(dialer.clone());
        client.get().await.unwrap();
        let first = dialer.last();

        client.mark_unhealthy().await;
        assert_eq!(client.state(), TraversalState::Unhealthy);
        client.get().await.unwrap();
        client.get().await.unwrap();
        assert_eq!(dialer.dials(), 2);
        assert!(first.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_probe_triggers_redial() {
        let dialer = Arc::new(CountingDialer::default());
        let client = Arc::new(TraversalClient::new(dialer.clone()));
        client.get().await.unwrap();
        dialer.last().alive.store(false, Ordering::SeqCst);

        let (a, b) = tokio::join!(client.get(), client.get());
        a.unwrap();
        b.unwrap();
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn dial_failure_leaves_client_disconnected() {
        let dialer = Arc::new(CountingDialer::default());
        dialer.fail.store(true, Ordering::SeqCst);
        let client = TraversalClient::new(dialer.clone());
        assert!(client.get().await.is_err());
        assert_eq!(client.state(), TraversalState::Disconnected);

        dialer.fail.store(false, Ordering::SeqCst);
        client.get().await.unwrap();
        assert_eq!(dialer.dials(), 2);
    }
}
