//! Shared server state.
//!
//! One [`ServiceState`] is created when a process wins the election and is
//! shared (via `Arc`) by the listener, every connection handler and the
//! coordinator. The endpoint map is the only mutable state handlers touch,
//! and every access to it goes through one mutex.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{deadline_after, ServiceConfig};
use crate::map::EndpointMap;
use crate::protocol::{Reply, Request};

/// Deadline after which an idle service may exit.
#[derive(Debug)]
pub struct IdleTimer {
    deadline: Mutex<Instant>,
}

impl IdleTimer {
    /// Start a timer expiring `period` from now.
    pub fn new(period: Duration) -> Self {
        Self {
            deadline: Mutex::new(deadline_after(period)),
        }
    }

    /// Push the deadline to at least `now + period`. Never shortens it.
    pub fn extend(&self, period: Duration) {
        let candidate = deadline_after(period);
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        if candidate > *deadline {
            *deadline = candidate;
        }
    }

    /// Current deadline.
    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// State shared by the listener, handlers and coordinator.
#[derive(Debug)]
pub struct ServiceState {
    map: Mutex<EndpointMap>,
    live_handlers: AtomicUsize,
    live: AtomicBool,
    activity: Notify,
    idle: IdleTimer,
    idle_timeout: Duration,
    io_timeout: Duration,
}

impl ServiceState {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            map: Mutex::new(EndpointMap::new()),
            live_handlers: AtomicUsize::new(0),
            live: AtomicBool::new(false),
            activity: Notify::new(),
            idle: IdleTimer::new(config.idle_timeout()),
            idle_timeout: config.idle_timeout(),
            io_timeout: config.io_timeout(),
        }
    }

    /// Lock the endpoint map.
    ///
    /// A handler that panicked while holding the lock leaves the map in a
    /// consistent state (every operation is a single insert/remove), so a
    /// poisoned lock is recovered rather than propagated.
    pub fn map(&self) -> MutexGuard<'_, EndpointMap> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute a decoded request against the map and build its reply.
    pub fn dispatch(&self, request: &Request) -> Reply {
        match request {
            Request::Liveness { timeout_ms } => {
                let period = Duration::from_millis(u64::from(*timeout_ms));
                self.idle.extend(period);
                info!(timeout_ms, "Liveness notification, idle deadline extended");
                Reply::ok()
            }
            Request::RegisterEndpoints {
                iface,
                payload,
                no_replace,
            } => {
                let mut map = self.map();
                for binding in &payload.bindings {
                    debug!(
                        %iface,
                        protseq = %binding.protocol_sequence,
                        endpoint = %binding.endpoint,
                        objects = payload.objects.len(),
                        no_replace,
                        "Register endpoint"
                    );
                    map.register(
                        iface,
                        &binding.protocol_sequence,
                        &binding.endpoint,
                        &payload.objects,
                        *no_replace,
                    );
                }
                Reply::ok()
            }
            Request::UnregisterEndpoints { iface, payload } => {
                let mut map = self.map();
                for binding in &payload.bindings {
                    let removed =
                        map.unregister(iface, &binding.protocol_sequence, &payload.objects);
                    debug!(
                        %iface,
                        protseq = %binding.protocol_sequence,
                        removed,
                        "Unregister endpoint"
                    );
                }
                Reply::ok()
            }
            Request::ResolveEndpoint {
                iface,
                object,
                protocol_sequence,
            } => {
                let endpoint = self.map().resolve(iface, protocol_sequence, object);
                debug!(
                    %iface,
                    %object,
                    protseq = %protocol_sequence,
                    found = endpoint.is_some(),
                    "Resolve endpoint"
                );
                Reply::Endpoint(endpoint)
            }
        }
    }

    /// Whether the server is accepting connections.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    /// Number of connection handlers currently running.
    pub fn live_handlers(&self) -> usize {
        self.live_handlers.load(Ordering::Acquire)
    }

    /// Count a new handler. The count drops when the guard is dropped.
    pub fn handler_started(self: &Arc<Self>) -> HandlerGuard {
        self.live_handlers.fetch_add(1, Ordering::AcqRel);
        HandlerGuard {
            state: Arc::clone(self),
        }
    }

    /// Record that a connection was accepted.
    pub fn record_activity(&self) {
        self.idle.extend(self.idle_timeout);
        self.activity.notify_one();
    }

    /// Wait for the next recorded activity.
    pub async fn activity(&self) {
        self.activity.notified().await;
    }

    pub fn idle(&self) -> &IdleTimer {
        &self.idle
    }

    /// Per-frame I/O timeout for connection handlers.
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
}

/// Decrements the live-handler counter on drop.
#[derive(Debug)]
pub struct HandlerGuard {
    state: Arc<ServiceState>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.state.live_handlers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{InterfaceId, ObjectId};
    use crate::protocol::{bindings, TrailingPayload};
    use uuid::Uuid;

    fn state() -> Arc<ServiceState> {
        Arc::new(ServiceState::new(&ServiceConfig::default()))
    }

    fn iface() -> InterfaceId {
        InterfaceId::new(Uuid::from_u128(0x42), 1, 0)
    }

    fn resolve(state: &ServiceState, protseq: &str) -> Reply {
        state.dispatch(&Request::ResolveEndpoint {
            iface: iface(),
            object: ObjectId::NIL,
            protocol_sequence: protseq.to_string(),
        })
    }

    #[test]
    fn test_register_every_binding() {
        let state = state();
        let reply = state.dispatch(&Request::RegisterEndpoints {
            iface: iface(),
            payload: TrailingPayload::new(
                vec![],
                bindings([("ncacn_np", r"\pipe\a"), ("ncalrpc", "lrpc-a")]),
            ),
            no_replace: false,
        });

        assert_eq!(reply, Reply::ok());
        assert_eq!(resolve(&state, "ncacn_np"), Reply::Endpoint(Some(r"\pipe\a".into())));
        assert_eq!(resolve(&state, "ncalrpc"), Reply::Endpoint(Some("lrpc-a".into())));
    }

    #[test]
    fn test_unregister_ignores_endpoint_strings() {
        let state = state();
        state.dispatch(&Request::RegisterEndpoints {
            iface: iface(),
            payload: TrailingPayload::new(vec![], bindings([("ncacn_np", r"\pipe\a")])),
            no_replace: false,
        });
        let reply = state.dispatch(&Request::UnregisterEndpoints {
            iface: iface(),
            payload: TrailingPayload::new(vec![], bindings([("ncacn_np", "whatever")])),
        });

        assert_eq!(reply, Reply::ok());
        assert_eq!(resolve(&state, "ncacn_np"), Reply::Endpoint(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_extends_idle_deadline() {
        let state = state();
        let before = state.idle().deadline();

        state.dispatch(&Request::Liveness { timeout_ms: 3_600_000 });

        assert!(state.idle().deadline() > before);
        assert_eq!(state.map().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_never_shortens() {
        let timer = IdleTimer::new(Duration::from_secs(60));
        let deadline = timer.deadline();

        timer.extend(Duration::from_secs(1));
        assert_eq!(timer.deadline(), deadline);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_accepts_unbounded_periods() {
        let timer = IdleTimer::new(Duration::MAX);
        timer.extend(Duration::MAX);
        assert!(!timer.is_expired());

        let state = state();
        state.dispatch(&Request::Liveness { timeout_ms: u32::MAX });
        assert!(!state.idle().is_expired());
    }

    #[test]
    fn test_handler_guard_counts() {
        let state = state();
        let a = state.handler_started();
        let b = state.handler_started();
        assert_eq!(state.live_handlers(), 2);

        drop(a);
        assert_eq!(state.live_handlers(), 1);
        drop(b);
        assert_eq!(state.live_handlers(), 0);
    }

    #[tokio::test]
    async fn test_activity_is_not_lost() {
        let state = state();
        state.record_activity();

        // notify_one stores a permit when nobody is waiting yet
        tokio::time::timeout(Duration::from_secs(1), state.activity())
            .await
            .unwrap();
    }
}
