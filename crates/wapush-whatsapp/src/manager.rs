//! Session lifecycle manager
//!
//! Owns the per-session state machines, the live handle registry and the
//! timers. Transport events and timer expiries are fed through
//! [`transition`] and the resulting effects are executed here.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use wapush_core::store::{lock, SharedStore};
use wapush_core::SessionConfig;

use crate::backoff::BackoffPolicy;
use crate::error::{Result, WhatsAppError};
use crate::forwarder::WebhookForwarder;
use crate::machine::{transition, Effect, SessionEvent, SessionMachine, SessionState, StatusUpdate};
use crate::registry::{LiveSession, SessionRegistry};
use crate::timer::{TimerKind, TimerSet};
use crate::transport::{
    AuthCompleteness, AuthState, CloseReason, InboundMessage, Transport, TransportEvent,
};

const STATUS_CHANNEL_CAPACITY: usize = 256;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// How a pairing attempt treats existing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairMode {
    /// Reuse stored credentials
    Resume,
    /// Log out first so a fresh QR code is shown
    Fresh,
    /// Timer-driven retry; an open failure counts toward the backoff
    Reconnect,
}

/// Snapshot of one session for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub connected: bool,
    pub consecutive_failures: u32,
}

/// Cheaply cloneable handle to the shared manager state
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn SessionRegistry>,
    store: SharedStore,
    forwarder: Option<Arc<WebhookForwarder>>,
    machines: Mutex<HashMap<String, SessionMachine>>,
    timers: TimerSet,
    next_generation: AtomicU64,
    status_tx: broadcast::Sender<StatusUpdate>,
    /// Serializes pairing and logout per session
    pairing_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Bumped on logout. Timers armed under an older epoch do nothing.
    epochs: DashMap<String, u64>,
    qr_timeout: Duration,
    backoff: BackoffPolicy,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn SessionRegistry>,
        store: SharedStore,
        config: &SessionConfig,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                store,
                forwarder: None,
                machines: Mutex::new(HashMap::new()),
                timers: TimerSet::new(),
                next_generation: AtomicU64::new(1),
                status_tx,
                pairing_locks: DashMap::new(),
                epochs: DashMap::new(),
                qr_timeout: config.qr_timeout(),
                backoff: BackoffPolicy::default(),
            }),
        }
    }

    /// Forward inbound messages through `forwarder`. Call before cloning.
    pub fn with_forwarder(mut self, forwarder: Arc<WebhookForwarder>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.forwarder = Some(forwarder),
            None => warn!("SessionManager already shared, forwarder not installed"),
        }
        self
    }

    /// Replace the reconnect policy. Call before cloning.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.backoff = backoff,
            None => warn!("SessionManager already shared, backoff policy not installed"),
        }
        self
    }

    /// Open (or reopen) the connection for a session.
    ///
    /// Any existing handle is torn down first. With `force_new` the stored
    /// credentials and the failure counter are discarded as well, so the
    /// transport has to show a fresh QR code.
    pub async fn start_pairing(&self, session_id: &str, force_new: bool) -> Result<()> {
        let mode = if force_new {
            PairMode::Fresh
        } else {
            PairMode::Resume
        };
        let pairing = self.inner.pairing_lock(session_id);
        let _guard = pairing.lock().await;
        self.inner.pair(session_id, mode).await
    }

    /// Disconnect and forget a session. Safe to call for unknown ids.
    pub async fn logout(&self, session_id: &str) -> Result<()> {
        let pairing = self.inner.pairing_lock(session_id);
        let _guard = pairing.lock().await;
        self.inner.logout_inner(session_id).await;
        Ok(())
    }

    pub fn status(&self, session_id: &str) -> SessionStatus {
        let machine = self.inner.machine(session_id);
        SessionStatus {
            session_id: session_id.to_string(),
            state: machine.state,
            connected: self.is_connected(session_id),
            consecutive_failures: machine.failures,
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.inner.registry.contains(session_id)
            && self.inner.machine(session_id).state == SessionState::Open
    }

    /// Subscribe to QR / connected / error notifications of all sessions
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.status_tx.subscribe()
    }

    pub fn live_sessions(&self) -> Vec<String> {
        self.inner.registry.session_ids()
    }

    /// Send a text message through a connected session
    pub async fn send_text(&self, session_id: &str, recipient: &str, content: &str) -> Result<String> {
        let live = self.connected_handle(session_id)?;
        live.handle.send(recipient, content).await
    }

    /// Look up whether `phone` has a WhatsApp account
    pub async fn check_registered(&self, session_id: &str, phone: &str) -> Result<Option<String>> {
        let live = self.connected_handle(session_id)?;
        live.handle.check_registered(phone).await
    }

    /// Stop every timer and close every live handle, keeping credentials
    pub async fn shutdown(&self) {
        for session_id in self.inner.registry.session_ids() {
            self.inner.timers.cancel_session(&session_id);
            self.inner.release(&session_id, None).await;
        }
        info!("Session manager stopped");
    }

    fn connected_handle(&self, session_id: &str) -> Result<LiveSession> {
        if !self.is_connected(session_id) {
            return Err(WhatsAppError::NotConnected(session_id.to_string()));
        }
        self.inner
            .registry
            .get(session_id)
            .ok_or_else(|| WhatsAppError::NotConnected(session_id.to_string()))
    }
}

impl Inner {
    fn pairing_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.pairing_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn epoch(&self, session_id: &str) -> u64 {
        self.epochs.get(session_id).map(|epoch| *epoch).unwrap_or(0)
    }

    fn machine(&self, session_id: &str) -> SessionMachine {
        self.machines
            .lock()
            .ok()
            .and_then(|m| m.get(session_id).copied())
            .unwrap_or_default()
    }

    fn set_state(&self, session_id: &str, state: SessionState) {
        if let Ok(mut machines) = self.machines.lock() {
            machines.entry(session_id.to_string()).or_default().state = state;
        }
    }

    fn forget_machine(&self, session_id: &str) {
        if let Ok(mut machines) = self.machines.lock() {
            machines.remove(session_id);
        }
    }

    /// Caller holds the session's pairing lock
    async fn pair(self: &Arc<Self>, session_id: &str, mode: PairMode) -> Result<()> {
        if mode == PairMode::Fresh {
            self.logout_inner(session_id).await;
        } else {
            self.timers.cancel(session_id, TimerKind::Reconnect);
            self.release(session_id, None).await;
        }

        let auth = self.load_auth(session_id).await?;
        info!(session_id = %session_id, ?mode, "Starting pairing");
        self.apply(session_id, None, SessionEvent::PairingStarted).await;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = match self.transport.open(session_id, auth, events_tx).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(session_id = %session_id, "Failed to open transport: {}", e);
                let reason = e.to_string();
                let event = match mode {
                    PairMode::Reconnect => {
                        SessionEvent::Closed(CloseReason::ConnectionFailure(reason.clone()))
                    }
                    PairMode::Resume | PairMode::Fresh => SessionEvent::PairingFailed(reason.clone()),
                };
                self.apply(session_id, None, event).await;
                return Err(WhatsAppError::Pairing {
                    session_id: session_id.to_string(),
                    reason,
                });
            }
        };

        let live = LiveSession::new(Arc::from(handle), generation);
        if let Some(displaced) = self.registry.insert(session_id, live) {
            warn!(session_id = %session_id, "Displaced a live handle while pairing");
            end_and_close(session_id, &displaced).await;
        }
        self.persist(session_id, "connecting", None, false);

        tokio::spawn(run_events(
            Arc::downgrade(self),
            session_id.to_string(),
            generation,
            events_rx,
        ));
        Ok(())
    }

    /// Load credentials, discarding a half-finished pairing
    async fn load_auth(&self, session_id: &str) -> Result<AuthState> {
        let auth = self.transport.load_auth_state(session_id).await?;
        if auth.completeness() != AuthCompleteness::Partial {
            return Ok(auth);
        }
        warn!(session_id = %session_id, "Credentials without identity, starting over");
        self.transport.clear_auth_state(session_id).await?;
        Ok(AuthState::empty())
    }

    async fn logout_inner(&self, session_id: &str) {
        // 発火済みで lock 待ちのタイマーは abort できないので epoch で無効化する
        *self.epochs.entry(session_id.to_string()).or_default() += 1;
        self.timers.cancel_session(session_id);
        self.release(session_id, None).await;
        if let Err(e) = self.transport.clear_auth_state(session_id).await {
            warn!(session_id = %session_id, "Failed to clear credentials: {}", e);
        }
        self.forget_machine(session_id);
        self.persist(session_id, "disconnected", None, false);
        info!(session_id = %session_id, "Session logged out");
    }

    /// Drop the live handle. With a generation, only that handle is released.
    async fn release(&self, session_id: &str, generation: Option<u64>) {
        let removed = match generation {
            Some(generation) => self.registry.remove_generation(session_id, generation),
            None => self.registry.remove(session_id),
        };
        if let Some(live) = removed {
            end_and_close(session_id, &live).await;
        }
    }

    fn persist(&self, session_id: &str, status: &str, phone_number: Option<&str>, connected: bool) {
        let result = lock(&self.store).and_then(|store| {
            store.upsert_session_status(session_id, status, phone_number, connected.then(Utc::now))
        });
        if let Err(e) = result {
            warn!(session_id = %session_id, "Failed to persist session status: {}", e);
        }
    }

    fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.registry
            .get(session_id)
            .is_some_and(|live| live.generation == generation)
    }

    async fn apply(self: &Arc<Self>, session_id: &str, generation: Option<u64>, event: SessionEvent) {
        let effects = {
            let Ok(mut machines) = self.machines.lock() else {
                error!(session_id = %session_id, "Session table poisoned, dropping {:?}", event);
                return;
            };
            let current = machines.get(session_id).copied().unwrap_or_default();
            let (next, effects) = transition(session_id, current, &event, &self.backoff);
            debug!(
                session_id = %session_id,
                "{:?} -> {:?} on {:?}",
                current.state,
                next.state,
                event
            );
            machines.insert(session_id.to_string(), next);
            effects
        };

        for effect in effects {
            self.execute(session_id, generation, effect).await;
        }
    }

    async fn execute(self: &Arc<Self>, session_id: &str, generation: Option<u64>, effect: Effect) {
        match effect {
            Effect::StartQrWatchdog => {
                let task = timer_task(self, session_id, TimerKind::QrWatchdog);
                self.timers
                    .schedule(session_id, TimerKind::QrWatchdog, self.qr_timeout, task);
            }
            Effect::CancelQrWatchdog => {
                self.timers.cancel(session_id, TimerKind::QrWatchdog);
            }
            Effect::Broadcast(update) => {
                // 購読者がいなくてもエラーにしない
                let _ = self.status_tx.send(update);
            }
            Effect::PersistStatus {
                status,
                phone_number,
                connected,
            } => self.persist(session_id, status, phone_number.as_deref(), connected),
            Effect::ReleaseHandle => self.release(session_id, generation).await,
            Effect::DeleteAuthState => {
                if let Err(e) = self.transport.clear_auth_state(session_id).await {
                    warn!(session_id = %session_id, "Failed to clear credentials: {}", e);
                }
            }
            Effect::ScheduleReconnect(delay) => {
                info!(session_id = %session_id, "Reconnecting in {}ms", delay.as_millis());
                let task = timer_task(self, session_id, TimerKind::Reconnect);
                self.timers
                    .schedule(session_id, TimerKind::Reconnect, delay, task);
            }
            Effect::Abandon => {
                warn!(session_id = %session_id, "Giving up on session after repeated failures");
                self.timers.cancel_session(session_id);
                self.forget_machine(session_id);
            }
            Effect::Enter(state) => self.set_state(session_id, state),
            Effect::LogQrTimeout => {
                warn!(
                    session_id = %session_id,
                    "No QR code received within {}s of pairing start",
                    self.qr_timeout.as_secs()
                );
            }
        }
    }

    fn forward(&self, session_id: &str, message: InboundMessage) {
        let Some(forwarder) = self.forwarder.clone() else {
            debug!(session_id = %session_id, "No forwarder, ignoring inbound message");
            return;
        };
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match forwarder.forward(&session_id, &message).await {
                Ok(outcome) => debug!(session_id = %session_id, "Forward outcome: {:?}", outcome),
                Err(e) => warn!(
                    session_id = %session_id,
                    "Failed to forward message {}: {}",
                    message.message_id,
                    e
                ),
            }
        });
    }
}

/// Best-effort teardown: `end` and `close` failures are logged separately
async fn end_and_close(session_id: &str, live: &LiveSession) {
    if let Err(e) = live.handle.end().await {
        debug!(session_id = %session_id, "end() failed: {}", e);
    }
    if let Err(e) = live.handle.close() {
        debug!(session_id = %session_id, "close() failed: {}", e);
    }
}

/// Timer body, boxed so the manager's futures stay nameable.
///
/// Runs under the pairing lock and only if no logout happened since arming.
fn timer_task(inner: &Arc<Inner>, session_id: &str, kind: TimerKind) -> BoxedTask {
    let epoch = inner.epoch(session_id);
    let inner = Arc::downgrade(inner);
    let session_id = session_id.to_string();
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let pairing = inner.pairing_lock(&session_id);
        let _guard = pairing.lock().await;
        if inner.epoch(&session_id) != epoch {
            debug!(session_id = %session_id, ?kind, "Timer outlived a logout, skipping");
            return;
        }
        match kind {
            TimerKind::QrWatchdog => {
                inner.apply(&session_id, None, SessionEvent::QrTimeout).await;
            }
            TimerKind::Reconnect => {
                if let Err(e) = inner.pair(&session_id, PairMode::Reconnect).await {
                    warn!(session_id = %session_id, "Reconnect failed: {}", e);
                }
            }
        }
    })
}

async fn run_events(
    inner: Weak<Inner>,
    session_id: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let event = match event {
            TransportEvent::MessageReceived(message) => {
                if inner.is_current(&session_id, generation) {
                    inner.forward(&session_id, message);
                }
                continue;
            }
            TransportEvent::QrCode(code) => SessionEvent::QrCode(code),
            TransportEvent::ConnectionOpened { phone_number } => {
                info!(session_id = %session_id, "Connection open");
                SessionEvent::Opened { phone_number }
            }
            TransportEvent::ConnectionClosed(reason) => {
                info!(session_id = %session_id, "Connection closed: {:?}", reason);
                SessionEvent::Closed(reason)
            }
        };
        let closed = matches!(event, SessionEvent::Closed(_));

        // pair / logout と同じ lock の下で適用し、取得後に世代を確認し直す
        let pairing = inner.pairing_lock(&session_id);
        let _guard = pairing.lock().await;
        if !inner.is_current(&session_id, generation) {
            debug!(session_id = %session_id, generation, "Dropping event of a released handle");
            continue;
        }
        inner.apply(&session_id, Some(generation), event).await;
        if closed {
            break;
        }
    }
    debug!(session_id = %session_id, generation, "Event loop finished");
}
