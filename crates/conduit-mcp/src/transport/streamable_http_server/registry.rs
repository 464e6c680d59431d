//! Process-wide session registry and idle tracking.
//!
//! Sessions are addressed by the `Mcp-Session-Id` header value. A background
//! sweeper wakes on a fixed period, closes sessions that have been inactive
//! longer than the configured idle timeout, and keeps the number of inactive
//! sessions under a cap by evicting the most idle ones first.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use super::{auth::UserIdClaim, session::CommonChannel};
use crate::{
    error::TransportError,
    model::JsonRpcMessage,
    transport::Inbound,
};

pub type SessionId = Arc<str>;

pub const SWEEP_PERIOD: Duration = Duration::from_secs(5);

/// 16 random bytes, URL-safe base64 without padding.
pub fn session_id() -> SessionId {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes).into()
}

/// Monotonic "ticks" reader, substitutable in tests.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds from an arbitrary fixed origin. Never goes backwards.
    fn ticks(&self) -> u64;
}

#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn ticks(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// One live Streamable HTTP session.
pub struct HttpSession {
    id: SessionId,
    feed: mpsc::Sender<Inbound>,
    common: CommonChannel,
    user_claim: Option<UserIdClaim>,
    reference_count: AtomicI64,
    get_started: AtomicBool,
    last_activity: AtomicU64,
    closed: CancellationToken,
    run_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl HttpSession {
    pub(crate) fn new(
        id: SessionId,
        feed: mpsc::Sender<Inbound>,
        common: CommonChannel,
        user_claim: Option<UserIdClaim>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let last_activity = AtomicU64::new(clock.ticks());
        Arc::new(Self {
            id,
            feed,
            common,
            user_claim,
            reference_count: AtomicI64::new(0),
            get_started: AtomicBool::new(false),
            last_activity,
            closed: CancellationToken::new(),
            run_task: Mutex::new(None),
            clock,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn user_claim(&self) -> Option<&UserIdClaim> {
        self.user_claim.as_ref()
    }

    /// Cancelled when the session is disposed. The per-session server loop
    /// runs on a child of this token, so disposing the session, and nothing
    /// else, ends that loop.
    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) async fn set_run_task(&self, task: tokio::task::JoinHandle<()>) {
        *self.run_task.lock().await = Some(task);
    }

    /// Bind an HTTP request to the session for its duration.
    pub(crate) fn acquire(self: &Arc<Self>) -> ReferenceGuard {
        self.reference_count.fetch_add(1, Ordering::AcqRel);
        ReferenceGuard {
            session: self.clone(),
        }
    }

    fn release(&self) {
        if self.reference_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.last_activity
                .store(self.clock.ticks(), Ordering::Release);
        }
    }

    pub fn is_inactive(&self) -> bool {
        self.reference_count.load(Ordering::Acquire) == 0
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }

    /// One-shot switch for the server-push GET stream.
    pub(crate) fn try_start_get(&self) -> bool {
        self.get_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) async fn feed(&self, inbound: Inbound) -> Result<(), TransportError> {
        self.feed
            .send(inbound)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) async fn attach_push_stream(&self) -> mpsc::Receiver<JsonRpcMessage> {
        self.common.attach().await
    }

    /// Cancel the session loop, await it, and tear the channels down.
    /// Idempotent: the second call finds no run task and returns.
    pub async fn dispose(&self) {
        self.closed.cancel();
        let task = self.run_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.common.shutdown().await;
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("id", &self.id)
            .field(
                "reference_count",
                &self.reference_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Releases the session reference on drop; a drop to zero refreshes the
/// session's last-activity ticks.
pub struct ReferenceGuard {
    session: Arc<HttpSession>,
}

impl Drop for ReferenceGuard {
    fn drop(&mut self) {
        self.session.release();
    }
}

/// Concurrent map from session id to session, ordinal key comparison.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<HttpSession>>>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn try_add(&self, session: Arc<HttpSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return false;
        }
        sessions.insert(session.id().clone(), session);
        true
    }

    pub async fn try_get(&self, id: &str) -> Option<Arc<HttpSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn try_remove(&self, id: &str) -> Option<Arc<HttpSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<Arc<HttpSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn dispose_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in sessions {
            session.dispose().await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock::default()))
    }
}

/// Spawn the periodic idle sweeper.
///
/// If a sweep panics, every remaining session is disposed and the shutdown
/// token is cancelled so the host process can stop.
pub(crate) fn spawn_idle_sweeper(
    registry: Arc<SessionRegistry>,
    idle_timeout: Option<Duration>,
    max_idle_sessions: usize,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let sweep = std::panic::AssertUnwindSafe(sweep_once(
                &registry,
                idle_timeout,
                max_idle_sessions,
            ))
            .catch_unwind()
            .await;
            if sweep.is_err() {
                tracing::error!("idle sweeper failed, disposing all sessions and stopping");
                registry.dispose_all().await;
                shutdown.cancel();
                break;
            }
        }
    })
}

pub(crate) async fn sweep_once(
    registry: &Arc<SessionRegistry>,
    idle_timeout: Option<Duration>,
    max_idle_sessions: usize,
) {
    let now = registry.clock.ticks();
    let mut idle = Vec::new();
    for session in registry.snapshot().await {
        if !session.is_inactive() {
            continue;
        }
        let idle_for = now.saturating_sub(session.last_activity());
        if let Some(timeout) = idle_timeout {
            if idle_for > timeout.as_millis() as u64 {
                tracing::info!(id = %session.id(), idle_ms = idle_for, "closing idle session");
                close_session(registry, session).await;
                continue;
            }
        }
        idle.push(session);
    }
    if idle.len() > max_idle_sessions {
        tracing::error!(
            count = idle.len(),
            limit = max_idle_sessions,
            "idle session count exceeds the configured maximum, evicting the most idle sessions"
        );
        idle.sort_by_key(|session| session.last_activity());
        let excess = idle.len() - max_idle_sessions;
        for session in idle.drain(..excess) {
            close_session(registry, session).await;
        }
    }
}

/// Removal is immediate; disposal is fire-and-forget so a slow session
/// cannot stall the sweeper.
async fn close_session(registry: &Arc<SessionRegistry>, session: Arc<HttpSession>) {
    registry.try_remove(session.id()).await;
    tokio::spawn(async move {
        session.dispose().await;
    });
}
