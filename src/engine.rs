//! Generation-fenced reconnect loop
//!
//! Single responsibility: keep one session alive. The engine owns the
//! allocate/handshake/pump cycle, classifies every closure via
//! [`CloseInfo::control_code`], and retries with exponential backoff where
//! the protocol allows it.
//!
//! Concurrency is handled with a generation counter instead of task
//! cancellation: `start()` and `stop()` bump an `AtomicU64`, and the loop
//! compares its captured generation after every await. A superseded loop
//! bails silently, so completions from an abandoned run never touch current
//! state or emit events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::allocator::NodeAllocator;
use crate::close_code::{
    CloseInfo, CLOSED_NO_STATUS, CLOSE_ABNORMAL, STATEFULL_ALLOCATE_NODE, STATEFULL_BAN,
    STATEFULL_KICK, STATEFULL_NORMAL_CLOSE,
};
use crate::config::ClientConfig;
use crate::error::{AllocationErrorKind, Result, SessionError};
use crate::handshake::{HandshakeSocket, JsonObject, SocketEvent};
use crate::store::{BanGate, RestartSignal, SessionStorage, SessionStore};
use crate::types::{now_millis, BanRecord, SessionSettings};

/// Notification emitted by the engine's event channel.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed; the session is ready
    Connected {
        node_url: String,
        init: JsonObject,
    },
    /// Text frame from the session's peer
    Message(String),
    /// A retryable failure; the engine reconnects after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// The socket closed
    Closed(CloseInfo),
    /// The server kicked the session; nothing is persisted
    Kicked { reason: String },
    /// The server banned the session; the record is persisted
    Banned { record: BanRecord },
    /// The run ended with an unrecoverable failure
    Failed(String),
}

/// Observable snapshot of the engine.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub started: bool,
    pub ready: bool,
    pub generation: u64,
    /// Converged control-plane URL of the current run
    pub api_url: Option<String>,
    /// Node the session is assigned to
    pub node_url: Option<String>,
}

#[derive(Default)]
struct EngineState {
    started: bool,
    ready: bool,
    api_url: Option<String>,
    node_url: Option<String>,
    socket: Option<HandshakeSocket>,
}

struct EngineInner {
    config: ClientConfig,
    allocator: NodeAllocator,
    storage: SessionStorage,
    restart: Arc<dyn RestartSignal>,
    events: mpsc::UnboundedSender<SessionEvent>,
    generation: AtomicU64,
    state: Mutex<EngineState>,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state lock poisoned")
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    /// Clear run flags, but only if the run still owns the engine.
    fn finish(&self, generation: u64) {
        if self.superseded(generation) {
            return;
        }
        let mut state = self.state();
        state.started = false;
        state.ready = false;
        state.socket = None;
    }
}

/// Resilient session driver: allocates a node, performs the handshake and
/// reconnects on retryable closures.
pub struct ReconnectEngine {
    inner: Arc<EngineInner>,
}

impl ReconnectEngine {
    /// Build an engine around a persistent store and a restart capability.
    ///
    /// Returns the engine together with the receiving end of its event
    /// channel.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn SessionStore>,
        restart: Arc<dyn RestartSignal>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let storage = SessionStorage::new(store);
        let allocator = NodeAllocator::new(config.clone(), storage.clone())?;
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            config,
            allocator,
            storage,
            restart,
            events,
            generation: AtomicU64::new(0),
            state: Mutex::new(EngineState::default()),
        });
        Ok((Self { inner }, receiver))
    }

    /// Start a run. Must be called inside a tokio runtime.
    ///
    /// Consults the ban gate before any network activity and refuses with
    /// [`SessionError::Banned`] while a persisted ban is active. Calling
    /// `start()` on an already-started engine is a no-op.
    pub fn start(&self) -> Result<()> {
        if let Some(end_time) = BanGate::check(&self.inner.storage) {
            let reason = self
                .inner
                .storage
                .ban_record()
                .map(|record| record.reason)
                .unwrap_or_default();
            warn!(end_time, reason = %reason, "Refusing to start while banned");
            return Err(SessionError::Banned { end_time, reason });
        }

        let generation = {
            let mut state = self.inner.state();
            if state.started {
                debug!("Session already started");
                return Ok(());
            }
            *state = EngineState {
                started: true,
                ..EngineState::default()
            };
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        info!(generation, "Starting session run");
        let inner = self.inner.clone();
        tokio::spawn(run_loop(inner, generation));
        Ok(())
    }

    /// Stop the current run.
    ///
    /// Supersedes the running generation first, so any in-flight completion
    /// of the old run becomes a no-op, then closes an open socket with
    /// `STATEFULL_NORMAL_CLOSE`.
    pub async fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let socket = {
            let mut state = self.inner.state();
            state.started = false;
            state.ready = false;
            state.node_url = None;
            state.socket.take()
        };
        if let Some(socket) = socket {
            info!("Stopping session");
            socket.normal_close(None).await;
        }
    }

    /// Send a JSON object over the active session.
    pub async fn send(&self, object: &JsonObject) -> Result<()> {
        let socket = self
            .inner
            .state()
            .socket
            .clone()
            .ok_or_else(|| SessionError::Transport("session is not ready".to_string()))?;
        socket.send(object).await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state().ready
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.inner.state();
        EngineStatus {
            started: state.started,
            ready: state.ready,
            generation: self.inner.generation.load(Ordering::SeqCst),
            api_url: state.api_url.clone(),
            node_url: state.node_url.clone(),
        }
    }
}

enum AttemptEnd {
    Closed(CloseInfo),
    Superseded,
}

async fn run_loop(inner: Arc<EngineInner>, generation: u64) {
    // Settings are determined once per run; convergence carries its own
    // bounded retry.
    let base_url = inner.allocator.resolve_base_url();
    let settings = match inner.allocator.determine_settings(&base_url).await {
        Ok(settings) => settings,
        Err(err) => {
            if inner.superseded(generation) {
                return;
            }
            error!(error = %err, "Settings determination failed");
            inner.emit(SessionEvent::Failed(err.to_string()));
            inner.finish(generation);
            return;
        }
    };
    if inner.superseded(generation) {
        return;
    }
    inner.state().api_url = Some(settings.external_url.clone());

    let mut backoff = inner.config.backoff_base;
    let mut attempts = 0u32;

    loop {
        if inner.superseded(generation) {
            return;
        }

        match connect_once(&inner, generation, &settings).await {
            Ok(AttemptEnd::Superseded) => return,
            Ok(AttemptEnd::Closed(info)) => {
                // The connect succeeded before this closure, so the backoff
                // schedule starts over.
                backoff = inner.config.backoff_base;
                attempts = 0;

                match info.control_code() {
                    STATEFULL_NORMAL_CLOSE => {
                        info!("Session closed normally");
                        inner.emit(SessionEvent::Closed(info));
                        inner.finish(generation);
                        return;
                    }
                    STATEFULL_BAN => {
                        let record = BanRecord::from_close_reason(&info.raw_reason, now_millis());
                        warn!(
                            end_time = record.end_time,
                            reason = %record.reason,
                            "Session banned"
                        );
                        inner.storage.set_ban_record(&record);
                        inner.emit(SessionEvent::Banned { record });
                        inner.finish(generation);
                        inner.restart.request_restart();
                        return;
                    }
                    STATEFULL_KICK => {
                        let reason = info.reason.trim().to_string();
                        warn!(reason = %reason, "Session kicked");
                        inner.emit(SessionEvent::Kicked { reason });
                        inner.finish(generation);
                        return;
                    }
                    STATEFULL_ALLOCATE_NODE => {
                        debug!("Server asked for node reallocation");
                        inner.state().node_url = None;
                        inner.emit(SessionEvent::Closed(info));
                        // Reallocation is server-directed, not a failure;
                        // reconnect without delay.
                    }
                    CLOSED_NO_STATUS | CLOSE_ABNORMAL => {
                        let last = SessionError::ConnectionClosed {
                            code: info.code,
                            reason: info.raw_reason.clone(),
                            was_clean: false,
                        };
                        inner.emit(SessionEvent::Closed(info));
                        if !retry_wait(&inner, generation, &mut attempts, &mut backoff, last).await
                        {
                            return;
                        }
                    }
                    other => {
                        let err = SessionError::UnknownCloseCode(other);
                        error!(code = other, "Unclassified close code, giving up");
                        inner.emit(SessionEvent::Closed(info));
                        inner.emit(SessionEvent::Failed(err.to_string()));
                        inner.finish(generation);
                        return;
                    }
                }
            }
            Err(SessionError::Banned { end_time, reason }) => {
                if inner.superseded(generation) {
                    return;
                }
                // The handshake already persisted the record.
                inner.emit(SessionEvent::Banned {
                    record: BanRecord { end_time, reason },
                });
                inner.finish(generation);
                inner.restart.request_restart();
                return;
            }
            Err(err) => {
                if inner.superseded(generation) {
                    return;
                }
                if matches!(
                    err,
                    SessionError::Allocation(AllocationErrorKind::SessionExpired)
                ) {
                    // The token is gone; the node assignment goes with it.
                    inner.state().node_url = None;
                }
                warn!(error = %err, "Connection attempt failed");
                if !retry_wait(&inner, generation, &mut attempts, &mut backoff, err).await {
                    return;
                }
            }
        }
    }
}

/// One allocate/handshake/pump cycle.
///
/// Returns the close info once the socket closes, or `Superseded` when a
/// newer generation took over mid-attempt.
async fn connect_once(
    inner: &Arc<EngineInner>,
    generation: u64,
    settings: &SessionSettings,
) -> Result<AttemptEnd> {
    let cached_node_url = inner.state().node_url.clone();
    let node_url = match cached_node_url {
        Some(url) => url,
        None => {
            let url = inner.allocator.allocate_node(settings).await?;
            if inner.superseded(generation) {
                return Ok(AttemptEnd::Superseded);
            }
            inner.state().node_url = Some(url.clone());
            url
        }
    };

    let (socket, mut events, init) = HandshakeSocket::connect(
        &node_url,
        settings,
        &inner.storage,
        inner.config.init_timeout,
    )
    .await?;

    if inner.superseded(generation) {
        socket.normal_close(None).await;
        return Ok(AttemptEnd::Superseded);
    }

    {
        let mut state = inner.state();
        state.ready = true;
        state.socket = Some(socket.clone());
    }
    info!(node_url = %node_url, "Session ready");
    inner.emit(SessionEvent::Connected { node_url, init });

    loop {
        match events.next_event().await {
            SocketEvent::Message(text) => {
                if inner.superseded(generation) {
                    return Ok(AttemptEnd::Superseded);
                }
                inner.emit(SessionEvent::Message(text));
            }
            SocketEvent::Closed(info) => {
                if inner.superseded(generation) {
                    return Ok(AttemptEnd::Superseded);
                }
                let mut state = inner.state();
                state.ready = false;
                state.socket = None;
                return Ok(AttemptEnd::Closed(info));
            }
        }
    }
}

/// Count one retryable failure and wait out the backoff.
///
/// Returns `false` when the run must end, either because the retry budget
/// is spent or because a newer generation took over during the sleep. The
/// delay quadruples after each use.
async fn retry_wait(
    inner: &Arc<EngineInner>,
    generation: u64,
    attempts: &mut u32,
    backoff: &mut Duration,
    last: SessionError,
) -> bool {
    *attempts += 1;
    if *attempts > inner.config.max_retries {
        let err = SessionError::RetriesExhausted {
            attempts: *attempts,
            last: Box::new(last),
        };
        error!(error = %err, "Retry budget spent, giving up");
        inner.emit(SessionEvent::Failed(err.to_string()));
        inner.finish(generation);
        return false;
    }

    debug!(
        attempt = *attempts,
        delay_ms = backoff.as_millis() as u64,
        error = %last,
        "Backing off before reconnect"
    );
    inner.emit(SessionEvent::Retrying {
        attempt: *attempts,
        delay: *backoff,
    });
    tokio::time::sleep(*backoff).await;
    *backoff += *backoff * 3;
    !inner.superseded(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NoRestart};

    fn engine() -> (ReconnectEngine, mpsc::UnboundedReceiver<SessionEvent>) {
        ReconnectEngine::new(
            ClientConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(NoRestart),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_refuses_while_ban_is_active() {
        let store = Arc::new(MemoryStore::new());
        let storage = SessionStorage::new(store.clone());
        storage.set_ban_record(&BanRecord {
            end_time: BanRecord::PERMANENT,
            reason: "cheater".to_string(),
        });

        let (engine, _events) =
            ReconnectEngine::new(ClientConfig::default(), store, Arc::new(NoRestart)).unwrap();
        match engine.start() {
            Err(SessionError::Banned { end_time, reason }) => {
                assert_eq!(end_time, BanRecord::PERMANENT);
                assert_eq!(reason, "cheater");
            }
            other => panic!("expected ban refusal, got {:?}", other.map(|_| ())),
        }
        assert!(!engine.status().started);
    }

    #[tokio::test]
    async fn status_defaults_to_idle() {
        let (engine, _events) = engine();
        let status = engine.status();
        assert!(!status.started);
        assert!(!status.ready);
        assert_eq!(status.generation, 0);
        assert_eq!(status.api_url, None);
        assert_eq!(status.node_url, None);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let (engine, _events) = engine();
        engine.stop().await;
        let status = engine.status();
        assert!(!status.started);
        // Stopping still supersedes, so a stale task could never resume.
        assert_eq!(status.generation, 1);
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let (engine, _events) = engine();
        let result = engine.send(&JsonObject::new()).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
    }
}
