use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    fingerprint,
    store::{
        self, Headers, MessageDirection, RecordedRequest, RecordedResponse, Recording,
        RecordingSession, WebSocketMessage, WebSocketRecording,
    },
};

pub const DEFAULT_MODE_TIMEOUT_MS: i64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Transparent,
    Record,
    Replay,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transparent => "transparent",
            Self::Record => "record",
            Self::Replay => "replay",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeTarget {
    Transparent,
    Record { id: String },
    Replay { id: String },
}

impl ModeTarget {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Transparent => Mode::Transparent,
            Self::Record { .. } => Mode::Record,
            Self::Replay { .. } => Mode::Replay,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Transparent => None,
            Self::Record { id } | Self::Replay { id } => Some(id),
        }
    }
}

/// Point-in-time view of the engine taken by a request handler.
#[derive(Clone)]
pub struct EngineSnapshot {
    pub mode: Mode,
    pub record_session: Option<Arc<RecordSessionHandle>>,
    pub active_id: Option<String>,
}

/// Owns the proxy mode, the active record session, and all replay session
/// state. One mutex guards the tuple; it is only held for short state reads
/// and writes, never across I/O.
pub struct ProxyEngine {
    recordings_dir: PathBuf,
    state: Mutex<EngineState>,
}

struct EngineState {
    mode: Mode,
    active_id: Option<String>,
    record_session: Option<Arc<RecordSessionHandle>>,
    replay_sessions: HashMap<String, Arc<ReplaySessionState>>,
    timer_generation: u64,
}

impl ProxyEngine {
    pub fn new(recordings_dir: PathBuf) -> Self {
        Self {
            recordings_dir,
            state: Mutex::new(EngineState {
                mode: Mode::Transparent,
                active_id: None,
                record_session: None,
                replay_sessions: HashMap::new(),
                timer_generation: 0,
            }),
        }
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        EngineSnapshot {
            mode: state.mode,
            record_session: state.record_session.clone(),
            active_id: state.active_id.clone(),
        }
    }

    /// Replay state for `id` if one is already live; never creates.
    pub fn live_replay_session(&self, id: &str) -> Option<Arc<ReplaySessionState>> {
        self.lock().replay_sessions.get(id).cloned()
    }

    /// Replay state for `id`, created lazily on first use.
    pub fn replay_session_for(&self, id: &str) -> Arc<ReplaySessionState> {
        let mut state = self.lock();
        Arc::clone(
            state
                .replay_sessions
                .entry(id.to_owned())
                .or_insert_with(|| Arc::new(ReplaySessionState::new(id.to_owned()))),
        )
    }

    pub fn replay_session_ids(&self) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = state.replay_sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn apply_transition(
        state: &mut EngineState,
        target: &ModeTarget,
        recordings_dir: &Path,
    ) -> Option<Arc<RecordSessionHandle>> {
        // Any armed timer becomes stale the moment the generation moves.
        state.timer_generation += 1;
        let prior = state.record_session.take();

        match target {
            ModeTarget::Transparent => {
                state.mode = Mode::Transparent;
                state.active_id = None;
            }
            ModeTarget::Record { id } => {
                state.mode = Mode::Record;
                state.active_id = Some(id.clone());
                state.record_session = Some(Arc::new(RecordSessionHandle::new(
                    id.clone(),
                    recordings_dir.to_path_buf(),
                )));
            }
            ModeTarget::Replay { id } => {
                state.mode = Mode::Replay;
                state.active_id = Some(id.clone());
                // Fresh play-through: served sets reset, loaded session kept.
                let replay = state
                    .replay_sessions
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(ReplaySessionState::new(id.clone())));
                replay.reset_served();
            }
        }

        prior
    }

    async fn fire_mode_timer(&self, generation: u64) {
        let prior_record = {
            let mut state = self.lock();
            if state.timer_generation != generation {
                return;
            }
            Self::apply_transition(&mut state, &ModeTarget::Transparent, &self.recordings_dir)
        };

        tracing::info!("mode timeout elapsed; resetting to transparent");
        if let Some(session) = prior_record {
            persist_session(&session).await;
        }
    }

    /// Persists `id`'s record session if it is the active one, then drops
    /// `id`'s replay state. Cleaning the active record session also resets
    /// the mode, since the session is destroyed after persistence.
    pub async fn cleanup(&self, id: &str) {
        let prior_record = {
            let mut state = self.lock();
            state.replay_sessions.remove(id);
            if state.active_id.as_deref() == Some(id) {
                state.active_id = None;
            }
            match state.record_session.as_ref() {
                Some(session) if session.id() == id => {
                    state.timer_generation += 1;
                    state.mode = Mode::Transparent;
                    state.record_session.take()
                }
                _ => None,
            }
        };

        if let Some(session) = prior_record {
            persist_session(&session).await;
        }
        tracing::info!(id, "cleaned up session state");
    }
}

/// Switches the mode. The state change is atomic under the engine mutex; a
/// prior record session is persisted before this returns, so a caller that
/// observed the switch can immediately replay what was recorded. A free
/// function because the armed timer task needs its own engine handle.
pub async fn switch_mode(engine: &Arc<ProxyEngine>, target: ModeTarget, timeout_ms: i64) {
    let (prior_record, timer_generation) = {
        let mut state = engine.lock();
        let prior = ProxyEngine::apply_transition(&mut state, &target, &engine.recordings_dir);
        (prior, state.timer_generation)
    };

    if let Some(session) = prior_record {
        persist_session(&session).await;
    }

    tracing::info!(mode = %target.mode(), id = target.id().unwrap_or("-"), "switched proxy mode");

    if target.mode() != Mode::Transparent && timeout_ms > 0 {
        let engine = Arc::clone(engine);
        let timeout = Duration::from_millis(timeout_ms as u64);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.fire_mode_timer(timer_generation).await;
        });
    }
}

async fn persist_session(session: &Arc<RecordSessionHandle>) {
    let handle = Arc::clone(session);
    match tokio::task::spawn_blocking(move || handle.persist()).await {
        Ok(Ok(path)) => {
            tracing::info!(path = %path.display(), "persisted recording session");
        }
        Ok(Err(err)) => {
            tracing::error!("failed to persist recording session: {err:#}");
        }
        Err(err) => tracing::error!("join recording persist task: {err}"),
    }
}

/// Mutable state of an in-progress record session.
///
/// Handlers hold an `Arc` to this across the whole exchange. `recording_id`
/// allocation happens under the handle mutex at request arrival, before any
/// I/O suspension, which pins the arrival order even when upstream responses
/// complete out of order.
pub struct RecordSessionHandle {
    id: String,
    dir: PathBuf,
    inner: Mutex<RecordSessionInner>,
}

struct RecordSessionInner {
    next_recording_id: u64,
    recordings: Vec<Recording>,
    websocket_recordings: Vec<WebSocketRecording>,
    persisted: bool,
}

impl RecordSessionHandle {
    fn new(id: String, dir: PathBuf) -> Self {
        Self {
            id,
            dir,
            inner: Mutex::new(RecordSessionInner {
                next_recording_id: 0,
                recordings: Vec::new(),
                websocket_recordings: Vec::new(),
                persisted: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, RecordSessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocates the next `recording_id` and appends the request shell.
    pub fn begin_recording(&self, method: &str, url: &str, headers: Headers) -> u64 {
        let mut inner = self.lock();
        let recording_id = inner.next_recording_id;
        inner.next_recording_id += 1;
        inner.recordings.push(Recording {
            request: RecordedRequest {
                method: method.to_owned(),
                url: url.to_owned(),
                headers,
                body: None,
            },
            response: None,
            timestamp: store::now_timestamp(),
            key: fingerprint::recording_key(method, url),
            recording_id,
            sequence: None,
        });
        recording_id
    }

    pub fn set_request_body(&self, recording_id: u64, body: Option<String>) {
        let mut inner = self.lock();
        if let Some(recording) = inner
            .recordings
            .iter_mut()
            .find(|r| r.recording_id == recording_id)
        {
            recording.request.body = body;
        }
    }

    /// Stores the response on the recording pinned by `recording_id`.
    ///
    /// Returns `true` when the session file has already been written, in which
    /// case the caller should schedule a re-persist so the late exchange is
    /// kept (a mode switch does not lose in-flight recordings).
    #[must_use]
    pub fn complete_recording(&self, recording_id: u64, response: RecordedResponse) -> bool {
        let mut inner = self.lock();
        if let Some(recording) = inner
            .recordings
            .iter_mut()
            .find(|r| r.recording_id == recording_id)
        {
            recording.response = Some(response);
            recording.timestamp = store::now_timestamp();
        }
        inner.persisted
    }

    /// Creates the per-url WebSocket recording if this is the first upgrade
    /// for `url`.
    pub fn ensure_ws_recording(&self, url: &str) {
        let mut inner = self.lock();
        if inner.websocket_recordings.iter().any(|ws| ws.url == url) {
            return;
        }
        inner.websocket_recordings.push(WebSocketRecording {
            url: url.to_owned(),
            key: fingerprint::websocket_key(url),
            timestamp: store::now_timestamp(),
            messages: Vec::new(),
        });
    }

    /// Appends a WebSocket frame to the per-url recording, creating it on the
    /// first frame for that url.
    pub fn append_ws_message(&self, url: &str, direction: MessageDirection, data: String) {
        let timestamp = store::now_timestamp();
        let mut inner = self.lock();
        let recording = match inner
            .websocket_recordings
            .iter_mut()
            .position(|ws| ws.url == url)
        {
            Some(idx) => &mut inner.websocket_recordings[idx],
            None => {
                inner.websocket_recordings.push(WebSocketRecording {
                    url: url.to_owned(),
                    key: fingerprint::websocket_key(url),
                    timestamp: timestamp.clone(),
                    messages: Vec::new(),
                });
                let last = inner.websocket_recordings.len() - 1;
                &mut inner.websocket_recordings[last]
            }
        };
        recording.messages.push(WebSocketMessage {
            direction,
            data,
            timestamp,
        });
    }

    pub fn is_persisted(&self) -> bool {
        self.lock().persisted
    }

    fn snapshot_marking_persisted(&self) -> RecordingSession {
        let mut inner = self.lock();
        inner.persisted = true;
        RecordingSession {
            id: self.id.clone(),
            recordings: inner.recordings.clone(),
            websocket_recordings: inner.websocket_recordings.clone(),
        }
    }

    /// Writes the session file from the current state.
    pub fn persist(&self) -> anyhow::Result<PathBuf> {
        store::save(&self.dir, self.snapshot_marking_persisted())
    }

    /// Re-persists on a blocking worker; used for completions that land after
    /// the session file was already written.
    pub fn spawn_persist(&self) {
        let dir = self.dir.clone();
        let session = self.snapshot_marking_persisted();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = store::save(&dir, session) {
                tracing::error!("failed to re-persist recording session: {err:#}");
            }
        });
    }
}

/// In-memory replay state for one session id: the loaded recording plus the
/// set of already-served `recording_id`s per key.
pub struct ReplaySessionState {
    id: String,
    inner: Mutex<ReplayInner>,
}

struct ReplayInner {
    session: Option<Arc<RecordingSession>>,
    served_by_key: HashMap<String, HashSet<u64>>,
}

impl ReplaySessionState {
    fn new(id: String) -> Self {
        Self {
            id,
            inner: Mutex::new(ReplayInner {
                session: None,
                served_by_key: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, ReplayInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached_session(&self) -> Option<Arc<RecordingSession>> {
        self.lock().session.clone()
    }

    /// Caches a freshly-loaded session; if another handler won the race, the
    /// first cached copy stays authoritative.
    pub fn store_session(&self, session: Arc<RecordingSession>) -> Arc<RecordingSession> {
        let mut inner = self.lock();
        match inner.session.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                inner.session = Some(Arc::clone(&session));
                session
            }
        }
    }

    pub fn reset_served(&self) {
        self.lock().served_by_key.clear();
    }

    /// Picks the next recording for `key`: candidates are the response-bearing
    /// recordings for the key ordered by `sequence` (falling back to
    /// `recording_id`); the first unserved one wins, and once all are served
    /// the last candidate repeats. Purely ordinal, no time heuristics.
    pub fn select_response(
        &self,
        key: &str,
        session: &RecordingSession,
    ) -> Option<SelectedRecording> {
        let mut candidates: Vec<&Recording> = session
            .recordings
            .iter()
            .filter(|r| r.key == key && r.response.is_some())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|r| (r.sequence.unwrap_or(r.recording_id), r.recording_id));

        let mut inner = self.lock();
        let served = inner.served_by_key.entry(key.to_owned()).or_default();
        let fresh = candidates
            .iter()
            .find(|r| !served.contains(&r.recording_id))
            .copied();
        let exhausted = fresh.is_none();
        let picked = fresh.or_else(|| candidates.last().copied())?;
        served.insert(picked.recording_id);

        Some(SelectedRecording {
            recording: picked.clone(),
            exhausted,
            candidates: candidates.len(),
        })
    }
}

pub struct SelectedRecording {
    pub recording: Recording,
    /// All candidates were already served; the last one is being repeated.
    pub exhausted: bool,
    pub candidates: usize,
}
