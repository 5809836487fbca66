use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint;

/// Header values as they appear in the recording document: a single string
/// or a list for repeated header names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let (single, many) = match self {
            Self::One(value) => (Some(value.as_str()), None),
            Self::Many(values) => (None, Some(values)),
        };
        single
            .into_iter()
            .chain(many.into_iter().flatten().map(String::as_str))
    }
}

pub type Headers = BTreeMap<String, HeaderValues>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
}

/// One captured HTTP exchange.
///
/// `recording_id` is assigned at request arrival and defines the canonical
/// order; `sequence` is the per-key rank assigned when the session is
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub request: RecordedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordedResponse>,
    pub timestamp: String,
    pub key: String,
    pub recording_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    #[serde(rename = "client-to-server")]
    ClientToServer,
    #[serde(rename = "server-to-client")]
    ServerToClient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub direction: MessageDirection,
    pub data: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketRecording {
    pub url: String,
    pub key: String,
    pub timestamp: String,
    #[serde(default)]
    pub messages: Vec<WebSocketMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub id: String,
    #[serde(default)]
    pub recordings: Vec<Recording>,
    #[serde(default)]
    pub websocket_recordings: Vec<WebSocketRecording>,
}

impl RecordingSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            recordings: Vec::new(),
            websocket_recordings: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(PathBuf),
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    Io {
        path: PathBuf,
        source: io::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "recording file {} not found", path.display()),
            Self::Corrupt { path, source } => {
                write!(f, "corrupt recording file {}: {source}", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "read recording file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotFound(_) => None,
            Self::Corrupt { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
        }
    }
}

/// ISO-8601 timestamp with millisecond precision, e.g. `2026-08-02T10:15:00.000Z`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn session_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(fingerprint::session_file_name(id))
}

/// Reads a session back verbatim; nothing is renumbered on load.
pub fn load(path: &Path) -> Result<RecordingSession, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Persists a session under its sanitized file name and returns the path.
///
/// Recordings that never received a response are dropped, the remainder is
/// ordered by `recording_id`, and each key group is numbered `0,1,2,…` in that
/// order. The document is written to a temp file and renamed into place.
pub fn save(dir: &Path, mut session: RecordingSession) -> anyhow::Result<PathBuf> {
    session.recordings.retain(|r| r.response.is_some());
    session.recordings.sort_by_key(|r| r.recording_id);
    assign_sequences(&mut session.recordings);

    fs::create_dir_all(dir)
        .with_context(|| format!("create recordings dir {}", dir.display()))?;

    let path = session_path(dir, &session.id);
    let document = serde_json::to_vec_pretty(&session)
        .with_context(|| format!("serialize recording session `{}`", session.id))?;

    // Unique temp name: concurrent saves of the same session must not
    // interleave their writes.
    static TMP_SEQ: AtomicU64 = AtomicU64::new(0);
    let mut tmp_path = path.clone();
    tmp_path
        .as_mut_os_string()
        .push(format!(".{}.tmp", TMP_SEQ.fetch_add(1, Ordering::Relaxed)));
    fs::write(&tmp_path, &document)
        .with_context(|| format!("write recording file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)
        .with_context(|| format!("rename recording file into {}", path.display()))?;

    Ok(path)
}

fn assign_sequences(recordings: &mut [Recording]) {
    let mut next_by_key: BTreeMap<String, u64> = BTreeMap::new();
    for recording in recordings {
        let next = next_by_key.entry(recording.key.clone()).or_insert(0);
        recording.sequence = Some(*next);
        *next += 1;
    }
}
