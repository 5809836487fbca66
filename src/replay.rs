use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use hyper::{
    HeaderMap, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
};
use serde::Serialize;

use crate::{
    cors,
    engine::{Mode, ProxyEngine, ReplaySessionState},
    fingerprint,
    proxy::{ProxyBody, boxed_full, json_response},
    store::{self, Recording, RecordingSession, StoreError},
};

/// Canonical session binding for concurrent replay; set by the test adapter.
pub const RECORDING_ID_HEADER: &str = "x-test-rcrd-id";
/// Fallback binding for clients that cannot add custom headers.
pub const RECORDING_ID_COOKIE: &str = "proxy-recording-id";

#[derive(Debug, Serialize)]
struct ReplayErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
}

impl<'a> ReplayErrorBody<'a> {
    fn new(error: &'a str) -> Self {
        Self {
            error,
            session: None,
            key: None,
            file: None,
        }
    }
}

/// Resolves the session id a request is bound to: header first, cookie
/// second. The engine's active replay id is the final fallback, applied by
/// the dispatcher.
pub fn sticky_session_id(headers: &HeaderMap) -> Option<String> {
    if let Some(id) = headers
        .get(RECORDING_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return Some(id.to_owned());
    }
    cookie_value(headers, RECORDING_ID_COOKIE)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie_header in headers.get_all(header::COOKIE) {
        let Ok(raw) = cookie_header.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            let Some((cookie_name, value)) = pair.split_once('=') else {
                continue;
            };
            if cookie_name.trim() == name {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_owned());
                }
            }
        }
    }
    None
}

pub(crate) enum ResolveError {
    NoSession,
    Store(StoreError),
}

/// Resolves and loads the replay session for a request. The loaded document
/// is cached on the session state; the disk read happens at most once per id.
pub(crate) async fn resolve_session(
    engine: &Arc<ProxyEngine>,
    sticky: Option<String>,
) -> Result<(Arc<ReplaySessionState>, Arc<RecordingSession>), ResolveError> {
    let id = match sticky {
        Some(id) => id,
        None => {
            let snapshot = engine.snapshot();
            match (snapshot.mode, snapshot.active_id) {
                (Mode::Replay, Some(id)) => id,
                _ => return Err(ResolveError::NoSession),
            }
        }
    };

    let state = engine.replay_session_for(&id);
    if let Some(session) = state.cached_session() {
        return Ok((state, session));
    }

    let path = store::session_path(engine.recordings_dir(), &id);
    let loaded = tokio::task::spawn_blocking(move || store::load(&path))
        .await
        .map_err(|err| {
            ResolveError::Store(StoreError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other(format!("join recording load task: {err}")),
            })
        })?
        .map_err(ResolveError::Store)?;

    tracing::info!(
        id = %state.id(),
        recordings = loaded.recordings.len(),
        websockets = loaded.websocket_recordings.len(),
        "loaded replay session"
    );
    let session = state.store_session(Arc::new(loaded));
    Ok((state, session))
}

pub(crate) fn resolve_error_response(
    err: &ResolveError,
    overlay: &cors::Overlay,
) -> Response<ProxyBody> {
    match err {
        ResolveError::NoSession => json_response(
            StatusCode::BAD_REQUEST,
            &ReplayErrorBody::new("No replay session active"),
            overlay,
        ),
        ResolveError::Store(StoreError::NotFound(path)) => {
            tracing::warn!(path = %path.display(), "replay requested but recording file not found");
            let mut body = ReplayErrorBody::new("Recording file not found");
            let file = path.display().to_string();
            body.file = Some(file);
            json_response(StatusCode::NOT_FOUND, &body, overlay)
        }
        ResolveError::Store(StoreError::Corrupt { path, source }) => {
            tracing::warn!(path = %path.display(), "corrupt recording file: {source}");
            let mut body = ReplayErrorBody::new("Corrupt recording file");
            body.file = Some(path.display().to_string());
            json_response(StatusCode::NOT_FOUND, &body, overlay)
        }
        ResolveError::Store(err @ StoreError::Io { .. }) => {
            tracing::error!("failed to read recording file: {err}");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ReplayErrorBody::new("Failed to read recording file"),
                overlay,
            )
        }
    }
}

/// Serves a request from the bound replay session without contacting any
/// backend. Selection is deterministic and purely order-based.
pub async fn dispatch(
    req: Request<Incoming>,
    engine: &Arc<ProxyEngine>,
    overlay: &cors::Overlay,
    sticky: Option<String>,
) -> Response<ProxyBody> {
    let method = req.method().clone();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let (state, session) = match resolve_session(engine, sticky).await {
        Ok(resolved) => resolved,
        Err(err) => return resolve_error_response(&err, overlay),
    };

    let key = fingerprint::recording_key(method.as_str(), &url);
    let Some(selected) = state.select_response(&key, &session) else {
        tracing::warn!(
            id = %state.id(),
            %key,
            %method,
            %url,
            "no recording for request; it was not observed during recording (possible test non-determinism)"
        );
        let mut body = ReplayErrorBody::new("No recording found");
        body.session = Some(state.id());
        body.key = Some(&key);
        return json_response(StatusCode::NOT_FOUND, &body, overlay);
    };

    if selected.exhausted {
        tracing::warn!(
            id = %state.id(),
            %key,
            candidates = selected.candidates,
            "all recorded responses for key served; repeating the last one"
        );
    }
    tracing::info!(
        id = %state.id(),
        %key,
        recording_id = selected.recording.recording_id,
        "replaying recorded response"
    );

    response_from_recording(&selected.recording, overlay)
}

/// Rebuilds the client response from a stored recording: recorded status and
/// headers (invalid entries skipped), the CORS overlay on top, and the stored
/// body with an accurate content-length.
pub(crate) fn response_from_recording(
    recording: &Recording,
    overlay: &cors::Overlay,
) -> Response<ProxyBody> {
    let Some(stored) = recording.response.as_ref() else {
        // select_response only yields response-bearing recordings.
        return json_response(
            StatusCode::NOT_FOUND,
            &ReplayErrorBody::new("No recording found"),
            overlay,
        );
    };

    let body_bytes = stored
        .body
        .as_deref()
        .map(|body| Bytes::copy_from_slice(body.as_bytes()))
        .unwrap_or_default();
    let body_len = body_bytes.len();

    let mut response = Response::new(boxed_full(body_bytes));
    *response.status_mut() =
        StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    for (name, values) in &stored.headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(name, "invalid header name in recording");
            continue;
        };
        for value in values.iter() {
            let Ok(header_value) = HeaderValue::from_str(value) else {
                tracing::debug!(name, "invalid header value in recording");
                continue;
            };
            response.headers_mut().append(header_name.clone(), header_value);
        }
    }

    crate::proxy::strip_hop_by_hop_headers(response.headers_mut());
    if let Ok(content_length) = HeaderValue::from_str(&body_len.to_string()) {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, content_length);
    }
    overlay.apply(response.headers_mut());

    response
}
