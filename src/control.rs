use std::sync::Arc;

use http_body_util::BodyExt as _;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
};
use serde::{Deserialize, Serialize};

use crate::{
    cors,
    engine::{DEFAULT_MODE_TIMEOUT_MS, Mode, ModeTarget, ProxyEngine, switch_mode},
    proxy::{ProxyBody, json_response},
    replay::RECORDING_ID_COOKIE,
};

/// Control message body: either a mode switch or a cleanup request. `GET`
/// requests express the same fields as query parameters.
#[derive(Debug, Default, Deserialize)]
struct ControlPayload {
    mode: Option<String>,
    id: Option<String>,
    timeout: Option<i64>,
    cleanup: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse<'a> {
    recordings_dir: String,
    mode: &'a str,
    id: Option<&'a str>,
    replay_sessions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwitchResponse<'a> {
    success: bool,
    mode: &'a str,
    id: Option<&'a str>,
    timeout: Option<i64>,
    recordings_dir: String,
}

#[derive(Debug, Serialize)]
struct ControlErrorBody {
    error: String,
}

pub async fn handle(
    req: Request<Incoming>,
    engine: &Arc<ProxyEngine>,
    overlay: &cors::Overlay,
) -> Response<ProxyBody> {
    match *req.method() {
        Method::GET => {
            let query = req.uri().query().unwrap_or_default();
            let pairs = query_pairs(query);
            if pairs.iter().any(|(name, _)| name == "mode" || name == "cleanup") {
                let payload = match payload_from_query(&pairs) {
                    Ok(payload) => payload,
                    Err(message) => return bad_request(message, overlay),
                };
                apply(payload, engine, overlay).await
            } else {
                status_response(engine, overlay)
            }
        }
        Method::POST => {
            let body_bytes = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    return bad_request(format!("failed to read request body: {err}"), overlay);
                }
            };
            let payload: ControlPayload = match serde_json::from_slice(&body_bytes) {
                Ok(payload) => payload,
                Err(err) => return bad_request(format!("invalid JSON body: {err}"), overlay),
            };
            apply(payload, engine, overlay).await
        }
        _ => {
            let mut response = json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &ControlErrorBody {
                    error: "method not allowed".to_owned(),
                },
                overlay,
            );
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, POST"));
            response
        }
    }
}

async fn apply(
    payload: ControlPayload,
    engine: &Arc<ProxyEngine>,
    overlay: &cors::Overlay,
) -> Response<ProxyBody> {
    if payload.cleanup == Some(true) {
        let Some(id) = payload.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
        else {
            return bad_request("cleanup requires `id`".to_owned(), overlay);
        };
        engine.cleanup(id).await;
        let snapshot = engine.snapshot();
        return json_response(
            StatusCode::OK,
            &SwitchResponse {
                success: true,
                mode: snapshot.mode.as_str(),
                id: Some(id),
                timeout: None,
                recordings_dir: engine.recordings_dir().display().to_string(),
            },
            overlay,
        );
    }

    let Some(raw_mode) = payload.mode.as_deref() else {
        return bad_request(
            "control payload requires `mode` or `cleanup`".to_owned(),
            overlay,
        );
    };

    let id = payload.id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let target = match raw_mode {
        "transparent" => ModeTarget::Transparent,
        "record" => {
            let Some(id) = id else {
                return bad_request("mode `record` requires `id`".to_owned(), overlay);
            };
            ModeTarget::Record { id: id.to_owned() }
        }
        "replay" => {
            let Some(id) = id else {
                return bad_request("mode `replay` requires `id`".to_owned(), overlay);
            };
            ModeTarget::Replay { id: id.to_owned() }
        }
        other => return bad_request(format!("unknown mode `{other}`"), overlay),
    };

    let timeout = payload.timeout.unwrap_or(DEFAULT_MODE_TIMEOUT_MS);
    let mode = target.mode();
    let target_id = target.id().map(str::to_owned);
    switch_mode(engine, target, timeout).await;

    let mut response = json_response(
        StatusCode::OK,
        &SwitchResponse {
            success: true,
            mode: mode.as_str(),
            id: target_id.as_deref(),
            timeout: Some(timeout),
            recordings_dir: engine.recordings_dir().display().to_string(),
        },
        overlay,
    );

    // Fallback session binding for clients that cannot set the id header.
    if mode == Mode::Replay {
        if let Some(id) = target_id.as_deref() {
            let cookie = format!("{RECORDING_ID_COOKIE}={id}; HttpOnly; Path=/; SameSite=Lax");
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().insert(header::SET_COOKIE, value);
                }
                Err(err) => {
                    tracing::warn!(id, "session id not representable as cookie: {err}");
                }
            }
        }
    }

    response
}

fn status_response(engine: &Arc<ProxyEngine>, overlay: &cors::Overlay) -> Response<ProxyBody> {
    let snapshot = engine.snapshot();
    json_response(
        StatusCode::OK,
        &StatusResponse {
            recordings_dir: engine.recordings_dir().display().to_string(),
            mode: snapshot.mode.as_str(),
            id: snapshot.active_id.as_deref(),
            replay_sessions: engine.replay_session_ids(),
        },
        overlay,
    )
}

fn bad_request(message: String, overlay: &cors::Overlay) -> Response<ProxyBody> {
    json_response(
        StatusCode::BAD_REQUEST,
        &ControlErrorBody { error: message },
        overlay,
    )
}

fn payload_from_query(pairs: &[(String, String)]) -> Result<ControlPayload, String> {
    let mut payload = ControlPayload::default();
    for (name, value) in pairs {
        match name.as_str() {
            "mode" => payload.mode = Some(value.clone()),
            "id" => payload.id = Some(value.clone()),
            "timeout" => {
                let timeout = value
                    .parse::<i64>()
                    .map_err(|_| format!("invalid timeout `{value}`"))?;
                payload.timeout = Some(timeout);
            }
            "cleanup" => payload.cleanup = Some(value == "true" || value == "1"),
            _ => {}
        }
    }
    Ok(payload)
}

fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (percent_decode(name), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'%' => {
                let hex = bytes.get(idx + 1..idx + 3);
                match hex.and_then(|hex| u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        idx += 3;
                    }
                    None => {
                        out.push(b'%');
                        idx += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                idx += 1;
            }
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
