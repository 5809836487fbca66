use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    upgrade::Upgraded,
};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, handshake::derive_accept_key, protocol::Role},
};

use crate::{
    cors,
    engine::{Mode, RecordSessionHandle},
    fingerprint,
    proxy::{ProxyBody, ProxyState, boxed_full, json_response},
    replay,
    store::{MessageDirection, WebSocketMessage},
};

const REPLAY_MESSAGE_STAGGER: Duration = Duration::from_millis(10);

type ClientSocket = WebSocketStream<TokioIo<Upgraded>>;
type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
struct WsErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
}

/// Entry point for HTTP upgrade requests. Transparent and record modes relay
/// to an upstream socket (recording frames in record mode); replay drives the
/// client from the recorded server-to-client messages without any backend.
pub async fn handle_upgrade(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    overlay: &cors::Overlay,
) -> Response<ProxyBody> {
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let sticky = replay::sticky_session_id(req.headers());
    let snapshot = state.engine().snapshot();
    let sticky_live = sticky
        .as_deref()
        .is_some_and(|id| state.engine().live_replay_session(id).is_some());

    if snapshot.mode == Mode::Replay || sticky_live {
        replay_upgrade(req, state, overlay, sticky, url).await
    } else {
        relay_upgrade(req, state, overlay, snapshot.record_session, url).await
    }
}

async fn relay_upgrade(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    overlay: &cors::Overlay,
    record_session: Option<Arc<RecordSessionHandle>>,
    url: String,
) -> Response<ProxyBody> {
    let Some(accept_key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
    else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &WsErrorBody {
                error: "missing sec-websocket-key header",
                session: None,
                key: None,
            },
            overlay,
        );
    };

    let target = state.next_target().clone();
    let upstream_url = match websocket_upstream_url(&target, &url) {
        Ok(upstream_url) => upstream_url,
        Err(err) => {
            tracing::warn!(target = %target, "failed to build websocket upstream url: {err:#}");
            return json_response(
                StatusCode::BAD_GATEWAY,
                &WsErrorBody {
                    error: "failed to build upstream websocket url",
                    session: None,
                    key: None,
                },
                overlay,
            );
        }
    };

    // Connect upstream before completing the client upgrade, so a dead
    // backend surfaces as a plain 502 instead of a half-open socket.
    let (upstream, _handshake) = match connect_async(upstream_url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(upstream = %upstream_url, "websocket upstream connect failed: {err}");
            return json_response(
                StatusCode::BAD_GATEWAY,
                &WsErrorBody {
                    error: "failed to connect upstream websocket",
                    session: None,
                    key: None,
                },
                overlay,
            );
        }
    };

    tracing::info!(upstream = %upstream_url, recording = record_session.is_some(), "relaying websocket");

    if let Some(session) = record_session.as_ref() {
        session.ensure_ws_recording(&url);
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!("client websocket upgrade failed: {err}");
                return;
            }
        };
        let client =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        relay(client, upstream, record_session.as_ref(), &url).await;

        // A relay outliving its session's persistence writes the tail frames.
        if let Some(session) = record_session.as_ref() {
            if session.is_persisted() {
                session.spawn_persist();
            }
        }
    });

    switching_protocols_response(&accept_key)
}

/// Bidirectional frame relay; in record mode every text/binary frame lands in
/// the session's per-url recording with its direction and timestamp.
async fn relay(
    mut client: ClientSocket,
    mut upstream: UpstreamSocket,
    record_session: Option<&Arc<RecordSessionHandle>>,
    url: &str,
) {
    loop {
        tokio::select! {
            client_msg = client.next() => match client_msg {
                Some(Ok(msg)) => {
                    if let (Some(session), Some(data)) = (record_session, message_data(&msg)) {
                        session.append_ws_message(url, MessageDirection::ClientToServer, data);
                    }
                    let closing = msg.is_close();
                    if upstream.send(msg).await.is_err() {
                        tracing::debug!("failed to forward websocket frame upstream");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!("client websocket error: {err}");
                    break;
                }
                None => break,
            },
            upstream_msg = upstream.next() => match upstream_msg {
                Some(Ok(msg)) => {
                    if let (Some(session), Some(data)) = (record_session, message_data(&msg)) {
                        session.append_ws_message(url, MessageDirection::ServerToClient, data);
                    }
                    let closing = msg.is_close();
                    if client.send(msg).await.is_err() {
                        tracing::debug!("failed to forward websocket frame to client");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!("upstream websocket error: {err}");
                    break;
                }
                None => break,
            },
            else => break,
        }
    }

    let _ = client.close(None).await;
    let _ = upstream.close(None).await;
}

async fn replay_upgrade(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    overlay: &cors::Overlay,
    sticky: Option<String>,
    url: String,
) -> Response<ProxyBody> {
    let (session_state, session) = match replay::resolve_session(state.engine(), sticky).await {
        Ok(resolved) => resolved,
        Err(err) => return replay::resolve_error_response(&err, overlay),
    };

    let key = fingerprint::websocket_key(&url);
    let Some(recording) = session
        .websocket_recordings
        .iter()
        .find(|ws| ws.key == key)
        .cloned()
    else {
        tracing::warn!(id = %session_state.id(), %key, %url, "no websocket recording for upgrade");
        return json_response(
            StatusCode::NOT_FOUND,
            &WsErrorBody {
                error: "No websocket recording found",
                session: Some(session_state.id()),
                key: Some(&key),
            },
            overlay,
        );
    };

    let Some(accept_key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|ws_key| derive_accept_key(ws_key.as_bytes()))
    else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &WsErrorBody {
                error: "missing sec-websocket-key header",
                session: None,
                key: None,
            },
            overlay,
        );
    };

    tracing::info!(
        id = %session_state.id(),
        %key,
        messages = recording.messages.len(),
        "replaying websocket session"
    );

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!("client websocket upgrade failed: {err}");
                return;
            }
        };
        let client =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        drive_replay(client, recording.messages).await;
    });

    switching_protocols_response(&accept_key)
}

/// Plays recorded server-to-client messages against a live client socket.
///
/// Leading server messages (those recorded before the first client message)
/// flush immediately with a small stagger; afterwards each client data frame
/// paces out the next unused server message. Client payloads are not matched
/// against the recorded client frames.
async fn drive_replay(mut client: ClientSocket, messages: Vec<WebSocketMessage>) {
    let mut cursor = 0;
    while cursor < messages.len()
        && messages[cursor].direction == MessageDirection::ServerToClient
    {
        if cursor > 0 {
            tokio::time::sleep(REPLAY_MESSAGE_STAGGER).await;
        }
        if client
            .send(Message::Text(messages[cursor].data.clone()))
            .await
            .is_err()
        {
            return;
        }
        cursor += 1;
    }

    while let Some(incoming) = client.next().await {
        match incoming {
            Ok(msg) if msg.is_close() => break,
            Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
                tokio::time::sleep(REPLAY_MESSAGE_STAGGER).await;
                while cursor < messages.len()
                    && messages[cursor].direction == MessageDirection::ClientToServer
                {
                    cursor += 1;
                }
                match messages.get(cursor) {
                    Some(next) => {
                        if client.send(Message::Text(next.data.clone())).await.is_err() {
                            return;
                        }
                        cursor += 1;
                    }
                    None => {
                        tracing::debug!("websocket replay has no further server messages");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("client websocket error during replay: {err}");
                break;
            }
        }
    }

    let _ = client.close(None).await;
}

fn message_data(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.clone()),
        Message::Binary(data) => Some(String::from_utf8_lossy(data).into_owned()),
        _ => None,
    }
}

fn websocket_upstream_url(target: &hyper::Uri, url: &str) -> anyhow::Result<String> {
    let scheme = match target.scheme_str() {
        Some("https") => "wss",
        _ => "ws",
    };
    let authority = target
        .authority()
        .context("target url has no authority")?;
    Ok(format!("{scheme}://{authority}{url}"))
}

fn switching_protocols_response(accept_key: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response
        .headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    match HeaderValue::from_str(accept_key) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_ACCEPT, value);
        }
        Err(err) => tracing::debug!("derived websocket accept key is not a header value: {err}"),
    }
    response
}
