use std::{
    collections::btree_map::Entry,
    convert::Infallible,
    env,
    error::Error as StdError,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    config::Config,
    control, cors,
    engine::{Mode, ProxyEngine, RecordSessionHandle},
    replay,
    store::{HeaderValues, Headers, RecordedResponse},
    ws,
};

pub type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type ProxyHttpsConnector = HttpsConnector<HttpConnector>;
pub(crate) type HttpClient = Client<ProxyHttpsConnector, ProxyBody>;

/// Exported on bind; external helpers read it to discover the proxy port.
pub const PORT_ENV_VAR: &str = "TEST_PROXY_RECORDER_PORT";
pub const CONTROL_PATH: &str = "/__control";

const REQUEST_BUFFER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Shared per-proxy state handed to every connection task.
pub struct ProxyState {
    engine: Arc<ProxyEngine>,
    client: HttpClient,
    targets: Vec<Uri>,
    next_target: AtomicUsize,
}

impl ProxyState {
    pub(crate) fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    pub(crate) fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Round-robin target selection: `i = (i + 1) mod n`.
    pub(crate) fn next_target(&self) -> &Uri {
        let idx = self.next_target.fetch_add(1, Ordering::Relaxed);
        &self.targets[idx % self.targets.len()]
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    anyhow::ensure!(
        !config.targets.is_empty(),
        "at least one target URL is required"
    );
    ensure_rustls_crypto_provider()?;

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
        .await
        .map_err(|err| anyhow::anyhow!("bind port {}: {err}", config.port))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    // Child processes launched by the test runner discover the proxy here.
    unsafe { env::set_var(PORT_ENV_VAR, listen_addr.port().to_string()) };

    let engine = Arc::new(ProxyEngine::new(config.recordings_dir.clone()));
    let state = Arc::new(ProxyState {
        engine,
        client: build_http_client()?,
        targets: config.targets.clone(),
        next_target: AtomicUsize::new(0),
    });

    tracing::info!(
        addr = %listen_addr,
        targets = config.targets.len(),
        recordings_dir = %config.recordings_dir.display(),
        "proxy listening"
    );

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder
                            .serve_connection_with_upgrades(io, service)
                            .await
                        {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_http_client() -> anyhow::Result<HttpClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let overlay = cors::Overlay::from_request(req.headers());
    let method = req.method().to_string();
    let url = req.uri().to_string();
    let span = tracing::info_span!("proxy.request", method = %method, url = %url);

    match handle_request(req, &state, &overlay).instrument(span).await {
        Ok(response) => Ok(response),
        Err(err) => {
            // Handlers must never take the process down; surface as 502.
            tracing::error!(method, url, "request handler failed: {err:#}");
            Ok(proxy_error_response(&overlay, &format!("{err:#}")))
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: &Arc<ProxyState>,
    overlay: &cors::Overlay,
) -> anyhow::Result<Response<ProxyBody>> {
    if req.method() == Method::OPTIONS {
        return Ok(preflight_response(overlay));
    }
    if req.uri().path() == CONTROL_PATH {
        return Ok(control::handle(req, state.engine(), overlay).await);
    }
    if is_websocket_upgrade_request(&req) {
        return Ok(ws::handle_upgrade(req, Arc::clone(state), overlay).await);
    }

    // The singular mode only decides the fate of unbound requests: a request
    // carrying a live session binding replays regardless of the mode.
    let sticky = replay::sticky_session_id(req.headers());
    let snapshot = state.engine().snapshot();
    let sticky_live = sticky
        .as_deref()
        .is_some_and(|id| state.engine().live_replay_session(id).is_some());

    if snapshot.mode == Mode::Replay || sticky_live {
        return Ok(replay::dispatch(req, state.engine(), overlay, sticky).await);
    }

    forward(req, state, overlay, snapshot.record_session).await
}

async fn forward(
    req: Request<Incoming>,
    state: &Arc<ProxyState>,
    overlay: &cors::Overlay,
    record_session: Option<Arc<RecordSessionHandle>>,
) -> anyhow::Result<Response<ProxyBody>> {
    let (mut parts, body) = req.into_parts();
    let request_url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let target = state.next_target().clone();
    tracing::info!(
        target = %target,
        recording = record_session.is_some(),
        "forwarding request"
    );

    // In record mode the recording id is allocated synchronously at arrival,
    // before the first suspension point: interleaved completions to the same
    // key can then never mis-attribute responses.
    let recording = record_session.map(|session| {
        let recording_id = session.begin_recording(
            parts.method.as_str(),
            &request_url,
            recorded_headers(&parts.headers),
        );
        (session, recording_id)
    });

    let body_bytes = buffer_request_body(body).await;
    if let Some((session, recording_id)) = recording.as_ref() {
        session.set_request_body(*recording_id, stored_body(&body_bytes));
    }

    let upstream_uri = build_upstream_uri(&target, &parts.uri)?;
    strip_hop_by_hop_headers(&mut parts.headers);
    set_host_header(&mut parts.headers, &upstream_uri);
    parts.uri = upstream_uri;
    let upstream_req = Request::from_parts(parts, boxed_full(body_bytes));

    let outcome = match recording {
        Some((session, recording_id)) => {
            // Detached: a client disconnect drops this handler, not the
            // exchange, so a response that still arrives is recorded.
            let client = state.client().clone();
            let exchange = tokio::spawn(async move {
                let result = upstream_exchange(&client, upstream_req).await;
                if let Ok((res_parts, res_body)) = result.as_ref() {
                    let response = RecordedResponse {
                        status_code: res_parts.status.as_u16(),
                        headers: recorded_headers(&res_parts.headers),
                        body: stored_body(res_body),
                    };
                    if session.complete_recording(recording_id, response) {
                        session.spawn_persist();
                    }
                }
                result
            });
            exchange.await.context("join recorded upstream exchange")?
        }
        None => upstream_exchange(state.client(), upstream_req).await,
    };

    match outcome {
        Ok((mut res_parts, res_body)) => {
            overlay.apply(&mut res_parts.headers);
            Ok(Response::from_parts(res_parts, boxed_full(res_body)))
        }
        Err(err) => {
            tracing::warn!("upstream request failed: {err:#}");
            Ok(proxy_error_response(overlay, &format!("{err:#}")))
        }
    }
}

async fn upstream_exchange(
    client: &HttpClient,
    upstream_req: Request<ProxyBody>,
) -> anyhow::Result<(hyper::http::response::Parts, Bytes)> {
    let upstream_res = client
        .request(upstream_req)
        .await
        .context("upstream request failed")?;
    let (mut parts, body) = upstream_res.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    let body_bytes = body
        .collect()
        .await
        .context("read upstream response body")?
        .to_bytes();
    Ok((parts, body_bytes))
}

/// Buffers the request body, bounded by a 30 s deadline. On timeout the
/// partial body is forwarded rather than failing the request.
async fn buffer_request_body(body: Incoming) -> Bytes {
    let mut body = body;
    let mut buffered: Vec<u8> = Vec::new();
    let deadline = tokio::time::sleep(REQUEST_BUFFER_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!(
                    buffered = buffered.len(),
                    "request body buffering timed out; proceeding with partial body"
                );
                break;
            }
            frame = body.frame() => match frame {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        buffered.extend_from_slice(data);
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!("failed to read request body: {err}");
                    break;
                }
                None => break,
            },
        }
    }

    Bytes::from(buffered)
}

pub(crate) fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

#[derive(Debug, Serialize)]
struct ProxyErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

pub(crate) fn proxy_error_response(overlay: &cors::Overlay, message: &str) -> Response<ProxyBody> {
    json_response(
        StatusCode::BAD_GATEWAY,
        &ProxyErrorBody {
            error: "Proxy error",
            message,
        },
        overlay,
    )
}

pub(crate) fn json_response<T: Serialize>(
    status: StatusCode,
    payload: &T,
    overlay: &cors::Overlay,
) -> Response<ProxyBody> {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!("failed to serialize response payload: {err}");
            b"{}".to_vec()
        }
    };
    let mut response = Response::new(boxed_full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    overlay.apply(response.headers_mut());
    response
}

fn preflight_response(overlay: &cors::Overlay) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::new()));
    *response.status_mut() = StatusCode::OK;
    overlay.apply_preflight(response.headers_mut());
    response
}

/// Collapses a hyper header map into the recording representation: values
/// grouped by name, repeated names becoming lists.
fn recorded_headers(headers: &HeaderMap) -> Headers {
    let mut grouped = Headers::new();
    for (name, value) in headers {
        let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match grouped.entry(name.as_str().to_owned()) {
            Entry::Vacant(entry) => {
                entry.insert(HeaderValues::One(text));
            }
            Entry::Occupied(mut entry) => match entry.get_mut() {
                HeaderValues::One(first) => {
                    let first = std::mem::take(first);
                    *entry.get_mut() = HeaderValues::Many(vec![first, text]);
                }
                HeaderValues::Many(values) => values.push(text),
            },
        }
    }
    grouped
}

fn stored_body(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(body).into_owned())
    }
}

fn build_upstream_uri(target: &Uri, original: &Uri) -> anyhow::Result<Uri> {
    let mut parts = original.clone().into_parts();
    parts.scheme = target.scheme().cloned();
    parts.authority = target.authority().cloned();
    Uri::from_parts(parts).map_err(|err| anyhow::anyhow!("construct upstream uri: {err}"))
}

fn set_host_header(headers: &mut HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    let Ok(value) = HeaderValue::from_str(authority.as_str()) else {
        return;
    };
    headers.insert(header::HOST, value);
}

pub(crate) fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
    headers.remove("proxy-connection");
}

fn header_contains_token(headers: &HeaderMap, header_name: HeaderName, token: &str) -> bool {
    headers.get_all(header_name).iter().any(|value| {
        value.to_str().ok().is_some_and(|raw| {
            raw.split(',')
                .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
        })
    })
}

fn is_websocket_upgrade_request<B>(req: &Request<B>) -> bool {
    if req.method() != Method::GET {
        return false;
    }

    if !header_contains_token(req.headers(), header::CONNECTION, "upgrade") {
        return false;
    }

    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}
