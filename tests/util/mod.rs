#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::HeaderValue,
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot};

use testproxy::{config::Config, proxy::ProxyHandle};

pub type TestClient = Client<HttpConnector, Full<Bytes>>;

/// A real hyper upstream driven by a synchronous handler closure. Requests
/// carrying an `x-delay-ms` header are answered after that delay, which lets
/// tests hold an exchange in flight across a mode switch.
pub struct Upstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl Upstream {
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub async fn spawn_upstream<F>(handler: F) -> Upstream
where
    F: Fn(&hyper::http::request::Parts, &[u8]) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);
    let task_hits = Arc::clone(&hits);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let handler = Arc::clone(&handler);
                    let hits = Arc::clone(&task_hits);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let handler = Arc::clone(&handler);
                            let hits = Arc::clone(&hits);
                            async move {
                                let (parts, body) = req.into_parts();
                                let body_bytes = body.collect().await.unwrap().to_bytes();
                                if let Some(delay_ms) = parts
                                    .headers
                                    .get("x-delay-ms")
                                    .and_then(|value| value.to_str().ok())
                                    .and_then(|value| value.parse::<u64>().ok())
                                {
                                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                                }
                                hits.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, hyper::Error>(handler(&parts, &body_bytes))
                            }
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        let _ = builder.serve_connection(io, service).await;
                    });
                }
            }
        }
    });

    Upstream {
        addr,
        hits,
        shutdown_tx,
        join,
    }
}

pub fn json_body(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

pub fn text_body(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_owned())));
    *response.status_mut() = status;
    response
}

pub async fn start_proxy(upstream_addr: SocketAddr, recordings_dir: &Path) -> ProxyHandle {
    start_proxy_for_target(&format!("http://{upstream_addr}"), recordings_dir).await
}

pub async fn start_proxy_for_target(target: &str, recordings_dir: &Path) -> ProxyHandle {
    let config = Config {
        targets: vec![target.parse().unwrap()],
        port: 0,
        recordings_dir: recordings_dir.to_path_buf(),
    };
    testproxy::proxy::serve(&config).await.unwrap()
}

pub fn client() -> TestClient {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    Client::builder(TokioExecutor::new()).build(connector)
}

pub fn proxy_url(proxy: &ProxyHandle, path_and_query: &str) -> Uri {
    format!(
        "http://127.0.0.1:{}{path_and_query}",
        proxy.listen_addr.port()
    )
    .parse()
    .unwrap()
}

pub fn request(method: Method, uri: Uri, body: &[u8]) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::from(body.to_vec())))
        .unwrap()
}

pub async fn send(
    client: &TestClient,
    req: Request<Full<Bytes>>,
) -> (StatusCode, HeaderMap, Bytes) {
    let res = client.request(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

pub async fn control_post(
    client: &TestClient,
    proxy: &ProxyHandle,
    payload: Value,
) -> (StatusCode, HeaderMap, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(proxy_url(proxy, "/__control"))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload.to_string())))
        .unwrap();
    let (status, headers, body) = send(client, req).await;
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, headers, json)
}

pub async fn set_mode(client: &TestClient, proxy: &ProxyHandle, mode: &str, id: Option<&str>) {
    let mut payload = serde_json::json!({ "mode": mode });
    if let Some(id) = id {
        payload["id"] = Value::String(id.to_owned());
    }
    let (status, _headers, body) = control_post(client, proxy, payload).await;
    assert_eq!(status, StatusCode::OK, "mode switch failed: {body}");
}

pub fn read_session_file(recordings_dir: &Path, id: &str) -> Value {
    let path = recordings_dir.join(format!("{id}.mock.json"));
    let raw = std::fs::read(&path)
        .unwrap_or_else(|err| panic!("read session file {}: {err}", path.display()));
    serde_json::from_slice(&raw).unwrap()
}

pub fn assert_cors_headers(headers: &HeaderMap, expected_origin: &str) {
    assert_eq!(
        headers
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some(expected_origin)
    );
    assert_eq!(
        headers
            .get("access-control-allow-credentials")
            .and_then(|value| value.to_str().ok()),
        Some("true")
    );
    assert!(headers.get("access-control-allow-headers").is_some());
    assert!(headers.get("access-control-allow-methods").is_some());
    assert_eq!(
        headers
            .get("access-control-expose-headers")
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
}
