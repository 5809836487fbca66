use hyper::{
    HeaderMap,
    header::{self, HeaderValue},
};

const DEFAULT_ALLOW_HEADERS: &str =
    "Origin, X-Requested-With, Content-Type, Accept, Authorization, x-test-rcrd-id";
const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";
const PREFLIGHT_MAX_AGE: &str = "86400";

/// CORS header overlay captured from an incoming request.
///
/// Applied to every response the proxy emits, including errors and replay
/// misses. Upstream headers are preserved; the overlay wins only on the five
/// `access-control-*` names it sets.
#[derive(Debug, Clone)]
pub struct Overlay {
    origin: Option<HeaderValue>,
    request_headers: Option<HeaderValue>,
}

impl Overlay {
    pub fn from_request(headers: &HeaderMap) -> Self {
        Self {
            origin: headers.get(header::ORIGIN).cloned(),
            request_headers: headers
                .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
                .cloned(),
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        let allow_origin = self
            .origin
            .clone()
            .unwrap_or_else(|| HeaderValue::from_static("*"));
        let allow_headers = self
            .request_headers
            .clone()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOW_HEADERS));

        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("*"),
        );
    }

    /// Extends a preflight answer with its cache lifetime.
    pub fn apply_preflight(&self, headers: &mut HeaderMap) {
        self.apply(headers);
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(PREFLIGHT_MAX_AGE),
        );
    }
}

#[cfg(test)]
mod tests {
    use hyper::{HeaderMap, header::HeaderValue};

    use super::Overlay;

    #[test]
    fn overlay_echoes_request_origin_and_headers() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert("origin", HeaderValue::from_static("http://localhost:3000"));
        request_headers.insert(
            "access-control-request-headers",
            HeaderValue::from_static("X-Foo"),
        );

        let mut headers = HeaderMap::new();
        Overlay::from_request(&request_headers).apply(&mut headers);

        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(headers.get("access-control-allow-headers").unwrap(), "X-Foo");
        assert_eq!(
            headers.get("access-control-allow-credentials").unwrap(),
            "true"
        );
        assert_eq!(headers.get("access-control-expose-headers").unwrap(), "*");
    }

    #[test]
    fn overlay_falls_back_to_wildcard_and_default_header_list() {
        let mut headers = HeaderMap::new();
        Overlay::from_request(&HeaderMap::new()).apply(&mut headers);

        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        let allow_headers = headers
            .get("access-control-allow-headers")
            .and_then(|value| value.to_str().ok())
            .unwrap();
        assert!(allow_headers.contains("x-test-rcrd-id"));
        assert_eq!(
            headers.get("access-control-allow-methods").unwrap(),
            "GET, POST, PUT, DELETE, PATCH, OPTIONS"
        );
    }

    #[test]
    fn preflight_adds_max_age() {
        let mut headers = HeaderMap::new();
        Overlay::from_request(&HeaderMap::new()).apply_preflight(&mut headers);
        assert_eq!(headers.get("access-control-max-age").unwrap(), "86400");
    }

    #[test]
    fn overlay_overrides_existing_cors_headers() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert("origin", HeaderValue::from_static("http://app.test"));

        let mut headers = HeaderMap::new();
        headers.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("http://upstream.test"),
        );
        Overlay::from_request(&request_headers).apply(&mut headers);

        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "http://app.test"
        );
    }
}
