use md5::{Digest as _, Md5};
use sha3::{
    Shake256,
    digest::{ExtendableOutput as _, Update as _, XofReader as _},
};

const QUERY_HASH_HEX_LEN: usize = 16;
const SESSION_FILE_SUFFIX: &str = ".mock.json";
const SESSION_HASH_HEX_LEN: usize = 8;
// Conservative bound for a single path component on common filesystems.
const MAX_FILE_NAME_LEN: usize = 255;

/// Computes the key that groups recordings of the same endpoint.
///
/// The key is `METHOD_SEGMENTS[_HEX16].json`: path segments joined with `_`
/// (`root` for the empty path) and, when the URL carries a query string, the
/// first 16 hex chars of its MD5 digest. Headers never participate; two
/// requests share a key iff method, path, and raw query string are equal.
pub fn recording_key(method: &str, url: &str) -> String {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };

    let mut key = method.to_ascii_uppercase();
    key.push('_');

    let mut wrote_segment = false;
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if wrote_segment {
            key.push('_');
        }
        key.push_str(segment);
        wrote_segment = true;
    }
    if !wrote_segment {
        key.push_str("root");
    }

    if let Some(query) = query.filter(|query| !query.is_empty()) {
        let digest = Md5::digest(query.as_bytes());
        let hex = hex_encode(&digest);
        key.push('_');
        key.push_str(&hex[..QUERY_HASH_HEX_LEN]);
    }

    key.push_str(".json");
    sanitize_file_name(&key)
}

/// Key for a WebSocket recording, derived from the upgrade URL (path+query).
pub fn websocket_key(url: &str) -> String {
    format!("WS_{}", sanitize_file_name(url))
}

/// File name for a persisted session: `sanitize(id with / -> __) + .mock.json`.
///
/// Ids longer than the filesystem component limit are truncated and suffixed
/// with 8 hex chars of Shake256 over the original id, so distinct long ids
/// still map to distinct files.
pub fn session_file_name(id: &str) -> String {
    let stem = sanitize_file_name(&id.replace('/', "__"));
    let max_stem_len = MAX_FILE_NAME_LEN - SESSION_FILE_SUFFIX.len();
    if stem.len() <= max_stem_len {
        return format!("{stem}{SESSION_FILE_SUFFIX}");
    }

    let hash = shake_hex(id.as_bytes(), SESSION_HASH_HEX_LEN);
    // The sanitized stem is pure ASCII, so byte slicing cannot split a char.
    let kept = &stem[..max_stem_len - SESSION_HASH_HEX_LEN];
    format!("{kept}{hash}{SESSION_FILE_SUFFIX}")
}

/// Replaces every char outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_name(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn shake_hex(input: &[u8], hex_len: usize) -> String {
    let mut hasher = Shake256::default();
    hasher.update(input);
    let mut digest = vec![0u8; hex_len.div_ceil(2)];
    hasher.finalize_xof().read(&mut digest);
    let mut hex = hex_encode(&digest);
    hex.truncate(hex_len);
    hex
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = vec![0u8; bytes.len() * 2];
    for (idx, byte) in bytes.iter().copied().enumerate() {
        out[idx * 2] = HEX[(byte >> 4) as usize];
        out[idx * 2 + 1] = HEX[(byte & 0x0f) as usize];
    }
    // Safety: HEX digits are valid UTF-8.
    unsafe { String::from_utf8_unchecked(out) }
}

#[cfg(test)]
mod tests {
    use super::{recording_key, sanitize_file_name, session_file_name, websocket_key};

    #[test]
    fn recording_key_is_deterministic() {
        assert_eq!(
            recording_key("get", "/api/posts"),
            recording_key("GET", "/api/posts")
        );
        assert_eq!(recording_key("GET", "/api/posts"), "GET_api_posts.json");
    }

    #[test]
    fn recording_key_maps_empty_path_to_root() {
        assert_eq!(recording_key("GET", "/"), "GET_root.json");
        assert_eq!(recording_key("GET", ""), "GET_root.json");
    }

    #[test]
    fn recording_key_hashes_query_strings() {
        let with_query = recording_key("GET", "/search?q=a");
        let other_query = recording_key("GET", "/search?q=b");
        let without_query = recording_key("GET", "/search");

        assert_ne!(with_query, other_query);
        assert_ne!(with_query, without_query);
        assert_eq!(without_query, "GET_search.json");
        // METHOD_search_<16 hex>.json
        let suffix = with_query
            .strip_prefix("GET_search_")
            .and_then(|rest| rest.strip_suffix(".json"))
            .expect("query key should carry a hash suffix");
        assert_eq!(suffix.len(), 16);
        assert!(suffix.bytes().all(|byte| byte.is_ascii_hexdigit()));
    }

    #[test]
    fn recording_key_distinguishes_query_order() {
        // Keys collide iff the raw query strings are byte-equal.
        assert_ne!(
            recording_key("GET", "/api?a=1&b=2"),
            recording_key("GET", "/api?b=2&a=1")
        );
    }

    #[test]
    fn recording_key_sanitizes_unsafe_chars() {
        let key = recording_key("GET", "/api/items:all");
        assert_eq!(key, "GET_api_items_all.json");
    }

    #[test]
    fn websocket_key_prefixes_sanitized_url() {
        assert_eq!(websocket_key("/ws"), "WS__ws");
        assert_eq!(websocket_key("/ws/feed?v=2"), "WS__ws_feed_v_2");
    }

    #[test]
    fn session_file_name_flattens_path_separators() {
        assert_eq!(
            session_file_name("suite/login spec"),
            "suite__login_spec.mock.json"
        );
    }

    #[test]
    fn session_file_name_truncates_long_ids_distinctly() {
        let long_a = "a".repeat(400);
        let long_b = format!("{}b", "a".repeat(399));

        let name_a = session_file_name(&long_a);
        let name_b = session_file_name(&long_b);

        assert!(name_a.len() <= 255);
        assert!(name_a.ends_with(".mock.json"));
        assert_ne!(name_a, name_b, "hash suffix should keep long ids unique");
    }

    #[test]
    fn sanitize_file_name_keeps_safe_chars() {
        assert_eq!(sanitize_file_name("a-b_c.d9"), "a-b_c.d9");
        assert_eq!(sanitize_file_name("a/b\\c?d"), "a_b_c_d");
    }
}
