//! `Accept` header negotiation for find responses.

use axum::http::HeaderMap;
use axum::http::header::ACCEPT;
use mime::Mime;

pub const MEDIA_TYPE_NDJSON: &str = "application/x-ndjson";
pub const MEDIA_TYPE_JSON: &str = "application/json";
pub const MEDIA_TYPE_ANY: &str = "*/*";

/// Which supported media types a request accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Accepts {
    pub any: bool,
    pub ndjson: bool,
    pub json: bool,
    pub header_found: bool,
}

/// Parse every `Accept` header value, tolerating comma-separated lists
/// and media type parameters. An unparseable media type is an error and
/// surfaces as 400 to the client.
pub fn get_accepts(headers: &HeaderMap) -> Result<Accepts, String> {
    let mut acc = Accepts::default();
    for value in headers.get_all(ACCEPT) {
        acc.header_found = true;
        let value = value
            .to_str()
            .map_err(|_| "non-ascii Accept header".to_string())?;
        for part in value.split(',') {
            let mime: Mime = part
                .trim()
                .parse()
                .map_err(|e| format!("invalid media type {part:?}: {e}"))?;
            match mime.essence_str() {
                MEDIA_TYPE_NDJSON => acc.ndjson = true,
                MEDIA_TYPE_JSON => acc.json = true,
                MEDIA_TYPE_ANY => acc.any = true,
                _ => {}
            }
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(accept: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(ACCEPT, HeaderValue::from_str(accept).unwrap());
        h
    }

    #[test]
    fn browser_accept_counts_as_any() {
        let acc = get_accepts(&headers(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,*/*;q=0.8",
        ))
        .unwrap();
        assert!(acc.any);
        assert!(!acc.json);
        assert!(!acc.ndjson);
        assert!(acc.header_found);
    }

    #[test]
    fn json_and_ndjson_detected() {
        assert!(get_accepts(&headers("application/json")).unwrap().json);
        assert!(get_accepts(&headers("application/x-ndjson")).unwrap().ndjson);
        let both = get_accepts(&headers("application/json, application/x-ndjson")).unwrap();
        assert!(both.json && both.ndjson);
    }

    #[test]
    fn extra_whitespace_tolerated() {
        let acc = get_accepts(&headers(
            "text/html,application/xhtml+xml   ,   application/json;q=0.9",
        ))
        .unwrap();
        assert!(acc.json);
    }

    #[test]
    fn missing_header_reports_not_found() {
        let acc = get_accepts(&HeaderMap::new()).unwrap();
        assert_eq!(acc, Accepts::default());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(get_accepts(&headers(";;;;")).is_err());
    }

    #[test]
    fn unsupported_types_are_ignored_not_errors() {
        let acc = get_accepts(&headers("text/html")).unwrap();
        assert!(acc.header_found);
        assert!(!acc.any && !acc.json && !acc.ndjson);
    }
}
