pub mod http;
pub mod resolver;
pub mod tcp;

use bytes::Bytes;
use ::http::header::HeaderName;
use ::http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Small JSON error body for proxy and admin 4xx/5xx responses.
pub fn json_error(status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
        .unwrap()
}

/// Hop-by-hop headers, stripped in both directions. These describe a single
/// transport hop and must not survive proxying (RFC 9110 §7.6.1).
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(HeaderName::from_static(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_headers_stripped_end_to_end_names() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive, x-trace".parse().unwrap());
        headers.insert("x-trace", "42".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("proxy-authenticate", "basic".parse().unwrap());
        headers.insert("proxy-authorization", "basic Zm9v".parse().unwrap());
        headers.insert("trailer", "expires".parse().unwrap());
        headers.insert("x-resp", "ok".parse().unwrap());

        remove_hop_headers(&mut headers);

        // end-to-end headers survive, the whole hop-by-hop set is gone
        assert_eq!(headers.get("x-trace").unwrap(), "42");
        assert_eq!(headers.get("x-resp").unwrap(), "ok");
        assert_eq!(headers.len(), 2);
    }
}
