//! HTTP/1.1 upgrade handshake.
//!
//! The request head is parsed with `httparse` and the accept key derived
//! by tungstenite; the responses are written by hand.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Largest request head accepted before the terminating blank line.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// Metadata cached from the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Request target.
    pub uri: String,
    /// `Host` header.
    pub host: Option<String>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// `Origin` header.
    pub origin: Option<String>,
    /// `Accept-Encoding` header.
    pub accept_encoding: Option<String>,
}

/// An HTTP error to send instead of upgrading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpError {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: &'static str,
}

impl HttpError {
    pub(crate) const fn bad_request() -> Self {
        Self {
            status: 400,
            reason: "Bad Request",
        }
    }
}

/// A request that passed upgrade validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrade {
    /// Cached request metadata.
    pub info: RequestInfo,
    /// `Sec-WebSocket-Key` as sent.
    pub key: String,
}

/// Offset just past the `\r\n\r\n` that ends the request head.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Parse and validate a complete request head.
///
/// `Err` carries the status to answer with; the request metadata that could
/// be parsed is returned alongside it so it can still be logged.
pub fn parse_request(head: &[u8]) -> Result<Upgrade, (HttpError, RequestInfo)> {
    let mut info = RequestInfo::default();
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Err(httparse::Error::Version) => return Err((version_not_supported(), info)),
        Ok(httparse::Status::Partial) | Err(_) => return Err((HttpError::bad_request(), info)),
    }

    info.uri = req.path.unwrap_or_default().to_owned();
    if req.method != Some("GET") {
        return Err((
            HttpError {
                status: 405,
                reason: "Method Not Allowed",
            },
            info,
        ));
    }
    if req.version != Some(1) {
        return Err((version_not_supported(), info));
    }

    let mut connection = None;
    let mut upgrade = None;
    let mut key = None;
    let mut ws_version = None;
    for header in req.headers.iter() {
        let Ok(value) = std::str::from_utf8(header.value) else {
            return Err((HttpError::bad_request(), info));
        };
        let value = value.trim().to_owned();
        match header.name.to_ascii_lowercase().as_str() {
            "host" => info.host = Some(value),
            "user-agent" => info.user_agent = Some(value),
            "origin" => info.origin = Some(value),
            "accept-encoding" => info.accept_encoding = Some(value),
            "connection" => connection = Some(value),
            "upgrade" => upgrade = Some(value),
            "sec-websocket-key" => key = Some(value),
            "sec-websocket-version" => ws_version = Some(value),
            _ => {}
        }
    }

    let upgrading = connection.as_deref().is_some_and(|c| has_token(c, "upgrade"))
        && upgrade.as_deref().is_some_and(|u| u.eq_ignore_ascii_case("websocket"));
    if !upgrading || info.host.is_none() {
        return Err((HttpError::bad_request(), info));
    }
    if ws_version.as_deref() != Some("13") {
        return Err((
            HttpError {
                status: 426,
                reason: "Upgrade Required",
            },
            info,
        ));
    }
    let Some(key) = key.filter(|k| BASE64.decode(k).is_ok_and(|raw| raw.len() == 16)) else {
        return Err((HttpError::bad_request(), info));
    };
    Ok(Upgrade { info, key })
}

fn version_not_supported() -> HttpError {
    HttpError {
        status: 505,
        reason: "HTTP Version Not Supported",
    }
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    tungstenite::handshake::derive_accept_key(key.as_bytes())
}

/// The `101 Switching Protocols` response.
pub fn switching_protocols(key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
    .into_bytes()
}

/// A bodiless error response that closes the connection.
pub fn error_response(err: HttpError) -> Vec<u8> {
    let extra = if err.status == 426 {
        "Sec-WebSocket-Version: 13\r\n"
    } else {
        ""
    };
    format!(
        "HTTP/1.1 {} {}\r\n{}Connection: close\r\nContent-Length: 0\r\n\r\n",
        err.status, err.reason, extra
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "GET /ws/contest HTTP/1.1\r\n\
        Host: judge.local\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Origin: http://judge.local\r\n\
        User-Agent: test\r\n\r\n";

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_valid_upgrade() {
        let up = parse_request(REQUEST.as_bytes()).unwrap();
        assert_eq!(up.info.uri, "/ws/contest");
        assert_eq!(up.info.host.as_deref(), Some("judge.local"));
        assert_eq!(up.info.origin.as_deref(), Some("http://judge.local"));
        assert_eq!(up.info.user_agent.as_deref(), Some("test"));
        assert_eq!(up.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_head_end(REQUEST.as_bytes()), Some(REQUEST.len()));
    }

    #[test]
    fn plain_get_is_rejected() {
        let (err, info) = parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(info.uri, "/");
    }

    #[test]
    fn wrong_version_asks_for_13() {
        let req = REQUEST.replace("Version: 13", "Version: 8");
        let (err, _) = parse_request(req.as_bytes()).unwrap_err();
        assert_eq!(err.status, 426);
        let resp = String::from_utf8(error_response(err)).unwrap();
        assert!(resp.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(resp.contains("Sec-WebSocket-Version: 13\r\n"));
    }

    #[test]
    fn http_1_0_is_refused() {
        let req = REQUEST.replace("HTTP/1.1", "HTTP/1.0");
        let (err, info) = parse_request(req.as_bytes()).unwrap_err();
        assert_eq!(err.status, 505);
        assert_eq!(info.uri, "/ws/contest");
    }

    #[test]
    fn post_is_refused() {
        let req = REQUEST.replace("GET ", "POST ");
        assert_eq!(parse_request(req.as_bytes()).unwrap_err().0.status, 405);
    }

    #[test]
    fn malformed_header_line_is_bad_request() {
        let req = "GET / HTTP/1.1\r\nHost x\r\n\r\n";
        assert_eq!(parse_request(req.as_bytes()).unwrap_err().0.status, 400);
    }

    #[test]
    fn switching_protocols_carries_accept() {
        let resp = String::from_utf8(switching_protocols("dGhlIHNhbXBsZSBub25jZQ==")).unwrap();
        assert!(resp.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(resp.ends_with("\r\n\r\n"));
    }
}
