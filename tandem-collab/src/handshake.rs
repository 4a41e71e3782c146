//! Upgrade-request validation done before the WebSocket handshake.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! | # | check                          | status | body                                |
//! |---|--------------------------------|--------|-------------------------------------|
//! | 1 | path equals the endpoint path  | 400    | `Supported endpoints: ...`          |
//! | 2 | `Upgrade: websocket` present   | 426    | `Expected Upgrade: websocket`       |
//! | 3 | method is `GET`                | 400    | `Expected GET method`               |
//! | 4 | `user_id` query parameter      | 400    | `User id is required.`              |
//! | 5 | `doc_id` query parameter       | 400    | `Doc id is required.`               |
//!
//! Empty parameter values count as missing.

use url::Url;

/// Identity and document a client asked to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub doc_id: String,
    pub user_id: String,
}

/// A refused upgrade, answered with a plain-text HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
}

impl Rejection {
    fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    /// Full HTTP/1.1 response, connection closed afterwards.
    pub fn to_http_response(&self) -> String {
        let status_text = match self.status {
            426 => "Upgrade Required",
            _ => "Bad Request",
        };
        format!(
            "HTTP/1.1 {} {status_text}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            self.status,
            self.reason.len(),
            self.reason
        )
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.reason)
    }
}

/// Validate a raw request head (request line plus headers) against the
/// endpoint `path`.
pub fn validate_request_head(head: &str, path: &str) -> Result<JoinRequest, Rejection> {
    let wrong_path = || {
        Rejection::new(
            400,
            format!("Supported endpoints: {path}: Expects a WebSocket upgrade request"),
        )
    };

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => (method, target),
        _ => return Err(wrong_path()),
    };

    let url = parse_target(target).ok_or_else(wrong_path)?;
    if url.path() != path {
        return Err(wrong_path());
    }

    let upgrade = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("upgrade"))
        .map(|(_, value)| value.trim());
    if !upgrade.is_some_and(|value| value.eq_ignore_ascii_case("websocket")) {
        return Err(Rejection::new(426, "Expected Upgrade: websocket"));
    }

    if method != "GET" {
        return Err(Rejection::new(400, "Expected GET method"));
    }

    let param = |key: &str| {
        url.query_pairs()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    };
    let user_id = param("user_id").ok_or_else(|| Rejection::new(400, "User id is required."))?;
    let doc_id = param("doc_id").ok_or_else(|| Rejection::new(400, "Doc id is required."))?;

    Ok(JoinRequest { doc_id, user_id })
}

fn parse_target(target: &str) -> Option<Url> {
    if target.starts_with('/') {
        Url::parse(&format!("http://localhost{target}")).ok()
    } else {
        Url::parse(target).ok()
    }
}

/// Byte length of the request head including the blank line, if complete.
pub fn head_length(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}
