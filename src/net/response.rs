use std::collections::BTreeMap;

use super::request::Target;
use crate::error::NetError;

/// Largest response head accepted before giving up on the terminator.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Serializes a minimal HTTP/1.1 GET request.
pub fn build_request(target: &Target, user_agent: &str, offset: u64) -> Vec<u8> {
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Accept: */*\r\n\
         Accept-Language: en-US,en;q=0.9\r\n\
         Connection: close\r\n",
        target.request_target(),
        target.host_header(),
        user_agent,
    );
    if offset > 0 {
        request.push_str(&format!("Range: bytes={offset}-\r\n"));
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Index just past the `\r\n\r\n` ending a response head.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// [`find_header_end`] for a buffer whose first `scanned` bytes were already
/// searched. Only the last three of those can start the terminator.
pub fn resume_header_scan(buf: &[u8], scanned: usize) -> Option<usize> {
    let from = scanned.saturating_sub(3).min(buf.len());
    find_header_end(&buf[from..]).map(|end| end + from)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub protocol: String,
    pub code: u16,
    pub message: String,
}

/// Status line and headers, names lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: Status,
    pub headers: BTreeMap<String, String>,
}

impl ResponseHead {
    pub fn parse(head: &[u8]) -> Result<Self, NetError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| NetError::MalformedResponse("response head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();

        let mut parts = status_line.splitn(3, ' ');
        let protocol = parts.next().unwrap_or_default();
        if !protocol.starts_with("HTTP/") {
            return Err(NetError::MalformedResponse(format!(
                "bad status line {status_line:?}"
            )));
        }
        let code = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| NetError::MalformedResponse(format!("bad status line {status_line:?}")))?;
        let message = parts.next().unwrap_or_default().to_string();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                return Err(NetError::MalformedResponse(format!("bad header line {line:?}")));
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Ok(Self {
            status: Status {
                protocol: protocol.to_string(),
                code,
                message,
            },
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.parse().ok()
    }

    pub fn is_success(&self) -> bool {
        (200..399).contains(&self.status.code)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.header("content-encoding")
    }
}
