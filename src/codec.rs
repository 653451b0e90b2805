//! The wire-protocol codec: a text-header region terminated by a blank
//! line, optionally followed by a JSON (or raw) body.
//!
//! ```text
//! MOO/1 <VERB> <name>\n
//! <Header-Name>: <value>\n
//! ...
//! \n
//! <body bytes>
//! ```

use std::collections::BTreeMap;

use serde_json::Value;

const PROTOCOL_TAG: &str = "MOO/1";

/// One of the three verbs the wire protocol carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Request,
    Continue,
    Complete,
}

impl Verb {
    fn as_wire_str(self) -> &'static str {
        match self {
            Verb::Request => "REQUEST",
            Verb::Continue => "CONTINUE",
            Verb::Complete => "COMPLETE",
        }
    }

    fn parse(token: &str) -> Option<Verb> {
        match token.to_ascii_lowercase().as_str() {
            "request" => Some(Verb::Request),
            "continue" => Some(Verb::Continue),
            "complete" => Some(Verb::Complete),
            _ => None,
        }
    }
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    None,
    Json(Value),
    Raw(Vec<u8>),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// One message in the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub verb: Verb,
    pub name: String,
    pub request_id: Option<u64>,
    /// Every header observed on the wire, case preserved, including the
    /// recognized ones (`Content-Type`, `Content-Length`, `Request-Id`).
    /// Unrecognized headers pass through here untouched.
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// Find the earliest occurrence of either line-ending's blank-line
/// terminator and return `(header_end, body_start)`, where `header_end` is
/// the offset of the start of the terminator and `body_start` is the
/// offset of the first body byte.
fn find_header_end(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut lf_lf = None;
    let mut crlf_crlf = None;
    for i in 0..bytes.len() {
        if lf_lf.is_none() && bytes[i..].starts_with(b"\n\n") {
            lf_lf = Some((i, i + 2));
        }
        if crlf_crlf.is_none() && bytes[i..].starts_with(b"\r\n\r\n") {
            crlf_crlf = Some((i, i + 4));
        }
        if lf_lf.is_some() || crlf_crlf.is_some() {
            break
        }
    }
    match (lf_lf, crlf_crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Decode a complete wire message. Returns `None` when the header region is
/// not yet terminated, the first line is malformed, or the declared
/// `Content-Length` would exceed the available bytes. Never panics on
/// truncated input; callers rely on the transport's reassembly to supply
/// complete messages.
pub fn parse(bytes: &[u8]) -> Option<Frame> {
    let (header_end, body_start) = find_header_end(bytes)?;
    let header_text = std::str::from_utf8(&bytes[..header_end]).ok()?;

    let mut lines = header_text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let first_line = lines.next()?;
    let mut tokens = first_line.splitn(3, ' ');
    let tag = tokens.next()?;
    if tag != PROTOCOL_TAG {
        return None
    }
    let verb = Verb::parse(tokens.next()?)?;
    let name = tokens.next()?.to_string();
    if name.is_empty() {
        return None
    }

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue
        }
        let (key, value) = line.split_once(':')?;
        headers.insert(key.to_string(), value.trim_start().to_string());
    }

    let request_id = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("request-id"))
        .and_then(|(_, v)| v.parse::<u64>().ok());

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok());

    let content_type =
        headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("content-type")).map(|(_, v)| v.as_str());

    let body = match content_length {
        Some(len) => {
            if body_start + len > bytes.len() {
                return None
            }
            let raw = &bytes[body_start..body_start + len];
            if content_type == Some("application/json") && len > 0 {
                match serde_json::from_slice::<Value>(raw) {
                    Ok(value) => Body::Json(value),
                    // a JSON body that fails to parse surfaces as raw bytes,
                    // not a decode failure
                    Err(_) => Body::Raw(raw.to_vec()),
                }
            } else if len > 0 {
                Body::Raw(raw.to_vec())
            } else {
                Body::None
            }
        }
        None => Body::None,
    };

    Some(Frame { verb, name, request_id, headers, body })
}

fn push_header_region(out: &mut Vec<u8>, verb: Verb, name: &str, request_id: u64, body: Option<&Value>) {
    out.extend_from_slice(format!("{PROTOCOL_TAG} {} {name}\n", verb.as_wire_str()).as_bytes());
    out.extend_from_slice(format!("Request-Id: {request_id}\n").as_bytes());

    if let Some(body) = body {
        let encoded = serde_json::to_vec(body).expect("Value always serializes");
        out.extend_from_slice(b"Content-Type: application/json\n");
        out.extend_from_slice(format!("Content-Length: {}\n", encoded.len()).as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&encoded);
    } else {
        out.push(b'\n');
    }
}

/// Encode a `REQUEST` frame.
pub fn encode_request(request_id: u64, path: &str, body: Option<&Value>) -> Vec<u8> {
    let mut out = Vec::new();
    push_header_region(&mut out, Verb::Request, path, request_id, body);
    out
}

/// Encode a `CONTINUE` or `COMPLETE` response frame.
pub fn encode_response(verb: Verb, name: &str, request_id: u64, body: Option<&Value>) -> Vec<u8> {
    debug_assert!(matches!(verb, Verb::Continue | Verb::Complete));
    let mut out = Vec::new();
    push_header_region(&mut out, verb, name, request_id, body);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_request_with_json_body() {
        let body = json!({"subscription_key": 0});
        let bytes = encode_request(11, "com.roonlabs.transport:2/subscribe_zones", Some(&body));
        let frame = parse(&bytes).unwrap();
        assert_eq!(frame.verb, Verb::Request);
        assert_eq!(frame.name, "com.roonlabs.transport:2/subscribe_zones");
        assert_eq!(frame.request_id, Some(11));
        assert_eq!(frame.body.as_json(), Some(&body));
    }

    #[test]
    fn round_trips_response_with_empty_body() {
        let bytes = encode_response(Verb::Complete, "Success", 3, None);
        let frame = parse(&bytes).unwrap();
        assert_eq!(frame.verb, Verb::Complete);
        assert_eq!(frame.name, "Success");
        assert_eq!(frame.request_id, Some(3));
        assert_eq!(frame.body, Body::None);
    }

    #[test]
    fn handles_crlf_terminated_headers() {
        let raw = b"MOO/1 COMPLETE Success\r\nRequest-Id: 7\r\n\r\n";
        let frame = parse(raw).unwrap();
        assert_eq!(frame.request_id, Some(7));
        assert_eq!(frame.body, Body::None);
    }

    #[test]
    fn returns_none_for_incomplete_header_region() {
        let raw = b"MOO/1 REQUEST com.roonlabs.ping:1/ping\nRequest-Id: 1\n";
        assert!(parse(raw).is_none());
    }

    #[test]
    fn returns_none_when_content_length_exceeds_remaining_bytes() {
        let raw = b"MOO/1 COMPLETE Success\nRequest-Id: 1\nContent-Type: application/json\nContent-Length: 100\n\n{}";
        assert!(parse(raw).is_none());
    }

    #[test]
    fn returns_none_for_malformed_first_line() {
        let raw = b"GARBAGE\n\n";
        assert!(parse(raw).is_none());
    }

    #[test]
    fn unparseable_json_body_surfaces_as_raw_bytes() {
        let raw = b"MOO/1 COMPLETE Success\nRequest-Id: 1\nContent-Type: application/json\nContent-Length: 5\n\nnotjs";
        let frame = parse(raw).unwrap();
        assert_eq!(frame.body, Body::Raw(b"notjs".to_vec()));
    }

    #[test]
    fn preserves_opaque_headers() {
        let raw = b"MOO/1 COMPLETE Success\nRequest-Id: 1\nX-Custom: value\n\n";
        let frame = parse(raw).unwrap();
        assert_eq!(frame.header("X-Custom"), Some("value"));
    }
}
