// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP wire codec.
//!
//! Parses raw bytes into [`Request`]/[`Response`] values and serializes them
//! back in the canonical header order, recomputing `Content-Length` from the
//! body. Header parsing tolerates RFC 3261 §7.3.1 LWS folding, accepts
//! compact header names and is case-insensitive throughout.
//!
//! # Example
//! ```
//! use dial_parse::{parse_request, serialize_request};
//! use bytes::Bytes;
//! # let raw = b"OPTIONS sip:example.com SIP/2.0\r\nVia: SIP/2.0/UDP host;branch=z9hG4bKabcdef1\r\nMax-Forwards: 70\r\nTo: <sip:example.com>\r\nFrom: <sip:alice@example.com>;tag=88\r\nCall-ID: x@host\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let request = parse_request(&Bytes::from_static(raw)).unwrap();
//! let bytes = serialize_request(&request);
//! assert!(bytes.starts_with(b"OPTIONS sip:example.com SIP/2.0\r\n"));
//! ```

use bytes::{Bytes, BytesMut};
use dial_core::{
    headers::{CONTENT_LENGTH_RANK, CONTENT_TYPE_RANK, OTHERS_RANK},
    serialization_rank, Headers, Method, Request, RequestLine, Response, SipUri, StatusLine,
};
pub use dial_core::SipMessage;
use smol_str::SmolStr;

/// Hard upper bound for a single parsed message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest Content-Length value the codec accepts. Anything bigger is
/// treated as hostile input rather than a plausible SIP body.
const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// Reasons the parser gives up on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The first line is not a valid request or status line.
    MalformedStartLine,
    /// A header line has no colon or an empty name.
    MalformedHeader { line: String },
    /// Content-Length is non-numeric, oversized, or self-contradictory.
    BadContentLength,
    /// The header section never terminates with CRLFCRLF.
    UnterminatedHeader,
    /// The body is shorter than the declared Content-Length.
    Truncated,
    /// The version token is not `SIP/2.0`.
    UnsupportedVersion,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MalformedStartLine => write!(f, "malformed start line"),
            ParseError::MalformedHeader { line } => write!(f, "malformed header line: {:?}", line),
            ParseError::BadContentLength => write!(f, "bad Content-Length"),
            ParseError::UnterminatedHeader => write!(f, "unterminated header section"),
            ParseError::Truncated => write!(f, "message truncated before declared body end"),
            ParseError::UnsupportedVersion => write!(f, "unsupported SIP version"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses a datagram into either a request or a response.
pub fn parse(datagram: &Bytes) -> Result<SipMessage, ParseError> {
    let head = peek_first_line(datagram)?;
    if head.len() >= 8 && head[..8].eq_ignore_ascii_case("SIP/2.0 ") {
        parse_response(datagram).map(SipMessage::Response)
    } else {
        parse_request(datagram).map(SipMessage::Request)
    }
}

/// Parses a SIP request from raw bytes.
pub fn parse_request(datagram: &Bytes) -> Result<Request, ParseError> {
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = unfold_lines(head);
    let first = lines.next().ok_or(ParseError::MalformedStartLine)?;
    let (method, uri) = parse_request_line(&first)?;
    let headers = parse_headers(lines)?;
    let body = extract_body(body_bytes, &headers)?;
    Ok(Request::new(RequestLine::new(method, uri), headers, body))
}

/// Parses a SIP response from raw bytes.
pub fn parse_response(datagram: &Bytes) -> Result<Response, ParseError> {
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = unfold_lines(head);
    let first = lines.next().ok_or(ParseError::MalformedStartLine)?;
    let status = parse_status_line(&first)?;
    let headers = parse_headers(lines)?;
    let body = extract_body(body_bytes, &headers)?;
    Ok(Response::new(status, headers, body))
}

/// Serializes a request in the canonical header order, appending a
/// recomputed `Content-Length` as the final header.
pub fn serialize_request(req: &Request) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();
    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.method().as_str(),
        req.uri(),
        req.start_line().version().as_str()
    );
    write_headers(&mut buf, req.headers(), req.body().len());
    finish(buf, req.body())
}

/// Serializes a response in the canonical header order, appending a
/// recomputed `Content-Length` as the final header.
pub fn serialize_response(res: &Response) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();
    let _ = write!(
        buf,
        "{} {} {}\r\n",
        res.start_line().version().as_str(),
        res.code(),
        res.reason()
    );
    write_headers(&mut buf, res.headers(), res.body().len());
    finish(buf, res.body())
}

/// Serializes either message kind.
pub fn serialize(message: &SipMessage) -> Bytes {
    match message {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(res) => serialize_response(res),
    }
}

fn finish(buf: String, body: &Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(buf.len() + 2 + body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.as_ref());
    out.freeze()
}

fn write_headers(buf: &mut String, headers: &Headers, body_len: usize) {
    use std::fmt::Write;

    // Stable sort by canonical rank: the known order first, everything else
    // in insertion order, Content-Type second to last, Content-Length
    // (recomputed) always last.
    let mut ordered: Vec<_> = headers
        .iter()
        .filter(|h| !h.name().eq_ignore_ascii_case("Content-Length"))
        .collect();
    ordered.sort_by_key(|h| rank_for(h.name()));

    for header in ordered {
        let _ = write!(buf, "{}: {}\r\n", header.name(), header.value().trim());
    }
    let _ = write!(buf, "Content-Length: {}\r\n", body_len);
}

fn rank_for(name: &str) -> usize {
    if name.eq_ignore_ascii_case("Content-Type") {
        CONTENT_TYPE_RANK
    } else if name.eq_ignore_ascii_case("Content-Length") {
        CONTENT_LENGTH_RANK
    } else {
        let rank = serialization_rank(name);
        rank.min(OTHERS_RANK)
    }
}

fn peek_first_line(datagram: &Bytes) -> Result<&str, ParseError> {
    let data = datagram.as_ref();
    let end = data
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(data.len());
    std::str::from_utf8(&data[..end]).map_err(|_| ParseError::MalformedStartLine)
}

/// Splits raw bytes into header text and body slice at the first CRLFCRLF.
fn split_head_body(datagram: &Bytes) -> Result<(&str, &[u8]), ParseError> {
    let data = datagram.as_ref();
    if data.is_empty() {
        return Err(ParseError::Truncated);
    }
    if data.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return Err(ParseError::BadContentLength);
    }
    let delim = b"\r\n\r\n";
    match data.windows(delim.len()).position(|window| window == delim) {
        Some(pos) => {
            let head =
                std::str::from_utf8(&data[..pos]).map_err(|_| ParseError::MalformedHeader {
                    line: "<non-utf8>".into(),
                })?;
            Ok((head, &data[pos + delim.len()..]))
        }
        None => Err(ParseError::UnterminatedHeader),
    }
}

/// Splits the header section into logical lines, unfolding RFC 3261 §7.3.1
/// continuations: a line starting with SP/HTAB extends the previous logical
/// line, joined by exactly one space.
fn unfold_lines(head: &str) -> impl Iterator<Item = String> + '_ {
    let mut logical: Vec<String> = Vec::new();
    for raw in head.split("\r\n") {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = logical.last_mut() {
                last.push(' ');
                last.push_str(raw.trim());
                continue;
            }
        }
        logical.push(raw.to_owned());
    }
    logical.into_iter()
}

fn parse_headers<I>(lines: I) -> Result<Headers, ParseError>
where
    I: IntoIterator<Item = String>,
{
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader { line: line.clone() })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::MalformedHeader { line: line.clone() });
        }
        headers.push(name, collapse_ws(value.trim()));
    }
    Ok(headers)
}

/// Collapses internal runs of whitespace to single spaces. Folded values
/// arrive here with the join already normalized; this also flattens any
/// HTAB runs a peer embedded in a single physical line.
fn collapse_ws(value: &str) -> SmolStr {
    let mut out = String::with_capacity(value.len());
    let mut in_ws = false;
    for ch in value.chars() {
        if ch == ' ' || ch == '\t' {
            in_ws = true;
            continue;
        }
        if in_ws && !out.is_empty() {
            out.push(' ');
        }
        in_ws = false;
        out.push(ch);
    }
    SmolStr::new(out)
}

/// Parses the request line into method and Request-URI.
fn parse_request_line(line: &str) -> Result<(Method, SipUri), ParseError> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) =
        parser(line.trim()).map_err(|_| ParseError::MalformedStartLine)?;

    if !version_token.trim().eq_ignore_ascii_case("SIP/2.0") {
        return Err(ParseError::UnsupportedVersion);
    }
    let method = Method::from_token(method_token);
    let uri = SipUri::parse(uri_token).map_err(|_| ParseError::MalformedStartLine)?;
    Ok((method, uri))
}

/// Parses the status line of a response.
fn parse_status_line(line: &str) -> Result<StatusLine, ParseError> {
    use nom::{
        bytes::complete::take_while1,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(|c: char| !c.is_whitespace()),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (version, _, code, _, reason)) =
        parser(line.trim()).map_err(|_| ParseError::MalformedStartLine)?;

    if !version.eq_ignore_ascii_case("SIP/2.0") {
        return Err(ParseError::UnsupportedVersion);
    }
    StatusLine::new(code, reason.trim()).map_err(|_| ParseError::MalformedStartLine)
}

/// Bounds the body by the declared Content-Length.
///
/// For datagram input the frame is authoritative: a declared length longer
/// than the remaining bytes is [`ParseError::Truncated`], surplus bytes
/// after the declared length are dropped. An unparseable or contradictory
/// declaration is [`ParseError::BadContentLength`].
fn extract_body(body_bytes: &[u8], headers: &Headers) -> Result<Bytes, ParseError> {
    let declared = content_length(headers)?;
    match declared {
        None => Ok(Bytes::copy_from_slice(body_bytes)),
        Some(len) if len > body_bytes.len() => Err(ParseError::Truncated),
        Some(len) => Ok(Bytes::copy_from_slice(&body_bytes[..len])),
    }
}

/// Validates every Content-Length occurrence and returns the agreed value.
pub fn content_length(headers: &Headers) -> Result<Option<usize>, ParseError> {
    let mut found: Option<usize> = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::BadContentLength)?;
        if parsed > MAX_CONTENT_LENGTH as u64 {
            return Err(ParseError::BadContentLength);
        }
        let parsed = parsed as usize;
        match found {
            Some(existing) if existing != parsed => return Err(ParseError::BadContentLength),
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

// Permissive URI set: anything up to the next whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}
