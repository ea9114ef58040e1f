// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stream reassembly: splits buffered TCP bytes into complete SIP messages
//! using the CRLFCRLF header terminator and Content-Length.

use bytes::{Buf, Bytes, BytesMut};

/// Maximum size of a message's header section before CRLFCRLF.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum body size a peer may declare via Content-Length.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Framing failures close the connection they occurred on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    HeadersTooLarge { size: usize },
    BodyTooLarge { declared: usize },
    BadContentLength,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::HeadersTooLarge { size } => {
                write!(f, "header section of {} bytes exceeds limit", size)
            }
            FramingError::BodyTooLarge { declared } => {
                write!(f, "declared body of {} bytes exceeds limit", declared)
            }
            FramingError::BadContentLength => write!(f, "unparseable Content-Length"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Extracts every complete SIP message currently buffered, leaving any
/// partial trailing message in place. CRLF keep-alive pings (RFC 5626) are
/// silently consumed.
pub fn drain_frames(buf: &mut BytesMut) -> Result<Vec<Bytes>, FramingError> {
    let mut frames = Vec::new();
    loop {
        consume_leading_crlf(buf);
        if buf.is_empty() {
            break;
        }

        let head_end = match memchr::memmem::find(buf.as_ref(), b"\r\n\r\n") {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_HEADER_SIZE {
                    return Err(FramingError::HeadersTooLarge { size: buf.len() });
                }
                break;
            }
        };
        if head_end > MAX_HEADER_SIZE {
            return Err(FramingError::HeadersTooLarge { size: head_end });
        }

        // Content-Length is mandatory on stream transports (RFC 3261
        // §18.3); a missing header is read as a zero-length body.
        let body_len = parse_content_length(&buf[..head_end])?.unwrap_or(0);
        if body_len > MAX_BODY_SIZE {
            return Err(FramingError::BodyTooLarge { declared: body_len });
        }

        let needed = head_end + 4 + body_len;
        if buf.len() < needed {
            break;
        }
        frames.push(buf.split_to(needed).freeze());
    }
    Ok(frames)
}

fn consume_leading_crlf(buf: &mut BytesMut) {
    while buf.starts_with(b"\r\n") || buf.starts_with(b"\n") || buf.starts_with(b"\r") {
        let n = if buf.starts_with(b"\r\n") { 2 } else { 1 };
        buf.advance(n);
    }
}

/// Scans raw header bytes for Content-Length (or its compact form `l`),
/// requiring repeated occurrences to agree.
fn parse_content_length(headers: &[u8]) -> Result<Option<usize>, FramingError> {
    let mut found: Option<usize> = None;
    for line in headers.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = memchr::memchr(b':', line) else {
            continue;
        };
        let name = trim_ascii(&line[..colon]);
        if !eq_ignore_case(name, b"content-length") && !eq_ignore_case(name, b"l") {
            continue;
        }
        let value = trim_ascii(&line[colon + 1..]);
        let parsed = parse_usize(value)?;
        match found {
            Some(existing) if existing != parsed => return Err(FramingError::BadContentLength),
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

fn trim_ascii(input: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = input.len();
    while start < end && input[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && input[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &input[start..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

fn parse_usize(value: &[u8]) -> Result<usize, FramingError> {
    if value.is_empty() {
        return Err(FramingError::BadContentLength);
    }
    let mut acc: usize = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(FramingError::BadContentLength);
        }
        acc = acc
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(FramingError::BadContentLength)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_multiple_messages() {
        let msg1 = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        let msg2 = b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let mut buf = BytesMut::from([msg1.as_slice(), msg2.as_slice()].concat().as_slice());
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(frames[0].as_ref(), msg1);
        assert_eq!(frames[1].as_ref(), msg2);
    }

    #[test]
    fn leaves_partial_body_buffered() {
        let payload = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 5\r\n\r\nhi";
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buf.len(), payload.len());
    }

    #[test]
    fn consumes_keepalive_pings() {
        let mut buf = BytesMut::from(&b"\r\n\r\nOPTIONS sip:a SIP/2.0\r\nContent-Length: 0\r\n\r\n"[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn missing_content_length_means_empty_body() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nVia: SIP/2.0/TCP h\r\n\r\n";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), msg.as_slice());
    }

    #[test]
    fn compact_form_counts() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nl: 4\r\n\r\nbody";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn mismatched_content_lengths_fail() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\nbody";
        let mut buf = BytesMut::from(&msg[..]);
        assert_eq!(drain_frames(&mut buf), Err(FramingError::BadContentLength));
    }

    #[test]
    fn oversized_headers_fail() {
        let mut text = String::from("OPTIONS sip:a SIP/2.0\r\nX-Big: ");
        text.push_str(&"A".repeat(70 * 1024));
        let mut buf = BytesMut::from(text.as_bytes());
        assert!(matches!(
            drain_frames(&mut buf),
            Err(FramingError::HeadersTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_declared_body_fails() {
        let msg = format!(
            "OPTIONS sip:a SIP/2.0\r\nContent-Length: {}\r\n\r\n",
            11 * 1024 * 1024
        );
        let mut buf = BytesMut::from(msg.as_bytes());
        assert!(matches!(
            drain_frames(&mut buf),
            Err(FramingError::BodyTooLarge { .. })
        ));
    }
}
