// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP message model shared by every layer of the sipdial stack.
//!
//! Provides the request/response types, the ordered case-insensitive header
//! store, `sip:`/`sips:` URI parsing with RFC 3261 §19.1.4 equality, and the
//! random identifier generators (branch, tag, Call-ID).
//!
//! # Example
//! ```
//! use dial_core::{Headers, Method, Request, RequestLine, SipUri};
//! use bytes::Bytes;
//!
//! let uri = SipUri::parse("sip:bob@example.com").unwrap();
//! let mut headers = Headers::new();
//! headers.push("Max-Forwards", "70");
//! let request = Request::new(RequestLine::new(Method::Invite, uri), headers, Bytes::new());
//! assert_eq!(request.method().as_str(), "INVITE");
//! ```

pub mod headers;
pub mod ident;
pub mod method;
pub mod msg;
pub mod uri;
pub mod version;

pub use headers::{canonical_name, serialization_rank, Header, Headers};
pub use ident::{generate_branch, generate_call_id, generate_tag, is_valid_branch, BRANCH_COOKIE};
pub use method::Method;
pub use msg::{MessageError, Request, RequestLine, Response, SipMessage, StatusLine};
pub use uri::{Scheme, SipUri, UriError};
pub use version::SipVersion;

use smol_str::SmolStr;

/// Extracts the `tag` parameter from a From/To header value.
pub fn extract_tag(value: &str) -> Option<SmolStr> {
    value.split(';').skip(1).find_map(|segment| {
        let trimmed = segment.trim();
        let (name, tag) = trimmed.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("tag") {
            Some(SmolStr::new(tag.trim()))
        } else {
            None
        }
    })
}

/// Extracts the URI between angle brackets of a name-addr header value, or
/// the leading URI token of an addr-spec form.
pub fn uri_from_name_addr(value: &str) -> Option<SipUri> {
    let trimmed = value.trim();
    let uri_part = if let Some(start) = trimmed.find('<') {
        let rest = &trimmed[start + 1..];
        let end = rest.find('>')?;
        &rest[..end]
    } else {
        trimmed.split(';').next()?
    };
    SipUri::parse(uri_part.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tag_from_name_addr() {
        assert_eq!(
            extract_tag("<sip:alice@example.com>;tag=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            extract_tag("sip:alice@example.com;other=x;tag=zz").as_deref(),
            Some("zz")
        );
        assert_eq!(extract_tag("<sip:alice@example.com>"), None);
    }

    #[test]
    fn tag_param_inside_brackets_is_not_a_header_tag() {
        // The first segment is the addr-spec itself, never a tag source.
        assert_eq!(extract_tag("sip:alice@example.com"), None);
    }

    #[test]
    fn uri_from_angle_brackets() {
        let uri = uri_from_name_addr("\"Bob\" <sip:bob@example.com:5070>;expires=60").unwrap();
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), Some(5070));
    }

    #[test]
    fn uri_from_bare_addr_spec() {
        let uri = uri_from_name_addr("sip:carol@example.org;transport=tcp").unwrap();
        assert_eq!(uri.host(), "example.org");
        // Parameters after the addr-spec belong to the header, not the URI.
        assert_eq!(uri.param("transport"), None);
    }
}
