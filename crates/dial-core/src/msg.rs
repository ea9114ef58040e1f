// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri, version::SipVersion};

const MAX_REASON_LENGTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    InvalidReason(String),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
        }
    }
}

impl std::error::Error for MessageError {}

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: SipUri,
    version: SipVersion,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI,
    /// defaulting to SIP/2.0.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: SipVersion::V2,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    pub fn version(&self) -> SipVersion {
        self.version
    }

    pub fn set_uri(&mut self, uri: SipUri) {
        self.uri = uri;
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason`.
///
/// The constructor rejects out-of-range codes and control characters in the
/// reason phrase, which blocks CRLF injection through user-supplied text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: SipVersion,
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    ///
    /// # Errors
    /// Returns an error if the code is outside 100-699 or the reason phrase
    /// contains control characters or exceeds the length limit.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }
        let reason = reason.as_ref();
        if reason.len() > MAX_REASON_LENGTH {
            return Err(MessageError::InvalidReason("reason phrase too long".into()));
        }
        if reason.chars().any(|c| c.is_ascii_control()) {
            return Err(MessageError::InvalidReason(
                "contains control characters".into(),
            ));
        }
        Ok(Self {
            version: SipVersion::V2,
            code,
            reason: SmolStr::new(reason),
        })
    }

    pub fn version(&self) -> SipVersion {
        self.version
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    pub fn method(&self) -> &Method {
        self.start.method()
    }

    pub fn uri(&self) -> &SipUri {
        self.start.uri()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn set_uri(&mut self, uri: SipUri) {
        self.start.set_uri(uri);
    }

    pub fn into_parts(self) -> (RequestLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }

    /// CSeq sequence number, when the header is present and well-formed.
    pub fn cseq_number(&self) -> Option<u32> {
        cseq_number(&self.headers)
    }
}

/// In-memory representation of a SIP response.
///
/// Carries an optional back-pointer to the request that elicited it; the
/// pointer is attached by the client engine after receipt and is excluded
/// from equality, which compares wire content only.
#[derive(Debug, Clone, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
    request: Option<Box<Request>>,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
            request: None,
        }
    }

    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    pub fn code(&self) -> u16 {
        self.start.code()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// The originating request, when known.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_deref()
    }

    /// Attaches the originating request.
    pub fn set_request(&mut self, request: Request) {
        self.request = Some(Box::new(request));
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.start.code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.start.code())
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.start.code())
    }

    pub fn is_server_error(&self) -> bool {
        (500..700).contains(&self.start.code())
    }

    pub fn is_final(&self) -> bool {
        self.start.code() >= 200
    }

    /// CSeq sequence number, when the header is present and well-formed.
    pub fn cseq_number(&self) -> Option<u32> {
        cseq_number(&self.headers)
    }

    /// CSeq method token, when the header is present.
    pub fn cseq_method(&self) -> Option<Method> {
        let cseq = self.headers.get("CSeq")?;
        let token = cseq.split_whitespace().nth(1)?;
        Some(Method::from_token(token))
    }
}

impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.headers == other.headers && self.body == other.body
    }
}

/// Either a SIP request or a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => req.headers(),
            Self::Response(res) => res.headers(),
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => req.body(),
            Self::Response(res) => res.body(),
        }
    }
}

fn cseq_number(headers: &Headers) -> Option<u32> {
    headers
        .get("CSeq")?
        .split_whitespace()
        .next()?
        .parse::<u32>()
        .ok()
}
