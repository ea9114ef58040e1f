// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Auth controller: turns a 401/407 final into exactly one resubmission.

use dial_auth::{Challenge, DigestClient};
use dial_core::{generate_branch, Request, Response};
use smol_str::SmolStr;

use crate::error::ClientError;

/// Builds the authenticated resubmission for a challenged request: a clone
/// of the original with its CSeq incremented, a fresh top-Via branch, and
/// the computed (Proxy-)Authorization attached. The caller submits it as a
/// brand new transaction and must not retry again for the same challenge.
pub(crate) fn build_auth_retry(
    original: &Request,
    challenge_response: &Response,
    digest: &DigestClient,
) -> Result<Request, ClientError> {
    let proxy = challenge_response.code() == 407;
    let challenge =
        Challenge::from_headers(challenge_response.headers(), proxy).map_err(|e| {
            ClientError::AuthFailed {
                reason: e.to_string(),
            }
        })?;

    let uri = original.uri().to_string();
    let value = digest
        .authorization(&challenge, original.method().as_str(), &uri, original.body())
        .map_err(|e| ClientError::AuthFailed {
            reason: e.to_string(),
        })?;

    let mut retry = original.clone();

    let cseq = original
        .cseq_number()
        .ok_or(ClientError::BadArgument { field: "CSeq" })?;
    retry.headers_mut().set(
        "CSeq",
        format!("{} {}", cseq + 1, original.method().as_str()),
    );

    if let Some(via) = original.headers().get("Via") {
        let refreshed = refresh_branch(via);
        retry.headers_mut().set("Via", refreshed);
    }

    let header_name = if proxy {
        "Proxy-Authorization"
    } else {
        "Authorization"
    };
    retry.headers_mut().set(header_name, value);

    Ok(retry)
}

/// Rewrites the `branch` parameter of a Via value with a fresh token,
/// appending one when the Via carried no branch at all.
pub(crate) fn refresh_branch(via: &str) -> SmolStr {
    let fresh = generate_branch();
    let mut rebuilt = String::with_capacity(via.len() + 8);
    let mut replaced = false;
    for (idx, segment) in via.split(';').enumerate() {
        if idx > 0 {
            rebuilt.push(';');
        }
        let trimmed = segment.trim().as_bytes();
        if idx > 0 && trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case(b"branch=") {
            rebuilt.push_str("branch=");
            rebuilt.push_str(&fresh);
            replaced = true;
        } else {
            rebuilt.push_str(segment);
        }
    }
    if !replaced {
        rebuilt.push_str(";branch=");
        rebuilt.push_str(&fresh);
    }
    SmolStr::new(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dial_auth::Credentials;
    use dial_core::{Headers, Method, RequestLine, SipUri, StatusLine};
    use dial_transaction::branch_from_via;

    fn register() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP c.example.com:5061;branch=z9hG4bKoriginal;rport");
        headers.push("From", "<sip:1111@example.com>;tag=f1");
        headers.push("To", "<sip:1111@example.com>");
        headers.push("Call-ID", "auth@c.example.com");
        headers.push("CSeq", "1 REGISTER");
        Request::new(
            RequestLine::new(Method::Register, SipUri::parse("sip:example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn challenge_401() -> Response {
        let mut headers = Headers::new();
        headers.push(
            "WWW-Authenticate",
            "Digest realm=\"asterisk\", nonce=\"NONCE1\", algorithm=MD5, qop=\"auth\"",
        );
        Response::new(
            StatusLine::new(401, "Unauthorized").unwrap(),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn retry_increments_cseq_and_refreshes_branch() {
        let digest = DigestClient::new(Credentials::new("1111", "1111xxx"));
        let retry = build_auth_retry(&register(), &challenge_401(), &digest).unwrap();

        assert_eq!(retry.headers().get("CSeq").unwrap().as_str(), "2 REGISTER");
        let branch = branch_from_via(retry.headers().get("Via").unwrap()).unwrap();
        assert_ne!(branch, "z9hG4bKoriginal");
        assert!(branch.starts_with("z9hG4bK"));
        assert!(retry
            .headers()
            .get("Via")
            .unwrap()
            .ends_with(";rport"), "other Via params survive");

        let auth = retry.headers().get("Authorization").unwrap();
        assert!(auth.contains("username=\"1111\""));
        assert!(auth.contains("realm=\"asterisk\""));
        assert!(auth.contains("nonce=\"NONCE1\""));
        assert!(auth.contains("uri=\"sip:example.com\""));
        assert!(auth.contains("nc=00000001"));
    }

    #[test]
    fn proxy_challenge_uses_proxy_authorization() {
        let mut headers = Headers::new();
        headers.push(
            "Proxy-Authenticate",
            "Digest realm=\"proxy\", nonce=\"PN\", algorithm=MD5, qop=\"auth\"",
        );
        let challenge = Response::new(
            StatusLine::new(407, "Proxy Authentication Required").unwrap(),
            headers,
            Bytes::new(),
        );
        let digest = DigestClient::new(Credentials::new("u", "p"));
        let retry = build_auth_retry(&register(), &challenge, &digest).unwrap();
        assert!(retry.headers().contains("Proxy-Authorization"));
        assert!(!retry.headers().contains("Authorization"));
    }

    #[test]
    fn missing_challenge_is_auth_failed() {
        let bare = Response::new(
            StatusLine::new(401, "Unauthorized").unwrap(),
            Headers::new(),
            Bytes::new(),
        );
        let digest = DigestClient::new(Credentials::new("u", "p"));
        assert!(matches!(
            build_auth_retry(&register(), &bare, &digest),
            Err(ClientError::AuthFailed { .. })
        ));
    }

    #[test]
    fn refresh_branch_appends_when_absent() {
        let rebuilt = refresh_branch("SIP/2.0/UDP host:5060");
        assert!(branch_from_via(&rebuilt).unwrap().starts_with("z9hG4bK"));
    }
}
