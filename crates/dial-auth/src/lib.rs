// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Digest access authentication per RFC 7616 (with RFC 2617 MD5 compat).
//!
//! Parses `WWW-Authenticate`/`Proxy-Authenticate` challenges and computes
//! the matching `Authorization`/`Proxy-Authorization` value for a method,
//! URI and optional body. Nonce counts are tracked per (realm, nonce);
//! cnonces are 16 fresh hex characters per attempt.
//!
//! # Example
//! ```
//! use dial_auth::{Challenge, Credentials, DigestClient};
//!
//! let challenge = Challenge::parse(
//!     "Digest realm=\"asterisk\", nonce=\"abc\", algorithm=MD5, qop=\"auth\"",
//! ).unwrap();
//! let client = DigestClient::new(Credentials::new("1111", "1111xxx"));
//! let value = client.authorization(&challenge, "REGISTER", "sip:example.com", b"").unwrap();
//! assert!(value.starts_with("Digest username=\"1111\""));
//! ```

use dashmap::DashMap;
use dial_core::Headers;
use rand::Rng;
use sha2::{Digest as _, Sha256, Sha512};
use smol_str::SmolStr;
use std::fmt::Write;

/// Digest hash algorithm, including the RFC 7616 session variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512,
    Sha512Sess,
}

impl DigestAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Sha512Sess => "SHA-512-sess",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "MD5-SESS" => Some(DigestAlgorithm::Md5Sess),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Some(DigestAlgorithm::Sha256Sess),
            "SHA-512" => Some(DigestAlgorithm::Sha512),
            "SHA-512-SESS" => Some(DigestAlgorithm::Sha512Sess),
            _ => None,
        }
    }

    /// True for the `-sess` variants whose HA1 folds in nonce and cnonce.
    pub fn is_session(self) -> bool {
        matches!(
            self,
            DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess | DigestAlgorithm::Sha512Sess
        )
    }

    /// Hex digest of `data` under this algorithm's hash.
    pub fn hash(self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => format!("{:x}", md5::compute(data)),
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data))
            }
            DigestAlgorithm::Sha512 | DigestAlgorithm::Sha512Sess => {
                hex::encode(Sha512::digest(data))
            }
        }
    }
}

/// Quality of protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "auth" => Some(Qop::Auth),
            "auth-int" => Some(Qop::AuthInt),
            _ => None,
        }
    }
}

/// Errors surfaced by challenge parsing and authorization computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    NotDigest { scheme: String },
    MissingParam { name: &'static str },
    UnsupportedAlgorithm { token: String },
    NoChallenge,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::NotDigest { scheme } => write!(f, "unsupported auth scheme: {}", scheme),
            AuthError::MissingParam { name } => write!(f, "challenge missing {:?}", name),
            AuthError::UnsupportedAlgorithm { token } => {
                write!(f, "unsupported digest algorithm: {}", token)
            }
            AuthError::NoChallenge => write!(f, "no authentication challenge present"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Parsed Digest challenge from a 401/407.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: SmolStr,
    pub nonce: SmolStr,
    pub algorithm: DigestAlgorithm,
    pub qop: Vec<Qop>,
    pub opaque: Option<SmolStr>,
    pub stale: bool,
    pub domain: Option<SmolStr>,
}

impl Challenge {
    /// Parses one `Digest …` header value.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let trimmed = value.trim();
        let (scheme, params) = trimmed
            .split_once(char::is_whitespace)
            .ok_or(AuthError::NotDigest {
                scheme: trimmed.to_owned(),
            })?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(AuthError::NotDigest {
                scheme: scheme.to_owned(),
            });
        }

        let mut realm = None;
        let mut nonce = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut qop = Vec::new();
        let mut opaque = None;
        let mut stale = false;
        let mut domain = None;

        for (name, raw) in split_params(params) {
            let unquoted = unquote(&raw);
            if name.eq_ignore_ascii_case("realm") {
                realm = Some(SmolStr::new(unquoted));
            } else if name.eq_ignore_ascii_case("nonce") {
                nonce = Some(SmolStr::new(unquoted));
            } else if name.eq_ignore_ascii_case("algorithm") {
                algorithm = DigestAlgorithm::from_token(&unquoted).ok_or(
                    AuthError::UnsupportedAlgorithm {
                        token: unquoted.clone(),
                    },
                )?;
            } else if name.eq_ignore_ascii_case("qop") {
                qop = unquoted
                    .split(',')
                    .filter_map(Qop::from_token)
                    .collect();
            } else if name.eq_ignore_ascii_case("opaque") {
                opaque = Some(SmolStr::new(unquoted));
            } else if name.eq_ignore_ascii_case("stale") {
                stale = unquoted.eq_ignore_ascii_case("true");
            } else if name.eq_ignore_ascii_case("domain") {
                domain = Some(SmolStr::new(unquoted));
            }
        }

        Ok(Self {
            realm: realm.ok_or(AuthError::MissingParam { name: "realm" })?,
            nonce: nonce.ok_or(AuthError::MissingParam { name: "nonce" })?,
            algorithm,
            qop,
            opaque,
            stale,
            domain,
        })
    }

    /// Extracts the strongest parseable challenge from a 401/407's headers.
    ///
    /// `proxy` selects `Proxy-Authenticate` over `WWW-Authenticate`. When
    /// several challenges are offered, a SHA-256 family challenge is
    /// preferred over MD5 per spec default.
    pub fn from_headers(headers: &Headers, proxy: bool) -> Result<Self, AuthError> {
        let name = if proxy {
            "Proxy-Authenticate"
        } else {
            "WWW-Authenticate"
        };
        let mut best: Option<Challenge> = None;
        for value in headers.get_all(name) {
            if let Ok(challenge) = Challenge::parse(value) {
                let stronger = matches!(
                    challenge.algorithm,
                    DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess
                );
                match &best {
                    None => best = Some(challenge),
                    Some(current)
                        if stronger
                            && !matches!(
                                current.algorithm,
                                DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess
                            ) =>
                    {
                        best = Some(challenge)
                    }
                    _ => {}
                }
            }
        }
        best.ok_or(AuthError::NoChallenge)
    }

    /// Picks the qop for the reply: `auth` when offered, else `auth-int`,
    /// else none (RFC 2617 compatibility mode).
    pub fn preferred_qop(&self) -> Option<Qop> {
        if self.qop.contains(&Qop::Auth) {
            Some(Qop::Auth)
        } else {
            self.qop.first().copied()
        }
    }
}

/// Account material used to answer challenges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: SmolStr,
    pub password: SmolStr,
    /// Preferred realm; challenges from other realms are still answered.
    pub realm: Option<SmolStr>,
    pub display_name: Option<SmolStr>,
    pub user_agent: Option<SmolStr>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: SmolStr::new(username),
            password: SmolStr::new(password),
            realm: None,
            display_name: None,
            user_agent: None,
        }
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = Some(SmolStr::new(realm));
        self
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(SmolStr::new(name));
        self
    }

    pub fn with_user_agent(mut self, ua: &str) -> Self {
        self.user_agent = Some(SmolStr::new(ua));
        self
    }
}

/// Client-side digest calculator with per-(realm, nonce) nonce counts.
pub struct DigestClient {
    credentials: Credentials,
    nonce_counts: DashMap<(SmolStr, SmolStr), u32>,
}

impl DigestClient {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            nonce_counts: DashMap::new(),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Builds the `Authorization`/`Proxy-Authorization` header value for
    /// one request attempt. Each call consumes the next nonce count for the
    /// challenge's (realm, nonce) and a fresh cnonce.
    pub fn authorization(
        &self,
        challenge: &Challenge,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Result<String, AuthError> {
        let qop = challenge.preferred_qop();
        let nc = self.next_nonce_count(&challenge.realm, &challenge.nonce);
        let nc_str = format!("{:08x}", nc);
        let cnonce = generate_cnonce();

        let response = compute_response(
            challenge.algorithm,
            &self.credentials.username,
            &self.credentials.password,
            &challenge.realm,
            &challenge.nonce,
            &nc_str,
            &cnonce,
            qop,
            method,
            uri,
            body,
        );

        // Parameter order per the wire contract: username, realm, nonce,
        // uri, algorithm, response, opaque?, qop, nc, cnonce.
        let mut value = String::new();
        let _ = write!(
            value,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            self.credentials.username,
            challenge.realm,
            challenge.nonce,
            uri,
            challenge.algorithm.as_str(),
            response,
        );
        if let Some(opaque) = &challenge.opaque {
            let _ = write!(value, ", opaque=\"{}\"", opaque);
        }
        if let Some(qop) = qop {
            let _ = write!(value, ", qop={}, nc={}, cnonce=\"{}\"", qop.as_str(), nc_str, cnonce);
        }
        Ok(value)
    }

    fn next_nonce_count(&self, realm: &SmolStr, nonce: &SmolStr) -> u32 {
        let mut entry = self
            .nonce_counts
            .entry((realm.clone(), nonce.clone()))
            .or_insert(0);
        *entry += 1;
        *entry
    }
}

/// Pure digest computation: deterministic in every input, which keeps the
/// calculation testable without the nc/cnonce bookkeeping.
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    algorithm: DigestAlgorithm,
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: Option<Qop>,
    method: &str,
    uri: &str,
    body: &[u8],
) -> String {
    let mut ha1 = algorithm.hash(format!("{}:{}:{}", username, realm, password).as_bytes());
    if algorithm.is_session() {
        ha1 = algorithm.hash(format!("{}:{}:{}", ha1, nonce, cnonce).as_bytes());
    }

    let ha2 = match qop {
        Some(Qop::AuthInt) => {
            let body_hash = algorithm.hash(body);
            algorithm.hash(format!("{}:{}:{}", method, uri, body_hash).as_bytes())
        }
        _ => algorithm.hash(format!("{}:{}", method, uri).as_bytes()),
    };

    match qop {
        Some(qop) => algorithm.hash(
            format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop.as_str(), ha2).as_bytes(),
        ),
        None => algorithm.hash(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()),
    }
}

fn generate_cnonce() -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..16).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

/// Splits `name=value, name="a, quoted"` parameter lists, honoring quotes
/// and backslash escapes.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0usize;
    let bytes = input.as_bytes();

    for (idx, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                push_param(&mut params, &input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    push_param(&mut params, &input[start..]);
    params
}

fn push_param(params: &mut Vec<(String, String)>, piece: &str) {
    let piece = piece.trim();
    if piece.is_empty() {
        return;
    }
    if let Some((name, value)) = piece.split_once('=') {
        params.push((name.trim().to_owned(), value.trim().to_owned()));
    }
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        let inner = &trimmed[1..trimmed.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut escaped = false;
        for ch in inner.chars() {
            if escaped {
                out.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else {
                out.push(ch);
            }
        }
        out
    } else {
        trimmed.to_owned()
    }
}
