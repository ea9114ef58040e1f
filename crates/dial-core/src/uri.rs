// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

/// URI scheme accepted by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

/// Errors produced while parsing a SIP URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    UnsupportedScheme(String),
    EmptyHost,
    InvalidPort(String),
    UnterminatedBracket,
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriError::UnsupportedScheme(s) => write!(f, "unsupported URI scheme: {}", s),
            UriError::EmptyHost => write!(f, "URI host is empty"),
            UriError::InvalidPort(p) => write!(f, "invalid URI port: {}", p),
            UriError::UnterminatedBracket => write!(f, "unterminated '[' in URI host"),
        }
    }
}

impl std::error::Error for UriError {}

/// A parsed `sip:`/`sips:` URI.
///
/// Parameters keep their arrival order; parameter names compare
/// case-insensitively. Equality follows RFC 3261 §19.1.4: scheme, host and
/// parameter names are case-insensitive, userinfo is case-sensitive, an
/// explicit port only matches the same explicit port, and a parameter
/// present in both URIs must agree (one-sided parameters other than the
/// special `transport`/`user`/`ttl`/`method`/`maddr` set are ignored).
#[derive(Debug, Clone, Eq)]
pub struct SipUri {
    scheme: Scheme,
    user: Option<SmolStr>,
    host: SmolStr,
    port: Option<u16>,
    params: Vec<(SmolStr, Option<SmolStr>)>,
    headers: Vec<(SmolStr, SmolStr)>,
}

impl SipUri {
    /// Builds a minimal URI from host (and optional user/port).
    pub fn from_parts(scheme: Scheme, user: Option<&str>, host: &str, port: Option<u16>) -> Self {
        Self {
            scheme,
            user: user.map(SmolStr::new),
            host: SmolStr::new(host),
            port,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Parses a URI of the form
    /// `sip[s]:[user@]host[:port][;name[=value]…][?hdr=val[&…]]`.
    ///
    /// Bracketed IPv6 hosts are accepted. Unknown parameters are preserved
    /// in arrival order.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(input, "sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(input, "sip:") {
            (Scheme::Sip, rest)
        } else {
            let scheme = input.split(':').next().unwrap_or(input);
            return Err(UriError::UnsupportedScheme(scheme.to_owned()));
        };

        // Split off the headers part first, then URI parameters.
        let (rest, headers_part) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h)),
            None => (rest, None),
        };
        let mut segments = rest.split(';');
        let authority = segments.next().unwrap_or_default();

        let (user, hostport) = match authority.rsplit_once('@') {
            Some((user, hp)) => (Some(SmolStr::new(user)), hp),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(UriError::EmptyHost);
        }

        let mut params = Vec::new();
        for segment in segments {
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => {
                    params.push((SmolStr::new(name), Some(SmolStr::new(value))))
                }
                None => params.push((SmolStr::new(segment), None)),
            }
        }

        let mut headers = Vec::new();
        if let Some(part) = headers_part {
            for pair in part.split('&') {
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((name, value)) => {
                        headers.push((SmolStr::new(name), SmolStr::new(value)))
                    }
                    None => headers.push((SmolStr::new(pair), SmolStr::new(""))),
                }
            }
        }

        Ok(Self {
            scheme,
            user,
            host: SmolStr::new(host),
            port,
            params,
            headers,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Returns true for `sips:` URIs.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port to dial: the explicit port, else 5060 (5061 for sips).
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.scheme {
            Scheme::Sip => 5060,
            Scheme::Sips => 5061,
        })
    }

    /// Returns a URI parameter value; `Some(None)` for valueless params.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Parameters in arrival order.
    pub fn params(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    /// URI headers-part entries in arrival order.
    pub fn uri_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Appends a URI parameter.
    pub fn push_param(&mut self, name: &str, value: Option<&str>) {
        self.params.push((SmolStr::new(name), value.map(SmolStr::new)));
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        for (idx, (name, value)) in self.headers.iter().enumerate() {
            let sep = if idx == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

impl PartialEq for SipUri {
    fn eq(&self, other: &Self) -> bool {
        if self.scheme != other.scheme
            || self.user != other.user
            || !self.host.eq_ignore_ascii_case(&other.host)
            || self.port != other.port
        {
            return false;
        }
        // Parameters appearing in both URIs must agree; the special set must
        // agree even when present on only one side.
        for (name, value) in &self.params {
            if let Some(theirs) = other.param(name) {
                if !param_value_eq(value.as_deref(), theirs) {
                    return false;
                }
            } else if is_significant_param(name) {
                return false;
            }
        }
        for (name, _) in &other.params {
            if self.param(name).is_none() && is_significant_param(name) {
                return false;
            }
        }
        // Headers-part must match exactly as a set.
        if self.headers.len() != other.headers.len() {
            return false;
        }
        self.headers.iter().all(|(n, v)| {
            other
                .headers
                .iter()
                .any(|(on, ov)| on.eq_ignore_ascii_case(n) && ov == v)
        })
    }
}

fn is_significant_param(name: &str) -> bool {
    ["transport", "user", "ttl", "method", "maddr"]
        .iter()
        .any(|p| name.eq_ignore_ascii_case(p))
}

fn param_value_eq(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn split_host_port(hostport: &str) -> Result<(&str, Option<u16>), UriError> {
    if let Some(rest) = hostport.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let end = rest.find(']').ok_or(UriError::UnterminatedBracket)?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host, port));
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((hostport, None)),
    }
}

fn parse_port(p: &str) -> Result<u16, UriError> {
    p.parse::<u16>().map_err(|_| UriError::InvalidPort(p.to_owned()))
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    if input.len() < prefix.len() {
        return None;
    }
    if input.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes()) {
        input.get(prefix.len()..)
    } else {
        None
    }
}
