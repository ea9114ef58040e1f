// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Line-oriented SDP parser.

use smol_str::SmolStr;

use crate::{
    Attribute, Connection, MediaDescription, Origin, RtpMap, SessionDescription, TimeDescription,
};

/// Reasons an SDP body fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    /// A line does not have the `<type>=<value>` shape or its value is
    /// malformed for the type.
    MalformedSdpLine { line: String },
    /// A type character outside the RFC 4566 set.
    UnknownType { type_char: char },
}

impl std::fmt::Display for SdpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpError::MalformedSdpLine { line } => write!(f, "malformed SDP line: {:?}", line),
            SdpError::UnknownType { type_char } => {
                write!(f, "unknown SDP line type: {:?}", type_char)
            }
        }
    }
}

impl std::error::Error for SdpError {}

/// Parses an SDP body. Lines may be terminated by CRLF or bare LF.
pub fn parse_sdp(text: &str) -> Result<SessionDescription, SdpError> {
    let mut version = 0u8;
    let mut origin: Option<Origin> = None;
    let mut session_name = SmolStr::new("-");
    let mut connection: Option<Connection> = None;
    let mut times: Vec<TimeDescription> = Vec::new();
    let mut attributes: Vec<Attribute> = Vec::new();
    let mut media: Vec<MediaDescription> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (type_char, value) = split_line(line)?;
        match type_char {
            'v' => {
                version = value
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| malformed(line))?;
            }
            'o' => origin = Some(parse_origin(value).ok_or_else(|| malformed(line))?),
            's' => session_name = SmolStr::new(value),
            'c' => {
                let conn = parse_connection(value).ok_or_else(|| malformed(line))?;
                match media.last_mut() {
                    Some(m) => m.connection = Some(conn),
                    None => connection = Some(conn),
                }
            }
            't' => times.push(parse_time(value).ok_or_else(|| malformed(line))?),
            'a' => {
                let attr = parse_attribute(value);
                match media.last_mut() {
                    Some(m) => {
                        if let Attribute::Value { name, value } = &attr {
                            if name.eq_ignore_ascii_case("rtpmap") {
                                if let Some(map) = parse_rtpmap(value) {
                                    m.rtpmaps.push(map);
                                }
                            }
                        }
                        m.attributes.push(attr);
                    }
                    None => attributes.push(attr),
                }
            }
            'm' => media.push(parse_media(value).ok_or_else(|| malformed(line))?),
            // Informational lines we accept but do not model.
            'i' | 'u' | 'e' | 'p' | 'b' | 'z' | 'k' | 'r' => {}
            other => return Err(SdpError::UnknownType { type_char: other }),
        }
    }

    Ok(SessionDescription {
        version,
        origin: origin.unwrap_or_else(|| Origin::new("-", "0.0.0.0")),
        session_name,
        connection,
        times,
        attributes,
        media,
    })
}

fn split_line(line: &str) -> Result<(char, &str), SdpError> {
    let mut chars = line.chars();
    let type_char = chars.next().ok_or_else(|| malformed(line))?;
    if chars.next() != Some('=') {
        return Err(malformed(line));
    }
    Ok((type_char, &line[2..]))
}

fn malformed(line: &str) -> SdpError {
    SdpError::MalformedSdpLine {
        line: line.to_owned(),
    }
}

fn parse_origin(value: &str) -> Option<Origin> {
    let mut parts = value.split_whitespace();
    let username = parts.next()?;
    let session_id = parts.next()?;
    let session_version = parts.next()?;
    let net_type = parts.next()?;
    let addr_type = parts.next()?;
    let unicast_address = parts.next()?;
    Some(Origin {
        username: SmolStr::new(username),
        session_id: SmolStr::new(session_id),
        session_version: SmolStr::new(session_version),
        net_type: SmolStr::new(net_type),
        addr_type: SmolStr::new(addr_type),
        unicast_address: SmolStr::new(unicast_address),
    })
}

fn parse_connection(value: &str) -> Option<Connection> {
    let mut parts = value.split_whitespace();
    Some(Connection {
        net_type: SmolStr::new(parts.next()?),
        addr_type: SmolStr::new(parts.next()?),
        address: SmolStr::new(parts.next()?),
    })
}

fn parse_time(value: &str) -> Option<TimeDescription> {
    let mut parts = value.split_whitespace();
    let start = parts.next()?.parse::<u64>().ok()?;
    let stop = parts.next()?.parse::<u64>().ok()?;
    Some(TimeDescription { start, stop })
}

fn parse_attribute(value: &str) -> Attribute {
    match value.split_once(':') {
        Some((name, v)) => Attribute::Value {
            name: SmolStr::new(name),
            value: SmolStr::new(v),
        },
        None => Attribute::Flag(SmolStr::new(value)),
    }
}

fn parse_media(value: &str) -> Option<MediaDescription> {
    let mut parts = value.split_whitespace();
    let media = parts.next()?;
    let port_token = parts.next()?;
    // Accept the `<port>/<count>` form; the port is the part we use.
    let port = port_token
        .split('/')
        .next()?
        .parse::<u16>()
        .ok()?;
    let protocol = parts.next()?;
    let formats = parts.map(SmolStr::new).collect();
    Some(MediaDescription {
        media: SmolStr::new(media),
        port,
        protocol: SmolStr::new(protocol),
        formats,
        connection: None,
        attributes: Vec::new(),
        rtpmaps: Vec::new(),
    })
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (pt, rest) = value.trim().split_once(' ')?;
    let payload_type = pt.trim().parse::<u8>().ok()?;
    let mut pieces = rest.trim().split('/');
    let encoding_name = pieces.next()?;
    let clock_rate = pieces.next()?.parse::<u32>().ok()?;
    let encoding_params = pieces.next().map(SmolStr::new);
    Some(RtpMap {
        payload_type,
        encoding_name: SmolStr::new(encoding_name),
        clock_rate,
        encoding_params,
    })
}
