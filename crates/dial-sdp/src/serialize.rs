// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt::Write;

use crate::{Attribute, SessionDescription};

/// Serializes a session description with CRLF line endings in RFC 4566
/// order: v, o, s, c, t, session attributes, then each media section with
/// its own connection and attributes.
pub fn serialize_sdp(sdp: &SessionDescription) -> String {
    let mut out = String::new();
    let _ = write!(out, "v={}\r\n", sdp.version);
    let o = &sdp.origin;
    let _ = write!(
        out,
        "o={} {} {} {} {} {}\r\n",
        o.username, o.session_id, o.session_version, o.net_type, o.addr_type, o.unicast_address
    );
    let _ = write!(out, "s={}\r\n", sdp.session_name);
    if let Some(c) = &sdp.connection {
        let _ = write!(out, "c={} {} {}\r\n", c.net_type, c.addr_type, c.address);
    }
    for t in &sdp.times {
        let _ = write!(out, "t={} {}\r\n", t.start, t.stop);
    }
    for attr in &sdp.attributes {
        write_attribute(&mut out, attr);
    }
    for media in &sdp.media {
        let _ = write!(out, "m={} {} {}", media.media, media.port, media.protocol);
        for format in &media.formats {
            let _ = write!(out, " {}", format);
        }
        out.push_str("\r\n");
        if let Some(c) = &media.connection {
            let _ = write!(out, "c={} {} {}\r\n", c.net_type, c.addr_type, c.address);
        }
        for attr in &media.attributes {
            write_attribute(&mut out, attr);
        }
    }
    out
}

fn write_attribute(out: &mut String, attr: &Attribute) {
    match attr {
        Attribute::Flag(name) => {
            let _ = write!(out, "a={}\r\n", name);
        }
        Attribute::Value { name, value } => {
            let _ = write!(out, "a={}:{}\r\n", name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::parse::parse_sdp;

    #[test]
    fn round_trips_parsed_session() {
        let text = "v=0\r\n\
o=alice 1 2 IN IP4 192.0.2.1\r\n\
s=call\r\n\
c=IN IP4 192.0.2.1\r\n\
t=0 0\r\n\
a=sendrecv\r\n\
m=audio 8000 RTP/AVP 0 8\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n";
        let sdp = parse_sdp(text).expect("parse");
        assert_eq!(sdp.to_string(), text);
        let reparsed = parse_sdp(&sdp.to_string()).expect("reparse");
        assert_eq!(reparsed, sdp);
    }
}
