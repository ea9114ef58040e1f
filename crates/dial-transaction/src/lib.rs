// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 client transaction layer.
//!
//! Transactions are pure event→action state machines ([`fsm`]) driven by a
//! [`TransactionManager`] that owns the table, schedules the timers and
//! performs transmissions through a [`TransportDispatcher`]. Only the
//! client side is implemented; this stack never acts as a UAS.

use bytes::Bytes;
use dial_core::{extract_tag, Headers, Method, Request, RequestLine, Response};
use smol_str::SmolStr;

pub mod fsm;
pub mod manager;
pub mod timers;

pub use fsm::{
    ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm, FsmAction,
    TerminationReason,
};
pub use manager::{TransactionManager, TransactionUser, TransportDispatcher};
pub use timers::{TimerDefaults, TransactionTimers};

/// Timers referenced by the client transaction machines (RFC 3261 §17.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    /// INVITE retransmission interval.
    A,
    /// INVITE transaction timeout.
    B,
    /// Wait for response retransmissions after a non-2xx final to INVITE.
    D,
    /// Non-INVITE retransmission interval.
    E,
    /// Non-INVITE transaction timeout.
    F,
    /// Wait for response retransmissions after a non-INVITE final.
    K,
}

impl TransactionTimer {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionTimer::A => "A",
            TransactionTimer::B => "B",
            TransactionTimer::D => "D",
            TransactionTimer::E => "E",
            TransactionTimer::F => "F",
            TransactionTimer::K => "K",
        }
    }
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Matching key for client transactions: top-Via branch + sent-by + method.
///
/// ACK matches the INVITE it acknowledges; CANCEL is its own non-INVITE
/// transaction even though it reuses the INVITE's branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub sent_by: SmolStr,
    pub method: Method,
}

impl TransactionKey {
    /// Derives the key for an outbound request.
    pub fn for_request(request: &Request) -> Option<Self> {
        let via = top_via(request.headers())?;
        let branch = branch_from_via(via)?;
        let sent_by = sent_by_from_via(via)?;
        let method = match request.method() {
            Method::Ack => Method::Invite,
            other => other.clone(),
        };
        Some(Self {
            branch: SmolStr::new(branch),
            sent_by: SmolStr::new(sent_by),
            method,
        })
    }

    /// Derives the key a response matches against: top-Via branch and
    /// sent-by plus the CSeq method.
    pub fn for_response(response: &Response) -> Option<Self> {
        let via = top_via(response.headers())?;
        let branch = branch_from_via(via)?;
        let sent_by = sent_by_from_via(via)?;
        let method = match response.cseq_method()? {
            Method::Ack => Method::Invite,
            other => other,
        };
        Some(Self {
            branch: SmolStr::new(branch),
            sent_by: SmolStr::new(sent_by),
            method,
        })
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.branch, self.sent_by, self.method.as_str())
    }
}

/// Returns the top-most Via value, if present.
pub fn top_via(headers: &Headers) -> Option<&SmolStr> {
    headers.get_all("Via").next()
}

/// Extracts the `branch` parameter from a Via value.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("branch") {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Extracts the sent-by (host[:port] after the transport token) from a Via
/// value.
pub fn sent_by_from_via(via: &str) -> Option<&str> {
    let head = via.split(';').next()?;
    let sent_by = head.split_whitespace().nth(1)?;
    Some(sent_by.trim())
}

/// Builds the ACK a client INVITE transaction sends for a non-2xx final
/// (RFC 3261 §17.1.1.3). The ACK reuses the INVITE's Request-URI, top Via
/// (same branch) and CSeq number, and takes its To (with tag) from the
/// final response.
///
/// The ACK for a 2xx is deliberately NOT built here; that one belongs to
/// the dialog layer with a fresh branch.
pub fn build_non2xx_ack(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = top_via(invite.headers()) {
        headers.push("Via", via.clone());
    }
    headers.push("Max-Forwards", "70");
    if let Some(from) = invite.headers().get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = response.headers().get("To") {
        headers.push("To", to.clone());
    } else if let Some(to) = invite.headers().get("To") {
        headers.push("To", to.clone());
    }
    if let Some(call_id) = invite.headers().get("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    if let Some(cseq) = invite.cseq_number() {
        headers.push("CSeq", format!("{} ACK", cseq));
    }
    for route in invite.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }

    Request::new(
        RequestLine::new(Method::Ack, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
}

/// Builds the CANCEL for a pending INVITE (RFC 3261 §9.1): same
/// Request-URI, top Via (same branch), From, To, Call-ID and CSeq number,
/// with the method swapped to CANCEL. Route headers are copied so the
/// CANCEL traverses the same proxies.
pub fn build_cancel(invite: &Request) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = top_via(invite.headers()) {
        headers.push("Via", via.clone());
    }
    headers.push("Max-Forwards", "70");
    for name in ["From", "To", "Call-ID"] {
        if let Some(value) = invite.headers().get(name) {
            headers.push(name, value.clone());
        }
    }
    if let Some(cseq) = invite.cseq_number() {
        headers.push("CSeq", format!("{} CANCEL", cseq));
    }
    for route in invite.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }

    Request::new(
        RequestLine::new(Method::Cancel, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
}

/// Convenience: To-tag of a response.
pub fn to_tag(response: &Response) -> Option<SmolStr> {
    response.headers().get("To").and_then(|v| extract_tag(v))
}
