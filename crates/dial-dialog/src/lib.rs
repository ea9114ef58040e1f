// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §12 dialog state from the UAC perspective.
//!
//! Dialogs are created from INVITE responses (early on a tagged 1xx,
//! confirmed on a 2xx), hold the route set and CSeq bookkeeping, and build
//! in-dialog requests. The ACK for a 2xx is built here, in dialog scope
//! with a fresh branch, deliberately a different code path from the
//! transaction-scope ACK a non-2xx final receives.

use std::net::SocketAddr;

use bytes::Bytes;
use dashmap::DashMap;
use dial_core::{
    extract_tag, uri_from_name_addr, Headers, Method, Request, RequestLine, Response, SipUri,
};
use smol_str::SmolStr;
use tracing::debug;

/// Dialog lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Created by a provisional response carrying a To-tag.
    Early,
    /// Established by a 2xx to the INVITE.
    Confirmed,
    /// Ended by BYE (either direction) or a failed INVITE.
    Terminated,
}

/// Dialog identifier: Call-ID plus local and remote tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Derives the UAC-side dialog id from a response: From-tag is ours,
    /// To-tag is theirs. Requires both tags.
    pub fn from_response(response: &Response) -> Option<Self> {
        let call_id = response.headers().get("Call-ID")?.clone();
        let local_tag = extract_tag(response.headers().get("From")?)?;
        let remote_tag = extract_tag(response.headers().get("To")?)?;
        Some(Self::new(call_id, local_tag, remote_tag))
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// UAC-side dialog state.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local_uri: SipUri,
    pub remote_uri: SipUri,
    /// Where in-dialog requests go: the peer's Contact.
    pub remote_target: SipUri,
    /// Record-Route set, reversed into sending order.
    pub route_set: Vec<SmolStr>,
    /// CSeq of the last request we sent in this dialog.
    pub local_seq: u32,
    /// CSeq of the dialog-forming INVITE, reused by its ACK.
    pub invite_cseq: u32,
    pub secure: bool,
    /// Transport destination the dialog was established over.
    pub peer: SocketAddr,
}

impl Dialog {
    /// Creates a dialog from an INVITE and a dialog-forming response.
    ///
    /// Returns None when the response carries no To-tag or is not a 1xx/2xx.
    pub fn from_invite_response(
        invite: &Request,
        response: &Response,
        peer: SocketAddr,
    ) -> Option<Self> {
        let id = DialogId::from_response(response)?;
        let state = match response.code() {
            101..=199 => DialogState::Early,
            200..=299 => DialogState::Confirmed,
            _ => return None,
        };

        let local_uri = uri_from_name_addr(invite.headers().get("From")?)?;
        let remote_uri = uri_from_name_addr(invite.headers().get("To")?)?;
        let remote_target = response
            .headers()
            .get("Contact")
            .and_then(|c| uri_from_name_addr(c))
            .unwrap_or_else(|| invite.uri().clone());
        let route_set = build_route_set(response.headers());
        let invite_cseq = invite.cseq_number()?;
        let secure = local_uri.is_secure() || remote_uri.is_secure();

        Some(Self {
            id,
            state,
            local_uri,
            remote_uri,
            remote_target,
            route_set,
            local_seq: invite_cseq,
            invite_cseq,
            secure,
            peer,
        })
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    /// Absorbs a later response for the same dialog: confirms an early
    /// dialog on 2xx and refreshes the remote target and route set.
    pub fn update_from_response(&mut self, response: &Response) {
        if let Some(contact) = response.headers().get("Contact").and_then(|c| uri_from_name_addr(c))
        {
            self.remote_target = contact;
        }
        let routes = build_route_set(response.headers());
        if !routes.is_empty() {
            self.route_set = routes;
        }
        if response.is_success() {
            self.confirm();
        }
    }

    /// Next CSeq for an in-dialog request.
    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Builds an in-dialog request (BYE, re-INVITE, INFO, UPDATE, REFER).
    ///
    /// Increments the local CSeq. The Via is left for the sender to stamp
    /// with its own address and a fresh branch.
    pub fn in_dialog_request(&mut self, method: Method) -> Request {
        let cseq = self.next_local_seq();
        self.build_request(method, cseq)
    }

    /// Builds the ACK for a 2xx final: dialog scope, INVITE's CSeq number,
    /// fresh branch (stamped by the sender's Via step).
    pub fn create_ack(&self) -> Request {
        self.build_request(Method::Ack, self.invite_cseq)
    }

    fn build_request(&self, method: Method, cseq: u32) -> Request {
        let mut headers = Headers::new();
        headers.push("Max-Forwards", "70");
        headers.push(
            "From",
            format!("<{}>;tag={}", self.local_uri, self.id.local_tag),
        );
        headers.push(
            "To",
            format!("<{}>;tag={}", self.remote_uri, self.id.remote_tag),
        );
        headers.push("Call-ID", self.id.call_id.clone());
        headers.push("CSeq", format!("{} {}", cseq, method.as_str()));
        for route in &self.route_set {
            headers.push("Route", route.clone());
        }

        Request::new(
            RequestLine::new(method, self.remote_target.clone()),
            headers,
            Bytes::new(),
        )
    }
}

/// Builds the sending-order route set from Record-Route headers: the
/// recorded order is reversed for a UAC.
fn build_route_set(headers: &Headers) -> Vec<SmolStr> {
    let mut routes: Vec<SmolStr> = headers
        .get_all("Record-Route")
        .flat_map(|value| split_route_values(value))
        .collect();
    routes.reverse();
    routes
}

/// Splits a comma-joined route header value, respecting quotes and angle
/// brackets.
fn split_route_values(raw: &str) -> Vec<SmolStr> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                let piece = raw[start..idx].trim();
                if !piece.is_empty() {
                    parts.push(SmolStr::new(piece));
                }
                start = idx + 1;
            }
            _ => {}
        }
    }
    let piece = raw[start..].trim();
    if !piece.is_empty() {
        parts.push(SmolStr::new(piece));
    }
    parts
}

/// Table of live dialogs, owned by the client facade.
#[derive(Default)]
pub struct DialogManager {
    dialogs: DashMap<DialogId, Dialog>,
}

impl DialogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dialog: Dialog) {
        debug!(id = %dialog.id, state = ?dialog.state, "dialog stored");
        self.dialogs.insert(dialog.id.clone(), dialog);
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.remove(id).map(|(_, dialog)| dialog)
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    pub fn all_ids(&self) -> Vec<DialogId> {
        self.dialogs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Looks up the dialog a response belongs to (UAC orientation).
    pub fn find_for_response(&self, response: &Response) -> Option<Dialog> {
        let id = DialogId::from_response(response)?;
        self.get(&id)
    }

    /// Finds any non-terminated dialog for a Call-ID. Used to detect a
    /// forked 2xx with an unknown remote tag.
    pub fn find_by_call_id(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs
            .iter()
            .find(|entry| {
                entry.id.call_id.as_str() == call_id && entry.state != DialogState::Terminated
            })
            .map(|entry| entry.clone())
    }

    /// Mutates a stored dialog in place, returning the closure's result.
    pub fn with_dialog_mut<R>(
        &self,
        id: &DialogId,
        f: impl FnOnce(&mut Dialog) -> R,
    ) -> Option<R> {
        self.dialogs.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    /// Drops every terminated dialog.
    pub fn cleanup_terminated(&self) {
        self.dialogs
            .retain(|_, dialog| dialog.state != DialogState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dial_core::StatusLine;

    fn peer() -> SocketAddr {
        "192.0.2.80:5060".parse().unwrap()
    }

    fn invite(cseq: u32) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP c.example.com:5061;branch=z9hG4bKdlg1");
        headers.push("From", "<sip:alice@example.com>;tag=local1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "dlg@c.example.com");
        headers.push("CSeq", format!("{cseq} INVITE"));
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn response(code: u16, to_tag: Option<&str>, contact: Option<&str>) -> Response {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP c.example.com:5061;branch=z9hG4bKdlg1");
        headers.push("From", "<sip:alice@example.com>;tag=local1");
        match to_tag {
            Some(tag) => headers.push("To", format!("<sip:bob@example.com>;tag={tag}")),
            None => headers.push("To", "<sip:bob@example.com>"),
        }
        headers.push("Call-ID", "dlg@c.example.com");
        headers.push("CSeq", "1 INVITE");
        if let Some(c) = contact {
            headers.push("Contact", c);
        }
        Response::new(StatusLine::new(code, "X").unwrap(), headers, Bytes::new())
    }

    #[test]
    fn tagged_180_creates_early_dialog() {
        let inv = invite(1);
        let resp = response(180, Some("remote1"), Some("<sip:bob@ua.example.com>"));
        let dialog = Dialog::from_invite_response(&inv, &resp, peer()).unwrap();
        assert_eq!(dialog.state, DialogState::Early);
        assert_eq!(dialog.id.local_tag.as_str(), "local1");
        assert_eq!(dialog.id.remote_tag.as_str(), "remote1");
        assert_eq!(dialog.remote_target.host(), "ua.example.com");
        assert_eq!(dialog.local_seq, 1);
    }

    #[test]
    fn untagged_provisional_creates_no_dialog() {
        let inv = invite(1);
        let resp = response(180, None, None);
        assert!(Dialog::from_invite_response(&inv, &resp, peer()).is_none());
    }

    #[test]
    fn failure_response_creates_no_dialog() {
        let inv = invite(1);
        let resp = response(404, Some("t"), None);
        assert!(Dialog::from_invite_response(&inv, &resp, peer()).is_none());
    }

    #[test]
    fn two_hundred_confirms_early_dialog() {
        let inv = invite(1);
        let mut dialog = Dialog::from_invite_response(
            &inv,
            &response(180, Some("remote1"), None),
            peer(),
        )
        .unwrap();
        assert_eq!(dialog.state, DialogState::Early);

        dialog.update_from_response(&response(200, Some("remote1"), Some("<sip:bob@new.example.com>")));
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.remote_target.host(), "new.example.com");
    }

    #[test]
    fn route_set_comes_from_record_route_reversed() {
        let inv = invite(1);
        let mut resp = response(200, Some("remote1"), Some("<sip:bob@ua.example.com>"));
        resp.headers_mut().push("Record-Route", "<sip:p1.example.com;lr>");
        resp.headers_mut()
            .push("Record-Route", "<sip:p2.example.com;lr>, <sip:p3.example.com;lr>");

        let mut dialog = Dialog::from_invite_response(&inv, &resp, peer()).unwrap();
        let routes: Vec<String> = dialog.route_set.iter().map(|r| r.as_str().to_owned()).collect();
        assert_eq!(
            routes,
            vec![
                "<sip:p3.example.com;lr>",
                "<sip:p2.example.com;lr>",
                "<sip:p1.example.com;lr>"
            ]
        );

        let bye = dialog.in_dialog_request(Method::Bye);
        let bye_routes: Vec<&str> = bye.headers().get_all("Route").map(|v| v.as_str()).collect();
        assert_eq!(bye_routes, routes);
    }

    #[test]
    fn in_dialog_request_increments_cseq_strictly() {
        let inv = invite(10);
        let mut dialog =
            Dialog::from_invite_response(&inv, &response(200, Some("r"), None), peer()).unwrap();

        let first = dialog.in_dialog_request(Method::Info);
        let second = dialog.in_dialog_request(Method::Bye);
        assert_eq!(first.headers().get("CSeq").unwrap().as_str(), "11 INFO");
        assert_eq!(second.headers().get("CSeq").unwrap().as_str(), "12 BYE");
        assert_eq!(
            first.headers().get("From").unwrap().as_str(),
            "<sip:alice@example.com>;tag=local1"
        );
        assert_eq!(
            first.headers().get("To").unwrap().as_str(),
            "<sip:bob@example.com>;tag=r"
        );
    }

    #[test]
    fn ack_reuses_invite_cseq_and_targets_contact() {
        let inv = invite(7);
        let mut dialog = Dialog::from_invite_response(
            &inv,
            &response(200, Some("r"), Some("<sip:bob@ua.example.com:5080>")),
            peer(),
        )
        .unwrap();
        // A BYE in between must not disturb the ACK's CSeq.
        let _ = dialog.in_dialog_request(Method::Info);

        let ack = dialog.create_ack();
        assert_eq!(ack.method(), &Method::Ack);
        assert_eq!(ack.headers().get("CSeq").unwrap().as_str(), "7 ACK");
        assert_eq!(ack.uri().host(), "ua.example.com");
        assert_eq!(ack.uri().port(), Some(5080));
        assert!(ack.headers().get("Via").is_none(), "sender stamps a fresh branch");
    }

    #[test]
    fn manager_finds_by_response_and_call_id() {
        let manager = DialogManager::new();
        let inv = invite(1);
        let resp = response(200, Some("remote1"), None);
        let dialog = Dialog::from_invite_response(&inv, &resp, peer()).unwrap();
        let id = dialog.id.clone();
        manager.insert(dialog);

        assert!(manager.find_for_response(&resp).is_some());
        assert!(manager.find_by_call_id("dlg@c.example.com").is_some());
        assert!(manager.find_by_call_id("other@c.example.com").is_none());

        manager.with_dialog_mut(&id, |d| d.terminate());
        assert!(manager.find_by_call_id("dlg@c.example.com").is_none());
        manager.cleanup_terminated();
        assert!(manager.is_empty());
    }
}
