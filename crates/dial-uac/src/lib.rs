// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP user-agent client facade.
//!
//! [`UserAgentClient`] owns the transport, the transaction table, the
//! dialog table and the auto-refresh scheduler. Operations are async and
//! return the final [`Response`] (including 3xx-6xx finals) or a
//! [`ClientError`]; 401/407 challenges are answered once automatically when
//! credentials are configured.
//!
//! # Example
//! ```no_run
//! use dial_uac::{ClientConfig, Credentials, UserAgentClient};
//! # async fn example() -> Result<(), dial_uac::ClientError> {
//! let mut config = ClientConfig::default();
//! config.credentials = Some(Credentials::new("1111", "secret"));
//! let client = UserAgentClient::bind(config).await?;
//! let response = client.register("sip:1111@192.0.2.1", None, 3600).await?;
//! assert_eq!(response.code(), 200);
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod auth;
pub mod error;
pub mod hooks;
pub mod refresh;

pub use dial_auth::Credentials;
pub use dial_core::{Headers, Method, Request, Response, SipUri};
pub use dial_sdp::{create_answer, create_offer, CodecSpec, MediaSpec};
pub use dial_dialog::{Dialog, DialogId, DialogState};
pub use dial_transaction::{TransactionKey, TransactionTimer};
pub use dial_transport::TransportKind;
pub use error::ClientError;
pub use hooks::{HookContext, HookError, Hooks};
pub use refresh::{next_refresh_delay, REFRESH_FLOOR, REFRESH_GUARD};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dial_auth::DigestClient;
use dial_core::{generate_branch, generate_call_id, generate_tag, RequestLine};
use dial_parse::{parse, serialize_request, SipMessage};
use dial_transaction::{
    build_cancel, to_tag, TerminationReason, TimerDefaults, TransactionManager, TransactionUser,
    TransportDispatcher,
};
use dial_transport::{Transport, TransportError};
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use refresh::{RefreshHandle, FAILURE_RETRY};

/// Callback invoked by the auto-refresh scheduler when a refresh fails in a
/// way the application must act on (typically expired credentials).
pub type ErrorSink = Box<dyn Fn(&ClientError) + Send + Sync>;

/// Construction-time configuration for a [`UserAgentClient`].
pub struct ClientConfig {
    pub local_addr: SocketAddr,
    pub transport: TransportKind,
    /// Client-level credentials for automatic challenge handling.
    pub credentials: Option<Credentials>,
    pub hooks: Hooks,
    pub user_agent: SmolStr,
    /// Base timer values; shrink in tests to speed up timeouts.
    pub timer_defaults: TimerDefaults,
    /// Where the auto-refresh scheduler reports authentication failures.
    pub refresh_error_sink: Option<ErrorSink>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_addr: "0.0.0.0:0".parse().expect("default bind address"),
            transport: TransportKind::Udp,
            credentials: None,
            hooks: Hooks::new(),
            user_agent: SmolStr::new("sipdial/0.1"),
            timer_defaults: TimerDefaults::default(),
            refresh_error_sink: None,
        }
    }
}

/// Target of a [`UserAgentClient::bye`].
pub enum ByeTarget<'a> {
    /// A final 2xx INVITE response previously returned by this client.
    Response(&'a Response),
    /// An explicit dialog id.
    Dialog(&'a DialogId),
}

/// Last successful registration, as granted by the server.
#[derive(Debug, Clone)]
pub struct Registration {
    pub aor: SmolStr,
    pub granted: Duration,
    pub registrar: SocketAddr,
}

enum TxnEvent {
    Provisional(Response),
    Final(Response),
    Terminated(TerminationReason),
}

struct PendingInvite {
    request: Request,
    peer: SocketAddr,
    provisional: AtomicBool,
}

struct RefreshState {
    aor: SmolStr,
    registrar: Option<SocketAddr>,
    interval: Option<Duration>,
    handle: RefreshHandle,
}

struct Inner {
    transport: Arc<Transport>,
    manager: TransactionManager,
    dialogs: dial_dialog::DialogManager,
    hooks: Hooks,
    digest: Option<DigestClient>,
    user_agent: SmolStr,
    pending: DashMap<TransactionKey, mpsc::UnboundedSender<TxnEvent>>,
    invites: DashMap<TransactionKey, PendingInvite>,
    /// Destination a Call-ID was last sent to; lets `retry_with_auth` and
    /// in-dialog follow-ups reuse the original route.
    peers: DashMap<SmolStr, SocketAddr>,
    registration: std::sync::Mutex<Option<Registration>>,
    refresh: std::sync::Mutex<Option<RefreshState>>,
    error_sink: Option<ErrorSink>,
    closed: AtomicBool,
    reader: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct EngineDispatcher {
    transport: Arc<Transport>,
}

#[async_trait]
impl TransportDispatcher for EngineDispatcher {
    async fn dispatch(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        self.transport
            .send(payload, peer)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}

struct EngineUser {
    inner: Weak<Inner>,
}

#[async_trait]
impl TransactionUser for EngineUser {
    async fn on_provisional(&self, key: &TransactionKey, response: &Response) {
        self.forward(key, TxnEvent::Provisional(response.clone()));
    }

    async fn on_final(&self, key: &TransactionKey, response: &Response) {
        self.forward(key, TxnEvent::Final(response.clone()));
    }

    async fn on_terminated(&self, key: &TransactionKey, reason: TerminationReason) {
        self.forward(key, TxnEvent::Terminated(reason));
    }
}

impl EngineUser {
    fn forward(&self, key: &TransactionKey, event: TxnEvent) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(tx) = inner.pending.get(key) {
                let _ = tx.send(event);
            }
        }
    }
}

/// The user-facing SIP client. Owns socket, tables and scheduler; dropping
/// it is equivalent to [`UserAgentClient::close`] minus the best-effort
/// CANCEL/BYE sweeps, which need the async context.
pub struct UserAgentClient {
    inner: Arc<Inner>,
}

impl UserAgentClient {
    /// Binds the transport and starts the receive loop.
    pub async fn bind(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = Arc::new(Transport::bind(config.transport, config.local_addr).await?);
        let dispatcher = Arc::new(EngineDispatcher {
            transport: Arc::clone(&transport),
        });
        let manager = TransactionManager::with_timer_defaults(
            dispatcher,
            config.transport.is_reliable(),
            config.timer_defaults,
        );

        let inner = Arc::new(Inner {
            transport: Arc::clone(&transport),
            manager,
            dialogs: dial_dialog::DialogManager::new(),
            hooks: config.hooks,
            digest: config.credentials.map(DigestClient::new),
            user_agent: config.user_agent,
            pending: DashMap::new(),
            invites: DashMap::new(),
            peers: DashMap::new(),
            registration: std::sync::Mutex::new(None),
            refresh: std::sync::Mutex::new(None),
            error_sink: config.refresh_error_sink,
            closed: AtomicBool::new(false),
            reader: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let reader_transport = Arc::clone(&transport);
        let reader = tokio::spawn(async move {
            run_reader(reader_transport, weak).await;
        });
        *inner.reader.lock().expect("reader lock") = Some(reader);

        info!(local = %transport.local_addr(), kind = ?transport.kind(), "client bound");
        Ok(Self { inner })
    }

    /// Local transport address after bind.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The last successful registration, if any.
    pub fn registration(&self) -> Option<Registration> {
        self.inner.registration.lock().expect("registration lock").clone()
    }

    /// Looks up a stored dialog.
    pub fn dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialogs.get(id)
    }

    /// Finds the dialog a response belongs to.
    pub fn dialog_for_response(&self, response: &Response) -> Option<Dialog> {
        self.inner.dialogs.find_for_response(response)
    }

    /// Registers `aor` with its registrar (derived from the AoR host when
    /// not given). Returns the final response; 200 records the granted
    /// expiry and re-arms the auto-refresh scheduler when enabled.
    pub async fn register(
        &self,
        aor: &str,
        registrar: Option<&str>,
        expires: u32,
    ) -> Result<Response, ClientError> {
        let aor_uri = SipUri::parse(aor).map_err(|_| ClientError::BadArgument { field: "aor" })?;
        let registrar_addr = match registrar {
            Some(spec) => Some(resolve_hostport(spec)?),
            None => None,
        };
        let response = do_register(&self.inner, &aor_uri, registrar_addr, expires).await?;
        if response.code() == 200 && expires > 0 {
            self.rearm_refresh_if_enabled(&response);
        }
        Ok(response)
    }

    /// Deregisters: REGISTER with expires=0, cancelling auto-refresh for
    /// the AoR first.
    pub async fn unregister(&self, aor: &str) -> Result<Response, ClientError> {
        let matching = {
            let guard = self.inner.refresh.lock().expect("refresh lock");
            guard.as_ref().map(|s| s.aor.as_str() == aor).unwrap_or(false)
        };
        if matching {
            self.disable_auto_refresh();
        }
        let response = self.register(aor, None, 0).await?;
        if response.code() == 200 {
            *self.inner.registration.lock().expect("registration lock") = None;
        }
        Ok(response)
    }

    /// Originates a session. Returns the final response; dialogs are
    /// created on tagged provisionals (early) and on the 2xx (confirmed).
    pub async fn invite(
        &self,
        to: &str,
        from: Option<&str>,
        body: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<Response, ClientError> {
        let to_uri = SipUri::parse(to).map_err(|_| ClientError::BadArgument { field: "to" })?;
        let peer = resolve_uri(&to_uri)?;

        let mut headers = Headers::new();
        headers.push("From", self.from_value(from));
        headers.push("To", format!("<{}>", to_uri));
        headers.push(
            "Contact",
            format!("<sip:{}>", self.inner.transport.local_addr()),
        );
        for (name, value) in extra_headers {
            headers.push(*name, *value);
        }
        let body_bytes = match body {
            Some(text) => {
                headers.push("Content-Type", "application/sdp");
                Bytes::copy_from_slice(text.as_bytes())
            }
            None => Bytes::new(),
        };

        let request = Request::new(
            RequestLine::new(Method::Invite, to_uri),
            headers,
            body_bytes,
        );
        send_request(&self.inner, request, peer, false).await
    }

    /// Acknowledges a 2xx final. The ACK is dialog-scope: fresh branch,
    /// INVITE's CSeq number, sent outside any transaction.
    pub async fn ack(&self, final_response: &Response) -> Result<(), ClientError> {
        if !final_response.is_success() {
            // Non-2xx finals are ACKed by the INVITE transaction itself.
            return Err(ClientError::BadArgument {
                field: "final_response",
            });
        }
        let call_id = final_response
            .headers()
            .get("Call-ID")
            .cloned()
            .unwrap_or_default();
        let dialog = self
            .inner
            .dialogs
            .find_for_response(final_response)
            .ok_or(ClientError::NoDialog { call_id })?;

        let mut ack = dialog.create_ack();
        ensure_headers(&self.inner, &mut ack, dialog.peer);
        let ctx = HookContext {
            transaction: None,
            dialog: Some(&dialog.id),
            destination: dialog.peer,
            source: None,
            started_at: Instant::now(),
        };
        let ack = match self.inner.hooks.run_request(ack, &ctx) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err((hook, e)) => {
                return Err(ClientError::HookFailure {
                    hook,
                    cause: e.message,
                })
            }
        };
        self.inner
            .transport
            .send(serialize_request(&ack), dialog.peer)
            .await?;
        Ok(())
    }

    /// Terminates a session with BYE, by prior response or by dialog id.
    pub async fn bye(&self, target: ByeTarget<'_>) -> Result<Response, ClientError> {
        let id = match target {
            ByeTarget::Response(response) => {
                DialogId::from_response(response).ok_or(ClientError::NoDialog {
                    call_id: response
                        .headers()
                        .get("Call-ID")
                        .cloned()
                        .unwrap_or_default(),
                })?
            }
            ByeTarget::Dialog(id) => id.clone(),
        };

        let (request, peer) = self
            .inner
            .dialogs
            .with_dialog_mut(&id, |dialog| {
                (dialog.in_dialog_request(Method::Bye), dialog.peer)
            })
            .ok_or(ClientError::NoDialog {
                call_id: id.call_id.clone(),
            })?;

        let response = send_request(&self.inner, request, peer, false).await?;
        if response.is_final() {
            self.inner.dialogs.with_dialog_mut(&id, |d| d.terminate());
            self.inner.dialogs.remove(&id);
        }
        Ok(response)
    }

    /// Cancels a pending INVITE. Only legal once a provisional has been
    /// received for it; returns the CANCEL's own final response.
    pub async fn cancel(&self, txn_id: &TransactionKey) -> Result<Response, ClientError> {
        let (request, peer) = {
            let pending = self.inner.invites.get(txn_id).ok_or(ClientError::BadArgument {
                field: "pending_invite_transaction_id",
            })?;
            if !pending.provisional.load(Ordering::Acquire) {
                return Err(ClientError::BadArgument {
                    field: "cancel before provisional",
                });
            }
            (build_cancel(&pending.request), pending.peer)
        };
        send_request(&self.inner, request, peer, false).await
    }

    /// Probes a peer with OPTIONS.
    pub async fn options(&self, uri: &str) -> Result<Response, ClientError> {
        self.request(Method::Options, uri, &[], None, None).await
    }

    /// Sends an instant message (MESSAGE).
    pub async fn message(
        &self,
        to: &str,
        text: &str,
        content_type: &str,
    ) -> Result<Response, ClientError> {
        self.request(
            Method::Message,
            to,
            &[],
            Some(Bytes::copy_from_slice(text.as_bytes())),
            Some(content_type),
        )
        .await
    }

    /// Generic request primitive the named operations are built on.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        extra_headers: &[(&str, &str)],
        body: Option<Bytes>,
        content_type: Option<&str>,
    ) -> Result<Response, ClientError> {
        let target = SipUri::parse(uri).map_err(|_| ClientError::BadArgument { field: "uri" })?;
        let peer = resolve_uri(&target)?;

        let mut headers = Headers::new();
        for (name, value) in extra_headers {
            headers.push(*name, *value);
        }
        if let Some(ct) = content_type {
            headers.push("Content-Type", ct);
        }
        let request = Request::new(
            RequestLine::new(method, target),
            headers,
            body.unwrap_or_default(),
        );
        send_request(&self.inner, request, peer, false).await
    }

    /// Answers a 401/407 the application chose to handle itself. Per-call
    /// credentials take precedence over the client-level ones. At most one
    /// resubmission happens; a further challenge comes back as-is.
    pub async fn retry_with_auth(
        &self,
        challenge_response: &Response,
        credentials: Option<Credentials>,
    ) -> Result<Response, ClientError> {
        if challenge_response.code() != 401 && challenge_response.code() != 407 {
            return Err(ClientError::BadArgument {
                field: "challenge_response",
            });
        }
        let original = challenge_response
            .request()
            .ok_or(ClientError::BadArgument {
                field: "challenge_response",
            })?
            .clone();

        let per_call;
        let digest = match credentials {
            Some(creds) => {
                per_call = DigestClient::new(creds);
                &per_call
            }
            None => self.inner.digest.as_ref().ok_or(ClientError::AuthFailed {
                reason: "no credentials available".into(),
            })?,
        };

        let retry = auth::build_auth_retry(&original, challenge_response, digest)?;
        let peer = self.peer_for(&original)?;
        send_request(&self.inner, retry, peer, true).await
    }

    /// Starts periodic re-registration of `aor`: one REGISTER immediately,
    /// then again ahead of every granted expiry (or at `interval`). Stops
    /// on [`Self::unregister`], [`Self::disable_auto_refresh`] or close.
    pub fn enable_auto_refresh(&self, aor: &str, interval: Option<Duration>) {
        self.disable_auto_refresh();
        let handle = spawn_refresh(
            &self.inner,
            SmolStr::new(aor),
            None,
            interval,
            None,
        );
        *self.inner.refresh.lock().expect("refresh lock") = Some(RefreshState {
            aor: SmolStr::new(aor),
            registrar: None,
            interval,
            handle,
        });
    }

    /// Cancels the refresh scheduler; no refresh fires after this returns.
    pub fn disable_auto_refresh(&self) {
        if let Some(state) = self.inner.refresh.lock().expect("refresh lock").take() {
            state.handle.cancel();
        }
    }

    /// Shuts the client down: scheduler, then live transactions (CANCEL
    /// for unanswered INVITEs), then dialogs (BYE), then the transport.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disable_auto_refresh();

        // Best-effort CANCEL for INVITEs that saw a provisional. Collected
        // first so no table guard lives across the sends.
        let cancels: Vec<(Request, SocketAddr)> = self
            .inner
            .invites
            .iter()
            .filter(|entry| entry.provisional.load(Ordering::Acquire))
            .map(|entry| (build_cancel(&entry.request), entry.peer))
            .collect();
        for (mut cancel, peer) in cancels {
            ensure_headers(&self.inner, &mut cancel, peer);
            let _ = self
                .inner
                .transport
                .send(serialize_request(&cancel), peer)
                .await;
        }

        self.inner
            .manager
            .terminate_all(TerminationReason::Closed)
            .await;

        // Best-effort BYE for confirmed dialogs.
        for id in self.inner.dialogs.all_ids() {
            let bye = self.inner.dialogs.with_dialog_mut(&id, |dialog| {
                if dialog.state == DialogState::Confirmed {
                    Some((dialog.in_dialog_request(Method::Bye), dialog.peer))
                } else {
                    None
                }
            });
            if let Some(Some((mut bye, peer))) = bye {
                ensure_headers(&self.inner, &mut bye, peer);
                let _ = self
                    .inner
                    .transport
                    .send(serialize_request(&bye), peer)
                    .await;
            }
            self.inner.dialogs.remove(&id);
        }

        self.inner.transport.close();
        if let Some(reader) = self.inner.reader.lock().expect("reader lock").take() {
            reader.abort();
        }
        info!("client closed");
    }

    fn from_value(&self, from: Option<&str>) -> String {
        match from {
            Some(uri) => format!("<{}>;tag={}", uri, generate_tag()),
            None => format!("<{}>;tag={}", self.default_from_uri(), generate_tag()),
        }
    }

    fn default_from_uri(&self) -> String {
        let local = self.inner.transport.local_addr();
        let user = self
            .inner
            .digest
            .as_ref()
            .map(|d| d.credentials().username.to_string())
            .unwrap_or_else(|| "user".to_owned());
        format!("sip:{}@{}", user, local.ip())
    }

    fn peer_for(&self, request: &Request) -> Result<SocketAddr, ClientError> {
        if let Some(call_id) = request.headers().get("Call-ID") {
            if let Some(peer) = self.inner.peers.get(call_id) {
                return Ok(*peer);
            }
        }
        resolve_uri(request.uri())
    }

    fn rearm_refresh_if_enabled(&self, response: &Response) {
        let mut guard = self.inner.refresh.lock().expect("refresh lock");
        if let Some(RefreshState {
            aor,
            registrar,
            interval,
            handle,
        }) = guard.take()
        {
            handle.cancel();
            let delay = next_refresh_delay(granted_expires(response), interval);
            let handle = spawn_refresh(&self.inner, aor.clone(), registrar, interval, Some(delay));
            *guard = Some(RefreshState {
                aor,
                registrar,
                interval,
                handle,
            });
        }
    }
}

impl Drop for UserAgentClient {
    fn drop(&mut self) {
        // Synchronous close-equivalent: stop the scheduler and the reader
        // and release the socket. The async best-effort sweeps are only
        // available through close().
        self.inner.closed.store(true, Ordering::Release);
        if let Some(state) = self.inner.refresh.lock().expect("refresh lock").take() {
            state.handle.cancel();
        }
        if let Some(reader) = self.inner.reader.lock().expect("reader lock").take() {
            reader.abort();
        }
        self.inner.transport.close();
    }
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

async fn run_reader(transport: Arc<Transport>, weak: Weak<Inner>) {
    loop {
        match transport.recv(None).await {
            Ok((frame, peer)) => {
                let Some(inner) = weak.upgrade() else { break };
                handle_frame(&inner, frame, peer).await;
            }
            Err(TransportError::Unavailable) => break,
            Err(e) => {
                warn!(%e, "transport receive error");
                if weak.upgrade().is_none() {
                    break;
                }
            }
        }
    }
}

async fn handle_frame(inner: &Arc<Inner>, frame: Bytes, peer: SocketAddr) {
    match parse(&frame) {
        Ok(SipMessage::Response(response)) => {
            let matched = inner.manager.receive_response(response.clone()).await;
            if !matched {
                handle_stray_response(inner, response, peer).await;
            }
        }
        Ok(SipMessage::Request(request)) => {
            debug!(method = %request.method(), %peer, "inbound request ignored (client-only stack)");
        }
        Err(e) => {
            warn!(%peer, %e, "dropping unparseable message");
        }
    }
}

/// Responses that match no live transaction. The interesting case is a
/// forked 2xx to INVITE with a To-tag we have never seen: first 2xx wins,
/// so the latecomer is answered with ACK followed by BYE.
async fn handle_stray_response(inner: &Arc<Inner>, response: Response, peer: SocketAddr) {
    let is_invite_2xx =
        response.is_success() && response.cseq_method() == Some(Method::Invite);
    if is_invite_2xx {
        if let (Some(call_id), Some(remote_tag)) =
            (response.headers().get("Call-ID"), to_tag(&response))
        {
            if let Some(existing) = inner.dialogs.find_by_call_id(call_id.as_str()) {
                if existing.id.remote_tag != remote_tag {
                    info!(%call_id, "late 2xx with new To-tag; answering with ACK+BYE");
                    absorb_forked_2xx(inner, &response, peer).await;
                    return;
                }
                if existing.state == DialogState::Confirmed {
                    // Retransmitted 2xx after the transaction ended: the
                    // dialog re-sends its ACK.
                    debug!(%call_id, "re-acknowledging retransmitted 2xx");
                    let mut ack = existing.create_ack();
                    ensure_headers(inner, &mut ack, existing.peer);
                    let _ = inner
                        .transport
                        .send(serialize_request(&ack), existing.peer)
                        .await;
                    return;
                }
            }
        }
    }
    debug!(code = response.code(), %peer, "stray response dropped");
}

async fn absorb_forked_2xx(inner: &Arc<Inner>, response: &Response, peer: SocketAddr) {
    let Some(target) = response
        .headers()
        .get("Contact")
        .and_then(|c| dial_core::uri_from_name_addr(c))
    else {
        return;
    };
    let Some(cseq) = response.cseq_number() else {
        return;
    };

    for (method, cseq) in [(Method::Ack, cseq), (Method::Bye, cseq + 1)] {
        let mut headers = Headers::new();
        for name in ["From", "To", "Call-ID"] {
            if let Some(value) = response.headers().get(name) {
                headers.push(name, value.clone());
            }
        }
        headers.push("CSeq", format!("{} {}", cseq, method.as_str()));
        let mut request = Request::new(
            RequestLine::new(method, target.clone()),
            headers,
            Bytes::new(),
        );
        ensure_headers(inner, &mut request, peer);
        let _ = inner
            .transport
            .send(serialize_request(&request), peer)
            .await;
    }
}

/// Completes a request with the headers every SIP message needs, leaving
/// anything the caller already set untouched.
fn ensure_headers(inner: &Arc<Inner>, request: &mut Request, _peer: SocketAddr) {
    let local = inner.transport.local_addr();
    let method = request.method().clone();

    if !request.headers().contains("Via") {
        request.headers_mut().push(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={};rport",
                inner.transport.kind().via_token(),
                local,
                generate_branch()
            ),
        );
    }
    if !request.headers().contains("From") {
        let user = inner
            .digest
            .as_ref()
            .map(|d| d.credentials().username.to_string())
            .unwrap_or_else(|| "user".to_owned());
        request.headers_mut().push(
            "From",
            format!("<sip:{}@{}>;tag={}", user, local.ip(), generate_tag()),
        );
    }
    if !request.headers().contains("To") {
        let to = format!("<{}>", request.uri());
        request.headers_mut().push("To", to);
    }
    if !request.headers().contains("Call-ID") {
        request
            .headers_mut()
            .push("Call-ID", generate_call_id(&local.ip().to_string()));
    }
    if !request.headers().contains("CSeq") {
        request
            .headers_mut()
            .push("CSeq", format!("1 {}", method.as_str()));
    }
    if !request.headers().contains("Max-Forwards") {
        request.headers_mut().push("Max-Forwards", "70");
    }
    if !request.headers().contains("User-Agent") {
        let ua = inner
            .digest
            .as_ref()
            .and_then(|d| d.credentials().user_agent.clone())
            .unwrap_or_else(|| inner.user_agent.clone());
        request.headers_mut().push("User-Agent", ua);
    }
}

/// The request pipeline: hooks → transaction → responses → auth controller.
///
/// Loops at most twice: the second pass is the single authenticated
/// resubmission a 401/407 is allowed to trigger.
async fn send_request(
    inner: &Arc<Inner>,
    request: Request,
    peer: SocketAddr,
    mut attempted_auth: bool,
) -> Result<Response, ClientError> {
    let mut attempt = request;
    loop {
        if inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Transport(TransportError::Unavailable));
        }
        ensure_headers(inner, &mut attempt, peer);
        let started_at = Instant::now();

        let ctx = HookContext {
            transaction: None,
            dialog: None,
            destination: peer,
            source: None,
            started_at,
        };
        let prepared = match inner.hooks.run_request(attempt.clone(), &ctx) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("send cancelled by on_request hook");
                return Err(ClientError::HookFailure {
                    hook: "on_request",
                    cause: "send cancelled".into(),
                });
            }
            Err((hook, e)) => {
                return Err(ClientError::HookFailure {
                    hook,
                    cause: e.message,
                })
            }
        };

        if let Some(call_id) = prepared.headers().get("Call-ID") {
            inner.peers.insert(call_id.clone(), peer);
        }

        let key = TransactionKey::for_request(&prepared)
            .ok_or(ClientError::BadArgument { field: "Via" })?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        inner.pending.insert(key.clone(), tx);
        if prepared.method() == &Method::Invite {
            inner.invites.insert(
                key.clone(),
                PendingInvite {
                    request: prepared.clone(),
                    peer,
                    provisional: AtomicBool::new(false),
                },
            );
        }

        let user = Arc::new(EngineUser {
            inner: Arc::downgrade(inner),
        });
        let started = inner.manager.start(prepared.clone(), peer, user).await;
        let result = match started {
            Ok(_) => await_final(inner, &key, &mut rx, &prepared, peer, started_at).await,
            Err(_) => Err(ClientError::BadArgument { field: "Via" }),
        };
        inner.pending.remove(&key);
        inner.invites.remove(&key);

        let mut response = result?;

        let challenged = response.code() == 401 || response.code() == 407;
        if challenged && !attempted_auth {
            let ctx = HookContext {
                transaction: Some(&key),
                dialog: None,
                destination: peer,
                source: Some(peer),
                started_at,
            };
            response = match inner.hooks.run_auth_challenge(response, &ctx) {
                Ok(response) => response,
                Err((hook, e)) => {
                    return Err(ClientError::HookFailure {
                        hook,
                        cause: e.message,
                    })
                }
            };
            if let Some(digest) = &inner.digest {
                match auth::build_auth_retry(&prepared, &response, digest) {
                    Ok(retry) => {
                        debug!(code = response.code(), "resubmitting with credentials");
                        attempted_auth = true;
                        attempt = retry;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        response.set_request(prepared);
        return Ok(response);
    }
}

async fn await_final(
    inner: &Arc<Inner>,
    key: &TransactionKey,
    rx: &mut mpsc::UnboundedReceiver<TxnEvent>,
    request: &Request,
    peer: SocketAddr,
    started_at: Instant,
) -> Result<Response, ClientError> {
    loop {
        let Some(event) = rx.recv().await else {
            return Err(ClientError::Transport(TransportError::Unavailable));
        };
        match event {
            TxnEvent::Provisional(response) => {
                if request.method() == &Method::Invite {
                    if let Some(pending) = inner.invites.get(key) {
                        pending.provisional.store(true, Ordering::Release);
                    }
                    if let Some(dialog) = Dialog::from_invite_response(request, &response, peer) {
                        if inner.dialogs.get(&dialog.id).is_none() {
                            debug!(id = %dialog.id, "early dialog created");
                            inner.dialogs.insert(dialog);
                        }
                    }
                }
                let dialog_id = DialogId::from_response(&response);
                let ctx = HookContext {
                    transaction: Some(key),
                    dialog: dialog_id.as_ref(),
                    destination: peer,
                    source: Some(peer),
                    started_at,
                };
                if let Err((hook, e)) = inner.hooks.run_response(response, &ctx) {
                    return Err(ClientError::HookFailure {
                        hook,
                        cause: e.message,
                    });
                }
            }
            TxnEvent::Final(response) => {
                if request.method() == &Method::Invite {
                    track_invite_final(inner, request, &response, peer);
                }
                let dialog_id = DialogId::from_response(&response);
                let ctx = HookContext {
                    transaction: Some(key),
                    dialog: dialog_id.as_ref(),
                    destination: peer,
                    source: Some(peer),
                    started_at,
                };
                return match inner.hooks.run_response(response, &ctx) {
                    Ok(response) => Ok(response),
                    Err((hook, e)) => Err(ClientError::HookFailure {
                        hook,
                        cause: e.message,
                    }),
                };
            }
            TxnEvent::Terminated(reason) => match reason {
                TerminationReason::TimedOut(timer) => {
                    return Err(ClientError::TransactionTimedOut {
                        txn_id: key.clone(),
                        timer,
                    })
                }
                TerminationReason::TransportError | TerminationReason::Closed => {
                    return Err(ClientError::Transport(TransportError::Unavailable))
                }
                // Normal termination follows the final we already returned;
                // seeing it here means the final never arrived.
                TerminationReason::Completed => {
                    return Err(ClientError::Transport(TransportError::Unavailable))
                }
            },
        }
    }
}

/// Dialog bookkeeping for an INVITE final: confirm or create on 2xx, drop
/// a leftover early dialog on failure.
fn track_invite_final(inner: &Arc<Inner>, request: &Request, response: &Response, peer: SocketAddr) {
    if response.is_success() {
        if let Some(id) = DialogId::from_response(response) {
            let updated = inner
                .dialogs
                .with_dialog_mut(&id, |dialog| dialog.update_from_response(response));
            if updated.is_none() {
                if let Some(dialog) = Dialog::from_invite_response(request, response, peer) {
                    debug!(id = %dialog.id, "dialog confirmed");
                    inner.dialogs.insert(dialog);
                }
            }
        }
    } else if let Some(id) = DialogId::from_response(response) {
        if let Some(dialog) = inner.dialogs.get(&id) {
            if dialog.state == DialogState::Early {
                debug!(id = %id, code = response.code(), "early dialog ended by failure");
                inner.dialogs.remove(&id);
            }
        }
    }
}

/// Builds and sends one REGISTER, recording the granted expiry on 200.
async fn do_register(
    inner: &Arc<Inner>,
    aor: &SipUri,
    registrar: Option<SocketAddr>,
    expires: u32,
) -> Result<Response, ClientError> {
    let peer = match registrar {
        Some(addr) => addr,
        None => resolve_uri(aor)?,
    };
    let local = inner.transport.local_addr();

    let mut headers = Headers::new();
    headers.push("From", format!("<{}>;tag={}", aor, generate_tag()));
    headers.push("To", format!("<{}>", aor));
    headers.push("Contact", format!("<sip:{}>;expires={}", local, expires));
    headers.push("Expires", expires.to_string());

    let request = Request::new(
        RequestLine::new(Method::Register, aor.clone()),
        headers,
        Bytes::new(),
    );
    let response = send_request(inner, request, peer, false).await?;

    if response.code() == 200 && expires > 0 {
        let granted = granted_expires(&response);
        info!(%aor, granted = granted.as_secs(), "registered");
        *inner.registration.lock().expect("registration lock") = Some(Registration {
            aor: SmolStr::new(aor.to_string()),
            granted,
            registrar: peer,
        });
    }
    Ok(response)
}

/// Server-granted registration lifetime: the Contact `expires` parameter
/// wins, then the Expires header, then the RFC default hour.
fn granted_expires(response: &Response) -> Duration {
    if let Some(contact) = response.headers().get("Contact") {
        for part in contact.split(';').skip(1) {
            if let Some((name, value)) = part.trim().split_once('=') {
                if name.trim().eq_ignore_ascii_case("expires") {
                    if let Ok(secs) = value.trim().parse::<u64>() {
                        return Duration::from_secs(secs);
                    }
                }
            }
        }
    }
    if let Some(expires) = response.headers().get("Expires") {
        if let Ok(secs) = expires.trim().parse::<u64>() {
            return Duration::from_secs(secs);
        }
    }
    Duration::from_secs(3600)
}

/// Spawns the refresh task. `initial_delay` of None registers immediately.
fn spawn_refresh(
    inner: &Arc<Inner>,
    aor: SmolStr,
    registrar: Option<SocketAddr>,
    interval: Option<Duration>,
    initial_delay: Option<Duration>,
) -> RefreshHandle {
    let weak = Arc::downgrade(inner);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut delay = initial_delay;
        loop {
            if let Some(d) = delay {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = tokio::time::sleep(d) => {}
                }
            }
            let Some(inner) = weak.upgrade() else { break };
            if inner.closed.load(Ordering::Acquire) {
                break;
            }

            let aor_uri = match SipUri::parse(&aor) {
                Ok(uri) => uri,
                Err(_) => {
                    warn!(%aor, "auto-refresh stopped: unparseable AoR");
                    break;
                }
            };
            let next = match do_register(&inner, &aor_uri, registrar, 3600).await {
                Ok(response) if response.code() == 200 => {
                    next_refresh_delay(granted_expires(&response), interval)
                }
                Ok(response) if response.code() == 401 || response.code() == 407 => {
                    let error = ClientError::AuthFailed {
                        reason: format!("refresh rejected with {}", response.code()),
                    };
                    warn!(%aor, %error, "auto-refresh authentication failed");
                    if let Some(sink) = &inner.error_sink {
                        sink(&error);
                    }
                    FAILURE_RETRY
                }
                Ok(response) => {
                    warn!(%aor, code = response.code(), "auto-refresh rejected; retrying later");
                    FAILURE_RETRY
                }
                Err(e) => {
                    warn!(%aor, %e, "auto-refresh failed; retrying later");
                    if matches!(e, ClientError::AuthFailed { .. }) {
                        if let Some(sink) = &inner.error_sink {
                            sink(&e);
                        }
                    }
                    FAILURE_RETRY
                }
            };
            drop(inner);
            delay = Some(next);
        }
    });

    RefreshHandle::new(cancel_tx, task)
}

fn resolve_uri(uri: &SipUri) -> Result<SocketAddr, ClientError> {
    resolve_host(uri.host(), uri.port_or_default())
}

/// DNS is out of scope: hosts must be IP literals.
fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| ClientError::BadArgument { field: "host" })
}

fn resolve_hostport(spec: &str) -> Result<SocketAddr, ClientError> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    resolve_host(spec, 5060)
}
