// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime that owns the client transaction table.
//!
//! The manager feeds network and timer events into the per-transaction
//! state machines and executes the actions they emit: transmissions go
//! through the [`TransportDispatcher`], deliveries go to the
//! [`TransactionUser`], timers are cancellable spawned sleeps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dial_core::{Method, Request, Response};
use dial_parse::serialize_request;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    build_non2xx_ack,
    fsm::{
        ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm, FsmAction,
        TerminationReason,
    },
    timers::{TimerDefaults, TransactionTimers},
    TransactionKey, TransactionTimer,
};

/// Sends serialized messages toward a peer.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, peer: SocketAddr, payload: Bytes) -> Result<()>;
}

/// Receives transaction events. One user is attached per transaction.
#[async_trait]
pub trait TransactionUser: Send + Sync + 'static {
    async fn on_provisional(&self, key: &TransactionKey, response: &Response);
    async fn on_final(&self, key: &TransactionKey, response: &Response);
    async fn on_terminated(&self, key: &TransactionKey, reason: TerminationReason);
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    peer: SocketAddr,
    request: Request,
    tu: Arc<dyn TransactionUser>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
}

impl ClientEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

enum ManagerCommand {
    TimerFired {
        key: TransactionKey,
        timer: TransactionTimer,
    },
    TransportError {
        key: TransactionKey,
    },
}

struct ManagerInner {
    dispatcher: Arc<dyn TransportDispatcher>,
    table: DashMap<TransactionKey, ClientEntry>,
    defaults: TimerDefaults,
    reliable: bool,
}

/// Owns client transactions and their timers.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
    cmd_tx: mpsc::Sender<ManagerCommand>,
}

impl TransactionManager {
    /// Creates a manager dispatching through `dispatcher`. `reliable`
    /// matches the owning transport and controls retransmission timers.
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>, reliable: bool) -> Self {
        Self::with_timer_defaults(dispatcher, reliable, TimerDefaults::default())
    }

    /// Creates a manager with custom T1/T2/T4 values (test hook).
    pub fn with_timer_defaults(
        dispatcher: Arc<dyn TransportDispatcher>,
        reliable: bool,
        defaults: TimerDefaults,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                dispatcher,
                table: DashMap::new(),
                defaults,
                reliable,
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    /// Number of live transactions.
    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.inner.table.contains_key(key)
    }

    /// Starts a client transaction for `request` toward `peer` and sends
    /// the first transmission.
    pub async fn start(
        &self,
        request: Request,
        peer: SocketAddr,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<TransactionKey> {
        let key = TransactionKey::for_request(&request)
            .ok_or_else(|| anyhow!("request has no Via branch"))?;
        let timers = TransactionTimers::with_defaults(self.inner.reliable, self.inner.defaults);

        let (kind, actions) = if request.method() == &Method::Invite {
            let mut fsm = ClientInviteFsm::new(timers);
            let actions = fsm.on_event(ClientInviteEvent::SendInvite(request.clone()));
            (ClientKind::Invite(fsm), actions)
        } else {
            let mut fsm = ClientNonInviteFsm::new(timers);
            let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(request.clone()));
            (ClientKind::NonInvite(fsm), actions)
        };

        debug!(%key, %peer, "starting client transaction");
        self.inner.table.insert(
            key.clone(),
            ClientEntry {
                kind,
                peer,
                request,
                tu,
                timers: HashMap::new(),
            },
        );
        self.apply_actions(&key, actions).await;
        Ok(key)
    }

    /// Routes a parsed response into its transaction. Returns false when no
    /// transaction matches (stray or retransmission after termination).
    pub async fn receive_response(&self, response: Response) -> bool {
        let Some(key) = TransactionKey::for_response(&response) else {
            debug!("response without usable Via/CSeq; dropping");
            return false;
        };
        let Some(mut entry) = self.inner.table.get_mut(&key) else {
            return false;
        };
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) => {
                let event = if response.is_provisional() {
                    ClientInviteEvent::ReceiveProvisional(response)
                } else {
                    ClientInviteEvent::ReceiveFinal(response)
                };
                fsm.on_event(event)
            }
            ClientKind::NonInvite(fsm) => {
                let event = if response.is_provisional() {
                    ClientNonInviteEvent::ReceiveProvisional(response)
                } else {
                    ClientNonInviteEvent::ReceiveFinal(response)
                };
                fsm.on_event(event)
            }
        };
        drop(entry);
        self.apply_actions(&key, actions).await;
        true
    }

    /// Terminates every live transaction, notifying each user with
    /// `reason`. Used by facade close().
    pub async fn terminate_all(&self, reason: TerminationReason) {
        let keys: Vec<TransactionKey> = self
            .inner
            .table
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, mut entry)) = self.inner.table.remove(&key) {
                entry.cancel_all();
                entry.tu.on_terminated(&key, reason).await;
            }
        }
    }

    fn spawn_command_loop(&self, mut cmd_rx: mpsc::Receiver<ManagerCommand>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ManagerCommand::TimerFired { key, timer } => {
                        manager.handle_timer(key, timer).await;
                    }
                    ManagerCommand::TransportError { key } => {
                        manager.handle_transport_error(key).await;
                    }
                }
            }
        });
    }

    async fn handle_timer(&self, key: TransactionKey, timer: TransactionTimer) {
        let Some(mut entry) = self.inner.table.get_mut(&key) else {
            return;
        };
        entry.cancel_timer(timer);
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::TimerFired(timer)),
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TimerFired(timer)),
        };
        drop(entry);
        self.apply_actions(&key, actions).await;
    }

    async fn handle_transport_error(&self, key: TransactionKey) {
        let Some(mut entry) = self.inner.table.get_mut(&key) else {
            return;
        };
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::TransportError),
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TransportError),
        };
        drop(entry);
        self.apply_actions(&key, actions).await;
    }

    async fn apply_actions(&self, key: &TransactionKey, actions: Vec<FsmAction>) {
        for action in actions {
            match action {
                FsmAction::Transmit(bytes) => {
                    let Some(peer) = self.peer_of(key) else {
                        continue;
                    };
                    if let Err(e) = self.inner.dispatcher.dispatch(peer, bytes).await {
                        warn!(%key, %e, "transaction transmit failed");
                        let _ = self
                            .cmd_tx
                            .send(ManagerCommand::TransportError { key: key.clone() })
                            .await;
                    }
                }
                FsmAction::Deliver(response) => {
                    let Some(tu) = self.tu_of(key) else {
                        continue;
                    };
                    if response.is_provisional() {
                        tu.on_provisional(key, &response).await;
                    } else {
                        tu.on_final(key, &response).await;
                    }
                }
                FsmAction::GenerateAck(response) => {
                    let Some((peer, ack)) = self.build_ack(key, &response) else {
                        continue;
                    };
                    let bytes = serialize_request(&ack);
                    if let Err(e) = self.inner.dispatcher.dispatch(peer, bytes).await {
                        warn!(%key, %e, "ack transmit failed");
                    }
                }
                FsmAction::Schedule { timer, duration } => {
                    self.schedule_timer(key.clone(), timer, duration);
                }
                FsmAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.table.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                FsmAction::Terminate(reason) => {
                    if let Some((_, mut entry)) = self.inner.table.remove(key) {
                        entry.cancel_all();
                        debug!(%key, ?reason, "transaction terminated");
                        entry.tu.on_terminated(key, reason).await;
                    }
                }
            }
        }
    }

    fn peer_of(&self, key: &TransactionKey) -> Option<SocketAddr> {
        self.inner.table.get(key).map(|entry| entry.peer)
    }

    fn tu_of(&self, key: &TransactionKey) -> Option<Arc<dyn TransactionUser>> {
        self.inner.table.get(key).map(|entry| entry.tu.clone())
    }

    fn build_ack(&self, key: &TransactionKey, response: &Response) -> Option<(SocketAddr, Request)> {
        let entry = self.inner.table.get(key)?;
        Some((entry.peer, build_non2xx_ack(&entry.request, response)))
    }

    fn schedule_timer(&self, key: TransactionKey, timer: TransactionTimer, duration: Duration) {
        if duration.is_zero() {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx.send(ManagerCommand::TimerFired { key, timer }).await;
            });
            return;
        }
        let Some(mut entry) = self.inner.table.get_mut(&key) else {
            return;
        };
        entry.cancel_timer(timer);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        drop(entry);

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let _ = cmd_tx.send(ManagerCommand::TimerFired { key, timer }).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch_from_via;
    use dial_core::{Headers, RequestLine, SipUri, StatusLine};
    use dial_parse::parse_request;
    use std::sync::Mutex;

    struct RecordingDispatcher {
        sent: Mutex<Vec<Bytes>>,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransportDispatcher for RecordingDispatcher {
        async fn dispatch(&self, _peer: SocketAddr, payload: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TuEvent {
        Provisional(u16),
        Final(u16),
        Terminated(TerminationReason),
    }

    struct ChannelUser {
        tx: mpsc::UnboundedSender<TuEvent>,
    }

    #[async_trait]
    impl TransactionUser for ChannelUser {
        async fn on_provisional(&self, _key: &TransactionKey, response: &Response) {
            let _ = self.tx.send(TuEvent::Provisional(response.code()));
        }
        async fn on_final(&self, _key: &TransactionKey, response: &Response) {
            let _ = self.tx.send(TuEvent::Final(response.code()));
        }
        async fn on_terminated(&self, _key: &TransactionKey, reason: TerminationReason) {
            let _ = self.tx.send(TuEvent::Terminated(reason));
        }
    }

    fn user() -> (Arc<ChannelUser>, mpsc::UnboundedReceiver<TuEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelUser { tx }), rx)
    }

    fn peer() -> SocketAddr {
        "192.0.2.50:5060".parse().unwrap()
    }

    fn request(method: Method, branch: &str) -> Request {
        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!("SIP/2.0/UDP client.example.com:5061;branch={branch}"),
        );
        headers.push("From", "<sip:alice@example.com>;tag=ft1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "mgr@client.example.com");
        headers.push("CSeq", format!("1 {}", method.as_str()));
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn response_for(request: &Request, code: u16, to_tag: Option<&str>) -> Response {
        let mut headers = Headers::new();
        headers.push("Via", request.headers().get("Via").unwrap().clone());
        headers.push("From", request.headers().get("From").unwrap().clone());
        match to_tag {
            Some(tag) => headers.push("To", format!("<sip:bob@example.com>;tag={tag}")),
            None => headers.push("To", "<sip:bob@example.com>"),
        }
        headers.push("Call-ID", request.headers().get("Call-ID").unwrap().clone());
        headers.push("CSeq", request.headers().get("CSeq").unwrap().clone());
        Response::new(StatusLine::new(code, "X").unwrap(), headers, Bytes::new())
    }

    #[tokio::test(start_paused = true)]
    async fn non_invite_completes_and_terminates_after_timer_k() {
        let dispatcher = RecordingDispatcher::new();
        let manager = TransactionManager::new(dispatcher.clone(), false);
        let (tu, mut events) = user();

        let req = request(Method::Options, "z9hG4bKmgr1");
        let key = manager.start(req.clone(), peer(), tu).await.unwrap();
        assert!(manager.contains(&key));
        assert_eq!(dispatcher.sent().len(), 1);

        assert!(manager.receive_response(response_for(&req, 200, Some("t1"))).await);
        assert_eq!(events.recv().await, Some(TuEvent::Final(200)));

        // Timer K (5s, auto-advanced) terminates the transaction.
        assert_eq!(
            events.recv().await,
            Some(TuEvent::Terminated(TerminationReason::Completed))
        );
        assert!(!manager.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn invite_non2xx_generates_matching_ack() {
        let dispatcher = RecordingDispatcher::new();
        let manager = TransactionManager::new(dispatcher.clone(), false);
        let (tu, mut events) = user();

        let invite = request(Method::Invite, "z9hG4bKmgr2");
        manager.start(invite.clone(), peer(), tu).await.unwrap();

        assert!(manager
            .receive_response(response_for(&invite, 100, None))
            .await);
        assert_eq!(events.recv().await, Some(TuEvent::Provisional(100)));

        assert!(manager
            .receive_response(response_for(&invite, 404, Some("remote1")))
            .await);
        assert_eq!(events.recv().await, Some(TuEvent::Final(404)));

        let sent = dispatcher.sent();
        // Initial INVITE, then the automatic ACK.
        assert!(sent.len() >= 2);
        let ack = parse_request(sent.last().unwrap()).expect("ack parses");
        assert_eq!(ack.method(), &Method::Ack);
        assert_eq!(
            branch_from_via(ack.headers().get("Via").unwrap()),
            branch_from_via(invite.headers().get("Via").unwrap()),
            "ACK reuses the INVITE branch"
        );
        assert_eq!(ack.headers().get("CSeq").unwrap().as_str(), "1 ACK");
        assert!(ack.headers().get("To").unwrap().contains("tag=remote1"));

        // Timer D fires (32s, auto-advanced) and the transaction goes away.
        assert_eq!(
            events.recv().await,
            Some(TuEvent::Terminated(TerminationReason::Completed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_non_invite_times_out_on_timer_f() {
        let dispatcher = RecordingDispatcher::new();
        let manager = TransactionManager::new(dispatcher.clone(), false);
        let (tu, mut events) = user();

        manager
            .start(request(Method::Options, "z9hG4bKmgr3"), peer(), tu)
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(TuEvent::Terminated(TerminationReason::TimedOut(
                TransactionTimer::F
            )))
        );
        // Initial send plus Timer E retransmissions happened on the way.
        assert!(dispatcher.sent().len() > 1);
    }

    #[tokio::test]
    async fn unmatched_response_is_reported() {
        let dispatcher = RecordingDispatcher::new();
        let manager = TransactionManager::new(dispatcher, false);
        let req = request(Method::Options, "z9hG4bKmgr4");
        let resp = response_for(&req, 200, Some("t"));
        assert!(!manager.receive_response(resp).await);
    }

    #[tokio::test]
    async fn terminate_all_notifies_users() {
        let dispatcher = RecordingDispatcher::new();
        let manager = TransactionManager::new(dispatcher, false);
        let (tu, mut events) = user();

        manager
            .start(request(Method::Options, "z9hG4bKmgr5"), peer(), tu)
            .await
            .unwrap();
        manager.terminate_all(TerminationReason::Closed).await;
        assert_eq!(
            events.recv().await,
            Some(TuEvent::Terminated(TerminationReason::Closed))
        );
        assert!(manager.is_empty());
    }
}
