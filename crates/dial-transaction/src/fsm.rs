// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client transaction state machines.
//!
//! Both machines are pure: they consume events and emit actions for the
//! runtime (transmit, deliver, schedule/cancel timers, terminate) without
//! touching sockets or clocks themselves.

use std::time::Duration;

use bytes::Bytes;
use dial_core::{Request, Response};
use dial_parse::serialize_request;

use crate::{timers::TransactionTimers, ClientInviteState, ClientNonInviteState, TransactionTimer};

/// Why a transaction left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal completion after a final response.
    Completed,
    /// Timer B or F elapsed without a final response.
    TimedOut(TransactionTimer),
    /// The transport reported a delivery failure.
    TransportError,
    /// The owning client is shutting down.
    Closed,
}

/// Actions a state machine asks the runtime to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmAction {
    /// Put these bytes on the wire (initial send or retransmission).
    Transmit(Bytes),
    /// Hand the response to the transaction user.
    Deliver(Response),
    /// Send the transaction-scope ACK for this non-2xx final.
    GenerateAck(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    /// Remove the transaction.
    Terminate(TerminationReason),
}

/// Events that drive the INVITE client transaction (RFC 3261 §17.1.1).
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Client INVITE transaction:
/// Calling → Proceeding → Completed → Terminated.
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TransactionTimers,
    a_interval: Duration,
    last_invite: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransactionTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.t1(),
            timers,
            last_invite: None,
        }
    }

    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<FsmAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) => self.handle_send(invite),
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![FsmAction::Deliver(response)]
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            // A retransmitted final while Completed is absorbed with a
            // fresh ACK and is not delivered again.
            (Completed, ClientInviteEvent::ReceiveFinal(response)) => {
                if response.is_final() && !response.is_success() {
                    vec![FsmAction::GenerateAck(response)]
                } else {
                    Vec::new()
                }
            }
            (Calling | Proceeding, ClientInviteEvent::TimerFired(TransactionTimer::A)) => {
                self.handle_timer_a()
            }
            (Calling | Proceeding, ClientInviteEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    FsmAction::Cancel(TransactionTimer::A),
                    FsmAction::Terminate(TerminationReason::TimedOut(TransactionTimer::B)),
                ]
            }
            (Completed, ClientInviteEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![FsmAction::Terminate(TerminationReason::Completed)]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    FsmAction::Cancel(TransactionTimer::A),
                    FsmAction::Cancel(TransactionTimer::B),
                    FsmAction::Terminate(TerminationReason::TransportError),
                ]
            }
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, invite: Request) -> Vec<FsmAction> {
        let bytes = serialize_request(&invite);
        self.last_invite = Some(bytes.clone());
        let mut actions = vec![FsmAction::Transmit(bytes)];
        if self.timers.retransmits() {
            actions.push(FsmAction::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            });
        }
        actions.push(FsmAction::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        actions
    }

    fn handle_final(&mut self, response: Response) -> Vec<FsmAction> {
        if response.is_success() {
            // 2xx terminates immediately; the dialog layer takes over and
            // sends its own ACK on a fresh branch.
            self.state = ClientInviteState::Terminated;
            vec![
                FsmAction::Cancel(TransactionTimer::A),
                FsmAction::Cancel(TransactionTimer::B),
                FsmAction::Deliver(response),
                FsmAction::Terminate(TerminationReason::Completed),
            ]
        } else {
            self.state = ClientInviteState::Completed;
            vec![
                FsmAction::Cancel(TransactionTimer::A),
                FsmAction::Cancel(TransactionTimer::B),
                FsmAction::Deliver(response.clone()),
                FsmAction::GenerateAck(response),
                FsmAction::Schedule {
                    timer: TransactionTimer::D,
                    duration: self.timers.duration(TransactionTimer::D),
                },
            ]
        }
    }

    fn handle_timer_a(&mut self) -> Vec<FsmAction> {
        let Some(invite) = &self.last_invite else {
            return Vec::new();
        };
        let actions = vec![
            FsmAction::Transmit(invite.clone()),
            FsmAction::Schedule {
                timer: TransactionTimer::A,
                // Timer A doubles without the T2 cap (RFC 3261 §17.1.1.2).
                duration: self.a_interval.saturating_mul(2),
            },
        ];
        self.a_interval = self.a_interval.saturating_mul(2);
        actions
    }
}

/// Events that drive the non-INVITE client transaction (RFC 3261 §17.1.2).
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Client non-INVITE transaction:
/// Trying → Proceeding → Completed → Terminated.
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    timers: TransactionTimers,
    e_interval: Duration,
    last_request: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransactionTimers) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.t1(),
            timers,
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<FsmAction> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) => self.handle_send(request),
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                // The first provisional parks the retransmission timer.
                self.state = Proceeding;
                vec![
                    FsmAction::Cancel(TransactionTimer::E),
                    FsmAction::Deliver(response),
                ]
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.state = Completed;
                vec![
                    FsmAction::Cancel(TransactionTimer::E),
                    FsmAction::Cancel(TransactionTimer::F),
                    FsmAction::Deliver(response),
                    FsmAction::Schedule {
                        timer: TransactionTimer::K,
                        duration: self.timers.duration(TransactionTimer::K),
                    },
                ]
            }
            (Trying, ClientNonInviteEvent::TimerFired(TransactionTimer::E)) => {
                self.handle_timer_e()
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    FsmAction::Cancel(TransactionTimer::E),
                    FsmAction::Terminate(TerminationReason::TimedOut(TransactionTimer::F)),
                ]
            }
            (Completed, ClientNonInviteEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![FsmAction::Terminate(TerminationReason::Completed)]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    FsmAction::Cancel(TransactionTimer::E),
                    FsmAction::Cancel(TransactionTimer::F),
                    FsmAction::Terminate(TerminationReason::TransportError),
                ]
            }
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<FsmAction> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        let mut actions = vec![FsmAction::Transmit(bytes)];
        if self.timers.retransmits() {
            actions.push(FsmAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            });
        }
        actions.push(FsmAction::Schedule {
            timer: TransactionTimer::F,
            duration: self.timers.duration(TransactionTimer::F),
        });
        actions
    }

    fn handle_timer_e(&mut self) -> Vec<FsmAction> {
        let Some(request) = &self.last_request else {
            return Vec::new();
        };
        // Timer E doubles up to the T2 ceiling (RFC 3261 §17.1.2.2).
        let next = (self.e_interval.saturating_mul(2)).min(self.timers.t2());
        let actions = vec![
            FsmAction::Transmit(request.clone()),
            FsmAction::Schedule {
                timer: TransactionTimer::E,
                duration: next,
            },
        ];
        self.e_interval = next;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dial_core::{Headers, Method, RequestLine, SipUri, StatusLine};

    fn timers_udp() -> TransactionTimers {
        TransactionTimers::new(false)
    }

    fn sample_invite() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP c.example.com:5061;branch=z9hG4bKfsm1");
        headers.push("From", "<sip:alice@example.com>;tag=1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "fsm@c.example.com");
        headers.push("CSeq", "1 INVITE");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn sample_options() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP c.example.com:5061;branch=z9hG4bKfsm2");
        headers.push("CSeq", "1 OPTIONS");
        Request::new(
            RequestLine::new(Method::Options, SipUri::parse("sip:example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn response(code: u16) -> Response {
        Response::new(
            StatusLine::new(code, "Any").unwrap(),
            Headers::new(),
            Bytes::new(),
        )
    }

    fn transmits(actions: &[FsmAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, FsmAction::Transmit(_)))
            .count()
    }

    #[test]
    fn invite_2xx_terminates_without_transaction_ack() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(response(200)));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, FsmAction::Deliver(_))));
        assert!(
            !actions.iter().any(|a| matches!(a, FsmAction::GenerateAck(_))),
            "2xx ACK belongs to the dialog layer"
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, FsmAction::Terminate(TerminationReason::Completed))));
    }

    #[test]
    fn invite_non2xx_acks_and_waits_for_timer_d() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        fsm.on_event(ClientInviteEvent::ReceiveProvisional(response(100)));
        assert_eq!(fsm.state, ClientInviteState::Proceeding);

        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(response(404)));
        assert_eq!(fsm.state, ClientInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(a, FsmAction::GenerateAck(_))));
        assert!(actions.iter().any(|a| matches!(
            a,
            FsmAction::Schedule {
                timer: TransactionTimer::D,
                ..
            }
        )));

        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::D));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, FsmAction::Terminate(TerminationReason::Completed))));
    }

    #[test]
    fn invite_retransmitted_final_is_reacked_not_redelivered() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        fsm.on_event(ClientInviteEvent::ReceiveFinal(response(486)));

        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(response(486)));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], FsmAction::GenerateAck(_)));
    }

    #[test]
    fn invite_timer_b_times_out() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::B));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(
            a,
            FsmAction::Terminate(TerminationReason::TimedOut(TransactionTimer::B))
        )));
    }

    #[test]
    fn unanswered_invite_emits_six_retransmits_before_timer_b() {
        // T1=500ms, Timer B = 32s. Timer A doubles uncapped, so fires land
        // at 0.5, 1.5, 3.5, 7.5, 15.5 and 31.5 seconds: six retransmits.
        let mut fsm = ClientInviteFsm::new(timers_udp());
        let send_actions = fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        assert_eq!(transmits(&send_actions), 1, "initial send is not a retransmit");

        let mut next_fire = Duration::from_millis(500);
        let timer_b = Duration::from_secs(32);
        let mut elapsed = Duration::ZERO;
        let mut retransmits = 0usize;

        loop {
            elapsed += next_fire;
            if elapsed >= timer_b {
                break;
            }
            let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::A));
            retransmits += transmits(&actions);
            next_fire = actions
                .iter()
                .find_map(|a| match a {
                    FsmAction::Schedule {
                        timer: TransactionTimer::A,
                        duration,
                    } => Some(*duration),
                    _ => None,
                })
                .expect("timer A rescheduled");
        }

        assert_eq!(retransmits, 6);
    }

    #[test]
    fn invite_keeps_retransmitting_after_provisional() {
        // State-exit policy: a provisional moves to Proceeding but leaves
        // Timer A running for the INVITE.
        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveProvisional(response(180)));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, FsmAction::Cancel(TransactionTimer::A))));

        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::A));
        assert_eq!(transmits(&actions), 1);
    }

    #[test]
    fn reliable_transport_schedules_no_retransmit_timer() {
        let mut fsm = ClientInviteFsm::new(TransactionTimers::new(true));
        let actions = fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        assert!(!actions.iter().any(|a| matches!(
            a,
            FsmAction::Schedule {
                timer: TransactionTimer::A,
                ..
            }
        )));
    }

    #[test]
    fn non_invite_happy_path() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(sample_options()));
        assert_eq!(transmits(&actions), 1);
        assert_eq!(fsm.state, ClientNonInviteState::Trying);

        let actions = fsm.on_event(ClientNonInviteEvent::ReceiveFinal(response(200)));
        assert_eq!(fsm.state, ClientNonInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(a, FsmAction::Deliver(_))));
        assert!(actions.iter().any(|a| matches!(
            a,
            FsmAction::Schedule {
                timer: TransactionTimer::K,
                ..
            }
        )));

        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::K));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, FsmAction::Terminate(TerminationReason::Completed))));
    }

    #[test]
    fn non_invite_provisional_parks_timer_e() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_options()));
        let actions = fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(response(100)));
        assert_eq!(fsm.state, ClientNonInviteState::Proceeding);
        assert!(actions
            .iter()
            .any(|a| matches!(a, FsmAction::Cancel(TransactionTimer::E))));

        // Once parked, a stale Timer E fire does nothing.
        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::E));
        assert!(actions.is_empty());
    }

    #[test]
    fn non_invite_timer_e_doubles_with_t2_cap() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_options()));

        let mut intervals = Vec::new();
        for _ in 0..5 {
            let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::E));
            let next = actions
                .iter()
                .find_map(|a| match a {
                    FsmAction::Schedule {
                        timer: TransactionTimer::E,
                        duration,
                    } => Some(*duration),
                    _ => None,
                })
                .expect("rescheduled");
            intervals.push(next);
        }
        assert_eq!(
            intervals,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn non_invite_timer_f_times_out() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_options()));
        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::F));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(
            a,
            FsmAction::Terminate(TerminationReason::TimedOut(TransactionTimer::F))
        )));
    }

    #[test]
    fn transport_error_terminates_both_machines() {
        let mut invite = ClientInviteFsm::new(timers_udp());
        invite.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = invite.on_event(ClientInviteEvent::TransportError);
        assert!(actions
            .iter()
            .any(|a| matches!(a, FsmAction::Terminate(TerminationReason::TransportError))));

        let mut non_invite = ClientNonInviteFsm::new(timers_udp());
        non_invite.on_event(ClientNonInviteEvent::SendRequest(sample_options()));
        let actions = non_invite.on_event(ClientNonInviteEvent::TransportError);
        assert!(actions
            .iter()
            .any(|a| matches!(a, FsmAction::Terminate(TerminationReason::TransportError))));
    }
}
