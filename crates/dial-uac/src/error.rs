// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use dial_parse::ParseError;
use dial_transaction::{TransactionKey, TransactionTimer};
use dial_transport::TransportError;
use smol_str::SmolStr;

/// Facade-level failures. Every variant is caller-discriminable; lower
/// layers never swallow errors on the way up.
#[derive(Debug)]
pub enum ClientError {
    /// The codec gave up on an inbound or outbound message.
    MalformedMessage { kind: ParseError },
    /// Bind/connect/send/recv failed.
    Transport(TransportError),
    /// Timer B or F elapsed before a final response.
    TransactionTimedOut {
        txn_id: TransactionKey,
        timer: TransactionTimer,
    },
    /// Challenge rejected, credentials missing, or the retry was refused.
    AuthFailed { reason: String },
    /// An in-dialog request named a dialog this client does not hold.
    NoDialog { call_id: SmolStr },
    /// Caller-visible contract violation.
    BadArgument { field: &'static str },
    /// A user hook failed; the request was abandoned with tables untouched.
    HookFailure { hook: &'static str, cause: String },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::MalformedMessage { kind } => write!(f, "malformed message: {}", kind),
            ClientError::Transport(e) => write!(f, "transport error: {}", e),
            ClientError::TransactionTimedOut { txn_id, timer } => {
                write!(f, "transaction {} timed out (timer {})", txn_id, timer.as_str())
            }
            ClientError::AuthFailed { reason } => write!(f, "authentication failed: {}", reason),
            ClientError::NoDialog { call_id } => write!(f, "no dialog for call {}", call_id),
            ClientError::BadArgument { field } => write!(f, "bad argument: {}", field),
            ClientError::HookFailure { hook, cause } => {
                write!(f, "hook {} failed: {}", hook, cause)
            }
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Transport(e) => Some(e),
            ClientError::MalformedMessage { kind } => Some(kind),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        ClientError::Transport(value)
    }
}

impl From<ParseError> for ClientError {
    fn from(kind: ParseError) -> Self {
        ClientError::MalformedMessage { kind }
    }
}
