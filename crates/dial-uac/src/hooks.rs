// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event pipeline: a fixed vtable of optional user callbacks.
//!
//! Hooks run synchronously on the calling task. A request hook may mutate
//! the traversing message, substitute it, or return `None` to cancel the
//! send; response hooks may substitute the response. A hook error abandons
//! the operation with `HookFailure` and leaves every table unchanged.

use std::net::SocketAddr;
use std::time::Instant;

use dial_core::{Request, Response};
use dial_dialog::DialogId;
use dial_transaction::TransactionKey;

/// Error raised by a user hook.
#[derive(Debug, Clone)]
pub struct HookError {
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HookError {}

/// Context handed to every hook invocation. Borrows point at the engine's
/// state for the duration of the call only.
pub struct HookContext<'a> {
    /// Key of the transaction carrying the message, once one exists.
    pub transaction: Option<&'a TransactionKey>,
    /// Dialog the message belongs to, when established.
    pub dialog: Option<&'a DialogId>,
    /// Destination peer of the request.
    pub destination: SocketAddr,
    /// Source peer for responses.
    pub source: Option<SocketAddr>,
    /// When the surrounding operation started.
    pub started_at: Instant,
}

/// Outcome of the pre-send hook.
pub type RequestHookResult = Result<Option<Request>, HookError>;

pub type RequestHook = Box<dyn Fn(Request, &HookContext<'_>) -> RequestHookResult + Send + Sync>;
pub type ResponseHook = Box<dyn Fn(Response, &HookContext<'_>) -> Result<Response, HookError> + Send + Sync>;

/// The fixed set of observation points.
#[derive(Default)]
pub struct Hooks {
    /// Before transaction creation; may cancel the send.
    pub on_request: Option<RequestHook>,
    /// After transaction delivery, for every response.
    pub on_response: Option<ResponseHook>,
    /// Before the auth controller examines a 401/407.
    pub on_auth_challenge: Option<ResponseHook>,
    pub on_provisional: Option<ResponseHook>,
    pub on_success: Option<ResponseHook>,
    pub on_redirect: Option<ResponseHook>,
    pub on_client_error: Option<ResponseHook>,
    pub on_server_error: Option<ResponseHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the pre-send hook. `Ok(None)` means the user cancelled.
    pub(crate) fn run_request(
        &self,
        request: Request,
        ctx: &HookContext<'_>,
    ) -> Result<Option<Request>, (&'static str, HookError)> {
        match &self.on_request {
            Some(hook) => hook(request, ctx).map_err(|e| ("on_request", e)),
            None => Ok(Some(request)),
        }
    }

    /// Runs `on_response` followed by the status-class hook.
    pub(crate) fn run_response(
        &self,
        response: Response,
        ctx: &HookContext<'_>,
    ) -> Result<Response, (&'static str, HookError)> {
        let mut response = match &self.on_response {
            Some(hook) => hook(response, ctx).map_err(|e| ("on_response", e))?,
            None => response,
        };

        let (name, class_hook) = match response.code() {
            100..=199 => ("on_provisional", &self.on_provisional),
            200..=299 => ("on_success", &self.on_success),
            300..=399 => ("on_redirect", &self.on_redirect),
            400..=499 => ("on_client_error", &self.on_client_error),
            _ => ("on_server_error", &self.on_server_error),
        };
        if let Some(hook) = class_hook {
            response = hook(response, ctx).map_err(|e| (name, e))?;
        }
        Ok(response)
    }

    /// Runs the auth-challenge hook for a 401/407 final.
    pub(crate) fn run_auth_challenge(
        &self,
        response: Response,
        ctx: &HookContext<'_>,
    ) -> Result<Response, (&'static str, HookError)> {
        match &self.on_auth_challenge {
            Some(hook) => hook(response, ctx).map_err(|e| ("on_auth_challenge", e)),
            None => Ok(response),
        }
    }
}
