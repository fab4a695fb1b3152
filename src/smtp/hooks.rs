//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Mailslot.
//
// Mailslot is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailslot is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailslot. If not, see <http://www.gnu.org/licenses/>.

//! The bridge between the protocol machine and the embedding application.
//!
//! The embedder registers at most one handler per event. Notification hooks
//! are plain synchronous calls. Decision hooks return boxed futures; the
//! session awaits them before writing the reply and before reading any
//! further input, so for a given connection everything the embedder sees is
//! in protocol order.

use std::borrow::Cow;

use futures::future::BoxFuture;

use super::codes::*;
use super::envelope::Envelope;

/// An SMTP reply, excluding the continuation/final distinction.
#[derive(Clone, Debug)]
pub struct SmtpResponse<'a>(
    pub PrimaryCode,
    pub Option<(ClassCode, SubjectCode)>,
    pub Cow<'a, str>,
);

/// Why an embedder turned an operation down.
///
/// When `response` is set it is sent verbatim; otherwise the session builds
/// a context-appropriate default around `message`.
#[derive(Debug, Default)]
pub struct Rejection {
    pub response: Option<SmtpResponse<'static>>,
    pub message: String,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            response: None,
            message: message.into(),
        }
    }

    pub fn with_response(response: SmtpResponse<'static>) -> Self {
        Self {
            response: Some(response),
            message: String::new(),
        }
    }
}

/// Validates a MAIL or RCPT address. `Err` vetoes the address.
pub type ValidateAddressHook = dyn for<'a> Fn(&'a Envelope, &'a str) -> BoxFuture<'a, Result<(), Rejection>>
    + Send
    + Sync;

/// Checks credentials. `Ok(true)` authenticates the session; anything else
/// fails the exchange.
pub type AuthorizeUserHook = dyn for<'a> Fn(
        &'a Envelope,
        &'a str,
        &'a str,
    ) -> BoxFuture<'a, Result<bool, Rejection>>
    + Send
    + Sync;

/// Decides the fate of a completed message. `Ok(Some(id))` supplies the
/// queue ID; `Ok(None)` lets the server pick a random one.
pub type DataReadyHook = dyn for<'a> Fn(&'a Envelope) -> BoxFuture<'a, Result<Option<String>, Rejection>>
    + Send
    + Sync;

/// Notification carrying just the envelope.
pub type EnvelopeHook = dyn Fn(&Envelope) + Send + Sync;

/// One chunk of dot-unstuffed message body.
pub type DataHook = dyn Fn(&Envelope, &[u8]) + Send + Sync;

/// Notification that DNS validation rejected an address.
pub type AddressHook = dyn Fn(&str) + Send + Sync;

/// The full set of handler slots an embedder can fill.
///
/// Every slot is optional; an empty slot takes the fast path (accept, or
/// discard, as appropriate to the event).
#[derive(Default)]
pub struct Hooks {
    /// A MAIL sender is up for acceptance.
    pub validate_sender: Option<Box<ValidateAddressHook>>,
    /// A RCPT recipient is up for acceptance.
    pub validate_recipient: Option<Box<ValidateAddressHook>>,
    /// MX validation failed for a sender address.
    pub sender_validation_failed: Option<Box<AddressHook>>,
    /// MX validation failed for a recipient address.
    pub recipient_validation_failed: Option<Box<AddressHook>>,
    /// AUTH credentials need checking. With no handler registered, all
    /// authentication attempts fail.
    pub authorize_user: Option<Box<AuthorizeUserHook>>,
    /// The client was told to start sending the message body.
    pub start_data: Option<Box<EnvelopeHook>>,
    /// A chunk of message body arrived.
    pub data: Option<Box<DataHook>>,
    /// The body terminator arrived; decide acceptance and the queue ID.
    pub data_ready: Option<Box<DataReadyHook>>,
    /// The session ended, for whatever reason. Fired exactly once.
    pub close: Option<Box<EnvelopeHook>>,
}
