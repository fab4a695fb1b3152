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

use std::net::IpAddr;

use chrono::prelude::*;

/// The sender, recipients, and metadata of one SMTP transaction, distinct
/// from the message body.
///
/// An envelope is created when the connection opens and mutated by MAIL and
/// RCPT. RSET and the completion of DATA reset the transaction fields but
/// keep the authentication record; a STARTTLS upgrade resets everything.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// The return path. `None` before MAIL; `Some("")` for the null return
    /// path `<>` used by bounces.
    pub from: Option<String>,
    /// Accepted recipients, in order of acceptance, deduplicated. The domain
    /// part is stored lower-case; the local part is verbatim.
    pub to: Vec<String>,
    /// The hostname the client declared in HELO/EHLO. Empty until then.
    pub host: String,
    /// The peer IP.
    pub remote_address: IpAddr,
    /// The `SIZE=` the client declared on MAIL, when the SIZE extension is
    /// configured. Recorded, never enforced here.
    pub declared_size: Option<u64>,
    /// When this envelope was created or last reset.
    pub date: DateTime<Utc>,
    /// The session's authentication record.
    pub authentication: Authentication,
}

impl Envelope {
    pub(crate) fn new(remote_address: IpAddr) -> Self {
        Self {
            from: None,
            to: Vec::new(),
            host: String::new(),
            remote_address,
            declared_size: None,
            date: Utc::now(),
            authentication: Authentication::default(),
        }
    }

    /// Clears the per-transaction state, keeping the HELO host and the
    /// authentication record.
    pub(crate) fn reset_transaction(&mut self) {
        self.from = None;
        self.to.clear();
        self.declared_size = None;
        self.date = Utc::now();
    }

    /// Appends a recipient unless an identical one is already present.
    ///
    /// Addresses are stored with the domain already lower-cased, so the
    /// required domain-case-insensitive dedup is plain equality here.
    pub(crate) fn add_recipient(&mut self, address: String) {
        if !self.to.iter().any(|existing| *existing == address) {
            self.to.push(address);
        }
    }
}

/// The session-scoped authentication record.
///
/// `authenticated` is true exactly when `state` is
/// [`AuthState::Authenticated`].
#[derive(Clone, Debug, Default)]
pub struct Authentication {
    /// The authenticated username. Only set after a successful exchange.
    pub username: Option<String>,
    pub authenticated: bool,
    pub state: AuthState,
}

/// Where the SASL dialogue currently stands.
///
/// This single field coordinates the main command dispatcher and the
/// authentication sub-machine: whenever the state awaits a line, raw command
/// lines are routed to the sub-machine instead of the command parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Normal,
    /// `AUTH PLAIN` was issued without an initial response; the next line
    /// carries the base64 blob.
    AwaitPlainData,
    /// `AUTH LOGIN` was issued; the next line is the base64 username.
    AwaitLoginUsername,
    /// The LOGIN username arrived; the next line is the base64 password.
    AwaitLoginPassword { username: String },
    /// `AUTH XOAUTH2` was issued without an initial response.
    AwaitXoauth2Data,
    /// XOAUTH2 verification failed and the error challenge was sent; the
    /// client's next line (normally empty) triggers the definitive reply.
    AwaitXoauth2Ack,
    Authenticated,
}

impl AuthState {
    /// Whether the next input line belongs to the SASL dialogue rather than
    /// the command stream.
    pub(crate) fn awaits_line(&self) -> bool {
        !matches!(self, AuthState::Normal | AuthState::Authenticated)
    }
}
