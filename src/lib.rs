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

//! Mailslot is an embeddable SMTP/ESMTP server.
//!
//! It speaks RFC 5321 with the EHLO (RFC 1869), SIZE (RFC 1870), STARTTLS
//! (RFC 3207), and AUTH (RFC 4954; PLAIN, LOGIN, and XOAUTH2) extensions,
//! collects the envelope and opaque message body of each transaction, and
//! hands completed messages to the embedding application through a small
//! set of handler slots ([`Hooks`]).
//!
//! The embedder builds a [`ServerConfig`], fills in whichever [`Hooks`] it
//! cares about, and runs [`Server::listen`]. Each accepted connection gets
//! its own task; within a connection, commands, validation callbacks, and
//! replies are strictly sequential.

mod config;
mod server;
mod smtp;
mod support;

#[cfg(test)]
mod test_data;

pub use crate::config::{AuthMethod, ServerConfig, TlsCredentials};
pub use crate::server::Server;
pub use crate::smtp::codes;
pub use crate::smtp::envelope::{AuthState, Authentication, Envelope};
pub use crate::smtp::hooks::{
    AddressHook, AuthorizeUserHook, DataHook, DataReadyHook, EnvelopeHook,
    Hooks, Rejection, SmtpResponse, ValidateAddressHook,
};
pub use crate::support::error::Error;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().is_some_and(|v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}
