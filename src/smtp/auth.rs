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

//! The SASL dialogues riding on the AUTH command: PLAIN, LOGIN, and
//! XOAUTH2.
//!
//! The dialogues share [`AuthState`] as their only coordination point with
//! the command dispatcher. Entry is `cmd_auth`; while the state awaits a
//! line, the session routes raw input lines to `auth_continue`.
//!
//! Verification of whatever credentials a dialogue collects is delegated to
//! the embedder's `authorize_user` hook.

use std::borrow::Cow;
use std::mem;

use log::{error, info, warn};

use super::codes::*;
use super::envelope::AuthState;
use super::session::{ResponseKind::Final, Session};
use crate::config::AuthMethod;
use crate::support::error::Error;

/// Base64 of "Username:".
const USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
/// Base64 of "Password:".
const PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";
/// The canned XOAUTH2 error challenge, base64 of
/// `{"status":"401","schemes":"bearer mac","scope":"https://mail.google.com/"}`.
const XOAUTH2_FAILURE_CHALLENGE: &str =
    "eyJzdGF0dXMiOiI0MDEiLCJzY2hlbWVzIjoiYmVhcmVyIG1hYyIsInNjb3BlIjoiaHR0cHM6\
     Ly9tYWlsLmdvb2dsZS5jb20vIn0=";

impl Session {
    pub(super) async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if !self.config.enable_authentication
            && !self.config.require_authentication
        {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: authentication not enabled"),
                )
                .await;
        }

        if !self.io.get_ref().is_ssl() && !self.config.ignore_tls {
            warn!("{} Rejected attempt to AUTH without TLS", self.log_prefix);
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    Some((cc::PermFail, sc::OtherSecurity)),
                    Cow::Borrowed("Must issue a STARTTLS command first"),
                )
                .await;
        }

        if self.envelope.authentication.authenticated {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::OtherSecurity)),
                    Cow::Borrowed("No identity changes permitted"),
                )
                .await;
        }

        let method = self
            .config
            .auth_methods
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(&mechanism));
        let Some(method) = method else {
            warn!(
                "{} Rejected AUTH with unavailable mechanism {:?}",
                self.log_prefix, mechanism,
            );
            return self
                .send_response(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    Some((
                        cc::PermFail,
                        sc::AuthenticationCredentialsInvalid,
                    )),
                    Cow::Borrowed(
                        "Error: authentication failed: \
                         no mechanism available",
                    ),
                )
                .await;
        };

        match method {
            AuthMethod::Plain => match initial {
                // "=" is how a client spells an empty initial response.
                Some(data) if data != "=" => {
                    self.auth_plain_data(&data).await
                },
                _ => {
                    self.envelope.authentication.state =
                        AuthState::AwaitPlainData;
                    self.send_response(
                        Final,
                        pc::ServerChallenge,
                        None,
                        Cow::Borrowed(""),
                    )
                    .await
                },
            },

            AuthMethod::Login => match initial {
                Some(data) => self.auth_login_username(&data).await,
                None => {
                    self.envelope.authentication.state =
                        AuthState::AwaitLoginUsername;
                    self.send_response(
                        Final,
                        pc::ServerChallenge,
                        None,
                        Cow::Borrowed(USERNAME_CHALLENGE),
                    )
                    .await
                },
            },

            AuthMethod::Xoauth2 => match initial {
                Some(data) => self.auth_xoauth2_data(&data).await,
                None => {
                    self.envelope.authentication.state =
                        AuthState::AwaitXoauth2Data;
                    self.send_response(
                        Final,
                        pc::ServerChallenge,
                        None,
                        Cow::Borrowed(""),
                    )
                    .await
                },
            },
        }
    }

    /// Consumes one input line while a SASL exchange is in progress.
    pub(super) async fn auth_continue(
        &mut self,
        line: &str,
    ) -> Result<(), Error> {
        let state =
            mem::take(&mut self.envelope.authentication.state);

        if line == "*" {
            info!("{} SASL exchange aborted by client", self.log_prefix);
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::Undefined)),
                    Cow::Borrowed("Error: authentication aborted"),
                )
                .await;
        }

        match state {
            AuthState::AwaitPlainData => self.auth_plain_data(line).await,
            AuthState::AwaitLoginUsername => {
                self.auth_login_username(line).await
            },
            AuthState::AwaitLoginPassword { username } => {
                self.auth_login_password(username, line).await
            },
            AuthState::AwaitXoauth2Data => {
                self.auth_xoauth2_data(line).await
            },
            AuthState::AwaitXoauth2Ack => {
                self.send_response(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("Username and Password not accepted"),
                )
                .await
            },

            state @ (AuthState::Normal | AuthState::Authenticated) => {
                error!(
                    "{} [BUG] SASL continuation outside an exchange",
                    self.log_prefix,
                );
                self.envelope.authentication.state = state;
                self.send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Error: command not recognized"),
                )
                .await
            },
        }
    }

    /// Handles the base64 blob of a PLAIN exchange, whether it arrived as
    /// the initial response or on its own line.
    async fn auth_plain_data(&mut self, data: &str) -> Result<(), Error> {
        let Some(decoded) = decode_base64(data) else {
            return self.invalid_userdata().await;
        };

        // RFC 4616: authorise-id NUL authenticate-id NUL password, with
        // exactly three fields.
        let mut parts = decoded.split('\0');
        let (Some(authorise), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return self.invalid_userdata().await;
        };

        let username = if authenticate.is_empty() {
            authorise
        } else {
            authenticate
        };
        self.verify_credentials(
            username.to_owned(),
            password.to_owned(),
            AuthMethod::Plain,
        )
        .await
    }

    /// Handles the username line of a LOGIN exchange and asks for the
    /// password.
    async fn auth_login_username(&mut self, data: &str) -> Result<(), Error> {
        let Some(username) = decode_base64(data) else {
            return self.invalid_userdata().await;
        };

        self.envelope.authentication.state =
            AuthState::AwaitLoginPassword { username };
        self.send_response(
            Final,
            pc::ServerChallenge,
            None,
            Cow::Borrowed(PASSWORD_CHALLENGE),
        )
        .await
    }

    async fn auth_login_password(
        &mut self,
        username: String,
        data: &str,
    ) -> Result<(), Error> {
        let Some(password) = decode_base64(data) else {
            return self.invalid_userdata().await;
        };

        self.verify_credentials(username, password, AuthMethod::Login).await
    }

    /// Handles the single XOAUTH2 blob: `user=NAME^Aauth=Bearer TOKEN^A^A`,
    /// base64-encoded, with exactly four ^A-separated fields.
    async fn auth_xoauth2_data(&mut self, data: &str) -> Result<(), Error> {
        let Some(decoded) = decode_base64(data) else {
            return self.invalid_userdata().await;
        };

        let fields: Vec<&str> = decoded.split('\x01').collect();
        if fields.len() != 4 {
            return self.invalid_userdata().await;
        }

        let (Some(username), Some(token)) = (
            fields[0].get("user=".len()..),
            fields[1].split_whitespace().nth(1),
        ) else {
            return self.invalid_userdata().await;
        };

        self.verify_credentials(
            username.to_owned(),
            token.to_owned(),
            AuthMethod::Xoauth2,
        )
        .await
    }

    /// Submits collected credentials to the embedder and finishes the
    /// exchange either way.
    async fn verify_credentials(
        &mut self,
        username: String,
        secret: String,
        method: AuthMethod,
    ) -> Result<(), Error> {
        let authorized = match self.hooks.authorize_user {
            Some(ref authorize_user) => {
                authorize_user(&self.envelope, &username, &secret)
                    .await
                    .unwrap_or(false)
            },
            None => {
                warn!(
                    "{} AUTH attempted but no authorize_user handler \
                     is registered",
                    self.log_prefix,
                );
                false
            },
        };

        if authorized {
            self.log_prefix.set_user(username.clone());
            info!("{} Authentication successful", self.log_prefix);

            let authentication = &mut self.envelope.authentication;
            authentication.username = Some(username);
            authentication.authenticated = true;
            authentication.state = AuthState::Authenticated;

            self.send_response(
                Final,
                pc::AuthenticationSucceeded,
                Some((cc::Success, sc::OtherSecurity)),
                Cow::Borrowed("Authentication successful"),
            )
            .await
        } else {
            warn!(
                "{} Authentication failed for {:?}",
                self.log_prefix, username,
            );

            let authentication = &mut self.envelope.authentication;
            authentication.username = None;
            authentication.authenticated = false;
            authentication.state = AuthState::Normal;

            if AuthMethod::Xoauth2 == method {
                // XOAUTH2 reports failure as a challenge carrying a canned
                // error document; the definitive rejection goes out when the
                // client answers it (normally with an empty line).
                self.envelope.authentication.state =
                    AuthState::AwaitXoauth2Ack;
                self.send_response(
                    Final,
                    pc::ServerChallenge,
                    None,
                    Cow::Borrowed(XOAUTH2_FAILURE_CHALLENGE),
                )
                .await
            } else {
                self.send_response(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    Some((
                        cc::PermFail,
                        sc::AuthenticationCredentialsInvalid,
                    )),
                    Cow::Borrowed(
                        "Error: authentication failed: generic failure",
                    ),
                )
                .await
            }
        }
    }

    async fn invalid_userdata(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::CommandSyntaxError,
            Some((cc::PermFail, sc::SyntaxError)),
            Cow::Borrowed("Error: invalid userdata to decode"),
        )
        .await
    }
}

fn decode_base64(data: &str) -> Option<String> {
    base64::decode(data)
        .ok()
        .and_then(|decoded| String::from_utf8(decoded).ok())
}
