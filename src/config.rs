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

use std::path::PathBuf;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

/// The SASL mechanisms the server can offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Plain,
    Login,
    Xoauth2,
}

impl AuthMethod {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::Xoauth2 => "XOAUTH2",
        }
    }
}

/// TLS key material for STARTTLS or TLS-from-the-start operation.
#[derive(Clone)]
pub enum TlsCredentials {
    /// PEM files on disk.
    PemFiles {
        private_key: PathBuf,
        certificate_chain: PathBuf,
    },
    /// Key material already in memory.
    KeyPair {
        private_key: PKey<Private>,
        certificate: X509,
    },
}

/// Server behaviour switches.
///
/// The defaults give a plain, unauthenticated receiver with no TLS and DNS
/// validation of every MAIL/RCPT domain.
#[derive(Clone)]
pub struct ServerConfig {
    /// The name used in the greeting and status lines. Defaults to the OS
    /// hostname, falling back to `127.0.0.1`.
    pub name: Option<String>,
    /// Free text appended to the `220` greeting.
    pub banner: String,
    /// Log full command/reply traffic at debug level.
    pub debug: bool,
    /// Idle timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Perform the TLS handshake immediately on accept instead of waiting
    /// for STARTTLS. Requires `credentials`.
    pub secure_connection: bool,
    /// Refuse MAIL until the session has authenticated.
    pub require_authentication: bool,
    /// Permit AUTH.
    pub enable_authentication: bool,
    /// Advertise the SIZE extension with this limit and record `SIZE=`
    /// declarations. Enforcement is the embedder's business.
    pub max_size: Option<u64>,
    /// TLS key material. Without it STARTTLS is not offered.
    pub credentials: Option<TlsCredentials>,
    /// Which SASL mechanisms to offer.
    pub auth_methods: Vec<AuthMethod>,
    /// Reject EHLO, forcing clients down to HELO.
    pub disable_ehlo: bool,
    /// Allow AUTH on unprotected connections.
    pub ignore_tls: bool,
    /// Never offer or accept STARTTLS.
    pub disable_starttls: bool,
    /// Skip the MX lookup on MAIL/RCPT domains.
    pub disable_dns_validation: bool,
    /// Greet connections beyond this many concurrent clients with a 421 and
    /// drop them.
    pub max_clients: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: None,
            banner: concat!(
                env!("CARGO_PKG_NAME"),
                " ",
                env!("CARGO_PKG_VERSION"),
            )
            .to_owned(),
            debug: false,
            timeout_ms: 60_000,
            secure_connection: false,
            require_authentication: false,
            enable_authentication: false,
            max_size: None,
            credentials: None,
            auth_methods: vec![AuthMethod::Plain, AuthMethod::Login],
            disable_ehlo: false,
            ignore_tls: false,
            disable_starttls: false,
            disable_dns_validation: false,
            max_clients: None,
        }
    }
}
