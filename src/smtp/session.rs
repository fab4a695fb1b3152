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

//! The per-connection protocol machine: greeting, command dispatch, envelope
//! assembly, the DATA transfer, and the STARTTLS upgrade.
//!
//! Command processing is strictly sequential. Decision hooks are awaited
//! in place, so no further input is dispatched until the embedder has
//! answered and the reply has been written.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::str;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use openssl::ssl::SslAcceptor;
use rand::Rng;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream,
};
use tokio::sync::mpsc;

use super::codes::*;
use super::data::read_body;
use super::envelope::{Authentication, Envelope};
use super::hooks::{Hooks, SmtpResponse};
use super::syntax::{self, Command, ReversePath};
use super::validate::{validate_address, AddressKind};
use crate::config::ServerConfig;
use crate::support::{
    async_io::ServerIo, dns, error::Error, log_prefix::LogPrefix,
};

/// Longest accepted command line, excluding the line ending.
const MAX_LINE: usize = 512;
/// How many commands that make no transaction progress are tolerated before
/// the connection is dropped.
const MAX_INEFFECTIVE_COMMANDS: u32 = 30;
/// How long a DATA transfer may take as a whole.
const DATA_DEADLINE: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, last: bool) -> Self {
        if last {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

/// Everything a session needs from the server that accepted it.
pub(crate) struct SessionSetup {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) ssl_acceptor: Option<Arc<SslAcceptor>>,
    pub(crate) resolver: Option<Arc<dns::Resolver>>,
    pub(crate) local_host_name: String,
    pub(crate) peer: IpAddr,
}

pub(crate) struct Session {
    pub(super) io: BufStream<ServerIo>,
    pub(super) log_prefix: LogPrefix,
    pub(super) config: Arc<ServerConfig>,
    pub(super) hooks: Arc<Hooks>,
    pub(super) ssl_acceptor: Option<Arc<SslAcceptor>>,
    pub(super) resolver: Option<Arc<dns::Resolver>>,
    pub(super) local_host_name: String,

    pub(super) envelope: Envelope,
    pub(super) helo_seen: bool,
    ineffective_commands: u32,
    deadline_tx: mpsc::Sender<Instant>,
    timeout: Duration,
    quit: bool,
}

/// Runs one connection to completion.
///
/// The `close` hook fires exactly once on the way out, whatever the reason
/// for the session ending.
pub(crate) async fn run(io: ServerIo, setup: SessionSetup) -> Result<(), Error> {
    let log_prefix = LogPrefix::new(format!("smtp:{}", setup.peer));
    let timeout = Duration::from_millis(setup.config.timeout_ms);

    if setup.config.secure_connection {
        let Some(ref acceptor) = setup.ssl_acceptor else {
            return Err(Error::MissingTlsCredentials);
        };

        match tokio::time::timeout(timeout, io.ssl_accept(acceptor)).await {
            Ok(Ok(())) => info!(
                "{} TLS handshake succeeded ({})",
                log_prefix,
                io.ssl_string().unwrap_or_default(),
            ),
            Ok(Err(e)) => {
                warn!("{} TLS handshake failed: {}", log_prefix, e);
                return Err(e);
            },
            Err(_elapsed) => {
                warn!("{} TLS handshake timed out", log_prefix);
                return Err(Error::IdleTimeout);
            },
        }
    }

    let mut raw_io = io.clone();
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut session = Session {
        io: BufStream::new(io),
        log_prefix: log_prefix.clone(),
        envelope: Envelope::new(setup.peer),
        config: setup.config,
        hooks: setup.hooks,
        ssl_acceptor: setup.ssl_acceptor,
        resolver: setup.resolver,
        local_host_name: setup.local_host_name,

        helo_seen: false,
        ineffective_commands: 0,
        deadline_tx,
        timeout,
        quit: false,
    };

    let result = tokio::select! {
        r = session.run() => r,
        _ = idle_timer(deadline_rx, timeout) => Err(Error::IdleTimeout),
    };

    if matches!(result, Err(Error::IdleTimeout)) {
        warn!("{} Connection idle time expired", log_prefix);
        let line = format!(
            "421 4.4.2 {} Error: timeout exceeded\r\n",
            session.local_host_name,
        );
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            raw_io.write_all(line.as_bytes()),
        )
        .await;
    }

    if let Some(ref close) = session.hooks.close {
        close(&session.envelope);
    }

    result
}

impl Session {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + self.timeout)
            .await;
        buffer.clear();

        (&mut self.io)
            .take((MAX_LINE + 2) as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE + 2 {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Error: command line too long"),
                )
                .await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take((MAX_LINE + 2) as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let command_line = &buffer[..buffer.len() - line_ending_len];

        if command_line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let command_line = match str::from_utf8(command_line) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                return self
                    .send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::SyntaxError)),
                        Cow::Borrowed("Error: malformed UTF-8"),
                    )
                    .await;
            },
        };

        if self.config.debug {
            debug!("{} << {:?}", self.log_prefix, command_line);
        }

        // Lines inside a SASL exchange belong to the authentication
        // sub-machine, not the command parser.
        if self.envelope.authentication.state.awaits_line() {
            return self.auth_continue(command_line).await;
        }

        if command_line.is_empty() {
            return Ok(());
        }

        self.ineffective_commands += 1;
        if self.ineffective_commands > MAX_INEFFECTIVE_COMMANDS {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::ServiceClosing,
                    None,
                    Cow::Borrowed(
                        "Too many commands issued without sending mail",
                    ),
                )
                .await;
        }

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(()) => {
                let mut debug_line = command_line;
                if let Some((truncate_len, _)) =
                    debug_line.char_indices().nth(64)
                {
                    debug_line = &debug_line[..truncate_len];
                }
                warn!(
                    "{} Received bad command {debug_line:?}",
                    self.log_prefix,
                );

                return self
                    .send_response(
                        Final,
                        pc::CommandNotImplemented,
                        Some((cc::PermFail, sc::SyntaxError)),
                        Cow::Borrowed("Error: command not recognized"),
                    )
                    .await;
            },
        };

        match command {
            Command::Helo(host) => self.cmd_helo(host).await,
            Command::Ehlo(host) => self.cmd_ehlo(host).await,
            Command::Auth(mechanism, initial) => {
                self.cmd_auth(mechanism, initial).await
            },
            Command::Mail(args) => self.cmd_mail(args).await,
            Command::Recipient(args) => self.cmd_recipient(args).await,
            Command::Data => self.cmd_data().await,
            Command::Reset => self.cmd_reset().await,
            Command::Verify => self.cmd_verify().await,
            Command::Noop => self.cmd_noop().await,
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
        }
    }

    async fn cmd_helo(&mut self, host: String) -> Result<(), Error> {
        if host.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    None,
                    Cow::Borrowed("Syntax: HELO hostname"),
                )
                .await;
        }

        self.register_helo(host, "HELO");
        self.send_response(
            Final,
            pc::Ok,
            None,
            Cow::Owned(self.service_greeting()),
        )
        .await
    }

    async fn cmd_ehlo(&mut self, host: String) -> Result<(), Error> {
        if self.config.disable_ehlo {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Error: command not recognized"),
                )
                .await;
        }

        if host.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    None,
                    Cow::Borrowed("Syntax: EHLO hostname"),
                )
                .await;
        }

        self.register_helo(host, "EHLO");

        let mut capabilities: Vec<Cow<'static, str>> = vec![
            Cow::Borrowed("8BITMIME"),
            Cow::Borrowed("ENHANCEDSTATUSCODES"),
        ];
        if let Some(max_size) = self.config.max_size {
            capabilities.push(Cow::Owned(format!("SIZE {}", max_size)));
        }
        let auth_enabled = self.config.enable_authentication
            || self.config.require_authentication;
        if auth_enabled
            && (self.io.get_ref().is_ssl() || self.config.ignore_tls)
            && !self.config.auth_methods.is_empty()
        {
            let methods: Vec<&str> = self
                .config
                .auth_methods
                .iter()
                .map(|m| m.as_str())
                .collect();
            capabilities.push(Cow::Owned(format!("AUTH {}", methods.join(" "))));
        }
        if !self.io.get_ref().is_ssl()
            && !self.config.disable_starttls
            && self.ssl_acceptor.is_some()
        {
            capabilities.push(Cow::Borrowed("STARTTLS"));
        }

        self.send_response(
            Delayable,
            pc::Ok,
            None,
            Cow::Owned(self.service_greeting()),
        )
        .await?;
        let last = capabilities.len() - 1;
        for (ix, capability) in capabilities.into_iter().enumerate() {
            self.send_response(
                Delayable.or_final(ix == last),
                pc::Ok,
                None,
                capability,
            )
            .await?;
        }

        Ok(())
    }

    fn register_helo(&mut self, host: String, command: &str) {
        self.log_prefix.set_helo(host.clone());
        info!("{} SMTP {}", self.log_prefix, command);
        self.helo_seen = true;
        self.envelope.host = host;
    }

    fn service_greeting(&self) -> String {
        format!(
            "{} at your service, [{}]",
            self.local_host_name, self.envelope.remote_address,
        )
    }

    async fn cmd_mail(&mut self, args: String) -> Result<(), Error> {
        if !self.helo_seen {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: send HELO/EHLO first"),
                )
                .await;
        }

        if self.envelope.from.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: nested MAIL command"),
                )
                .await;
        }

        if self.config.require_authentication
            && !self.envelope.authentication.authenticated
        {
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Authentication Required"),
                )
                .await;
        }

        let Some((return_path, declared_size)) =
            syntax::parse_mail_from(&args)
        else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((
                        cc::PermFail,
                        sc::BadSenderMailboxAddressSyntax,
                    )),
                    Cow::Borrowed("Bad sender address syntax"),
                )
                .await;
        };

        let from = match return_path {
            // The null return path has no domain to check and nothing for
            // the embedder to veto.
            ReversePath::Null => String::new(),
            ReversePath::Mailbox(address) => {
                let email = address.to_string();
                let verdict = validate_address(
                    AddressKind::Sender,
                    &email,
                    &address.domain,
                    &self.envelope,
                    &self.config,
                    &self.hooks,
                    self.resolver.as_deref(),
                )
                .await;
                if let Err(response) = verdict {
                    return self.send_reply(Final, &response).await;
                }

                email
            },
        };

        info!(
            "{} Start mail transaction from <{}>",
            self.log_prefix, from,
        );
        self.ineffective_commands = 0;
        if self.config.max_size.is_some() {
            self.envelope.declared_size = declared_size;
        }
        self.envelope.from = Some(from);
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::OtherAddressStatus)),
            Cow::Borrowed("Ok"),
        )
        .await
    }

    async fn cmd_recipient(&mut self, args: String) -> Result<(), Error> {
        if self.envelope.from.is_none() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: need MAIL command"),
                )
                .await;
        }

        let Some(address) = syntax::parse_rcpt_to(&args) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((
                        cc::PermFail,
                        sc::BadDestinationMailboxAddressSyntax,
                    )),
                    Cow::Borrowed("Bad recipient address syntax"),
                )
                .await;
        };

        let email = address.to_string();
        let verdict = validate_address(
            AddressKind::Recipient,
            &email,
            &address.domain,
            &self.envelope,
            &self.config,
            &self.hooks,
            self.resolver.as_deref(),
        )
        .await;
        if let Err(response) = verdict {
            return self.send_reply(Final, &response).await;
        }

        self.ineffective_commands = 0;
        self.envelope.add_recipient(email);
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::OtherAddressStatus)),
            Cow::Borrowed("Ok"),
        )
        .await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        if self.envelope.to.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: need RCPT command"),
                )
                .await;
        }

        if let Some(ref start_data) = self.hooks.start_data {
            start_data(&self.envelope);
        }

        self.ineffective_commands = 0;
        self.send_response(
            Final,
            pc::StartMailInput,
            None,
            Cow::Borrowed("End data with <CR><LF>.<CR><LF>"),
        )
        .await?;

        info!("{} Begin data transfer", self.log_prefix);
        let _ = self
            .deadline_tx
            .send(Instant::now() + DATA_DEADLINE)
            .await;

        {
            let io = &mut self.io;
            let envelope = &self.envelope;
            let hooks = &self.hooks;
            read_body(Pin::new(io), |chunk| {
                if let Some(ref data) = hooks.data {
                    data(envelope, chunk);
                }
            })
            .await?;
        }

        info!("{} Data transfer complete", self.log_prefix);

        let completion = match self.hooks.data_ready {
            Some(ref data_ready) => data_ready(&self.envelope).await,
            None => Ok(None),
        };

        self.envelope.reset_transaction();

        match completion {
            Ok(queue_id) => {
                let queue_id = queue_id.unwrap_or_else(random_queue_id);
                info!(
                    "{} Message accepted, queued as {}",
                    self.log_prefix, queue_id,
                );
                self.send_response(
                    Final,
                    pc::Ok,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Owned(format!("Ok: queued as {}", queue_id)),
                )
                .await
            },

            Err(rejection) => {
                warn!(
                    "{} Message rejected: {}",
                    self.log_prefix, rejection.message,
                );
                match rejection.response {
                    Some(response) => self.send_reply(Final, &response).await,
                    None => {
                        let message = if rejection.message.is_empty() {
                            "FAILED".to_owned()
                        } else {
                            rejection.message
                        };
                        self.send_response(
                            Final,
                            pc::ActionNotTakenPermanent,
                            None,
                            Cow::Owned(message),
                        )
                        .await
                    },
                }
            },
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        self.envelope.reset_transaction();
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("Ok"),
        )
        .await
    }

    async fn cmd_verify(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::CannotVerify,
            Some((cc::Success, sc::DestinationAddressValid)),
            Cow::Borrowed("Send some mail, I'll try my best"),
        )
        .await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_response(Final, pc::Ok, None, Cow::Borrowed("OK")).await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_response(
                Final,
                pc::ServiceClosing,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("Goodbye!"),
            )
            .await;
        Ok(())
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        if self.io.get_ref().is_ssl() {
            return self
                .send_response(
                    Final,
                    pc::TransactionFailed,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: TLS already active"),
                )
                .await;
        }

        if self.config.disable_starttls {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Error: command not recognized"),
                )
                .await;
        }

        let Some(acceptor) = self.ssl_acceptor.take() else {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Error: command not recognized"),
                )
                .await;
        };

        self.send_response(
            Final,
            pc::ServiceReady,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("Ready to start TLS"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);
        self.io.get_mut().ssl_accept(&acceptor).await?;
        info!(
            "{} TLS handshake completed ({})",
            self.log_prefix,
            self.io.get_ref().ssl_string().unwrap_or_default(),
        );

        // RFC 3207 requires the command state to be discarded wholesale: the
        // client must introduce itself again, and nothing learned over
        // cleartext carries into the protected channel.
        self.helo_seen = false;
        self.envelope.reset_transaction();
        self.envelope.host.clear();
        self.envelope.authentication = Authentication::default();

        Ok(())
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ServiceReady,
            None,
            Cow::Owned(format!(
                "{} ESMTP {}",
                self.local_host_name, self.config.banner,
            )),
        )
        .await
    }

    pub(super) async fn send_reply(
        &mut self,
        kind: ResponseKind,
        response: &SmtpResponse<'_>,
    ) -> Result<(), Error> {
        self.send_response(kind, response.0, response.1, response.2.clone())
            .await
    }

    pub(super) async fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        secondary_code: Option<(ClassCode, SubjectCode)>,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        if primary_code == pc::ServiceClosing
            || primary_code == pc::ServiceNotAvailableClosing
        {
            self.quit = true;
        }

        let mut s = String::new();
        let _ = write!(s, "{}{}", primary_code as u16, kind.indicator());
        if let Some((class, subject)) = secondary_code {
            let subject = subject as u16;
            let split = if subject >= 100 { 100 } else { 10 };

            let _ = write!(
                s,
                "{}.{}.{} ",
                class as u8,
                subject / split,
                subject % split
            );
        }

        let _ = write!(s, "{}\r\n", quip);

        if self.config.debug {
            debug!("{} >> {:?}", self.log_prefix, s.trim_end());
        }

        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

fn random_queue_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill(&mut bytes[..]);

    let mut id = String::with_capacity(2 * bytes.len());
    for byte in bytes {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>, timeout: Duration) {
    let mut deadline = Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv()).await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}
