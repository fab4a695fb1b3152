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

//! The server facade: socket lifecycle, per-connection admission, and the
//! shared read-only state handed to each session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use log::{info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;

use crate::config::{ServerConfig, TlsCredentials};
use crate::smtp::hooks::Hooks;
use crate::smtp::session::{self, SessionSetup};
use crate::support::{async_io::ServerIo, dns, error::Error};

/// An embeddable SMTP server.
///
/// Constructed once from a [`ServerConfig`] and a set of [`Hooks`], then
/// driven with [`Server::listen`] or [`Server::serve`]. All state shared
/// between connections is read-only except the client counter.
pub struct Server {
    config: Arc<ServerConfig>,
    hooks: Arc<Hooks>,
    local_host_name: String,
    ssl_acceptor: Option<Arc<SslAcceptor>>,
    resolver: Option<Arc<dns::Resolver>>,
    connected_clients: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(config: ServerConfig, hooks: Hooks) -> Result<Self, Error> {
        let local_host_name =
            config.name.clone().unwrap_or_else(default_host_name);

        let ssl_acceptor = match config.credentials {
            Some(ref credentials) => {
                Some(Arc::new(build_ssl_acceptor(credentials)?))
            },
            None => None,
        };
        if config.secure_connection && ssl_acceptor.is_none() {
            return Err(Error::MissingTlsCredentials);
        }

        let resolver = if config.disable_dns_validation {
            None
        } else {
            Some(Arc::new(dns::system_resolver()?))
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            hooks: Arc::new(hooks),
            local_host_name,
            ssl_acceptor,
            resolver,
            connected_clients: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Binds `addr` and serves until [`Server::close`] is called.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from an already-bound listener until
    /// [`Server::close`] is called.
    ///
    /// Sessions in progress when the listener shuts down run to completion
    /// on their own tasks.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        info!(
            "{} Accepting SMTP connections on {}",
            self.local_host_name,
            listener.local_addr()?,
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    },
                },
            };

            self.accept_connection(stream, peer);
        }

        info!(
            "{} No longer accepting connections; \
             existing sessions continue",
            self.local_host_name,
        );
        Ok(())
    }

    /// Stops every [`Server::serve`] call on this server. Idempotent.
    ///
    /// Existing sessions are unaffected.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// How many client sessions are currently open.
    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(SeqCst)
    }

    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        info!("smtp:{} Connection established", peer);
        let _ = stream.set_nodelay(true);

        let guard = ClientGuard::register(Arc::clone(&self.connected_clients));
        if self
            .config
            .max_clients
            .is_some_and(|max_clients| guard.count > max_clients)
        {
            warn!("smtp:{} Rejected: too many connections", peer);
            let line = format!(
                "421 4.3.2 {} Too many connections\r\n",
                self.local_host_name,
            );
            tokio::spawn(async move {
                let _guard = guard;
                let mut stream = stream;
                let _ = stream.write_all(line.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
            return;
        }

        let setup = SessionSetup {
            config: Arc::clone(&self.config),
            hooks: Arc::clone(&self.hooks),
            ssl_acceptor: self.ssl_acceptor.clone(),
            resolver: self.resolver.clone(),
            local_host_name: self.local_host_name.clone(),
            peer: peer.ip(),
        };

        tokio::spawn(async move {
            let _guard = guard;

            let stream = match stream.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("smtp:{} Failed to detach socket: {}", peer, e);
                    return;
                },
            };
            let io = match ServerIo::new_owned_socket(stream) {
                Ok(io) => io,
                Err(e) => {
                    warn!("smtp:{} Failed to set up socket: {}", peer, e);
                    return;
                },
            };

            match session::run(io, setup).await {
                Ok(()) => info!("smtp:{} Normal client disconnect", peer),
                Err(e) => {
                    warn!("smtp:{} Abnormal client disconnect: {}", peer, e)
                },
            }
        });
    }
}

/// Keeps the shared client count accurate however a connection ends.
struct ClientGuard {
    counter: Arc<AtomicUsize>,
    count: usize,
}

impl ClientGuard {
    fn register(counter: Arc<AtomicUsize>) -> Self {
        let count = counter.fetch_add(1, SeqCst) + 1;
        Self { counter, count }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, SeqCst);
    }
}

pub(crate) fn build_ssl_acceptor(
    credentials: &TlsCredentials,
) -> Result<SslAcceptor, Error> {
    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    match *credentials {
        TlsCredentials::PemFiles {
            ref private_key,
            ref certificate_chain,
        } => {
            acceptor.set_private_key_file(private_key, SslFiletype::PEM)?;
            acceptor.set_certificate_chain_file(certificate_chain)?;
        },

        TlsCredentials::KeyPair {
            ref private_key,
            ref certificate,
        } => {
            acceptor.set_private_key(private_key)?;
            acceptor.set_certificate(certificate)?;
        },
    }

    acceptor.check_private_key()?;
    Ok(acceptor.build())
}

fn default_host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|host_name| host_name.into_string().ok())
        .filter(|host_name| !host_name.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_owned())
}
