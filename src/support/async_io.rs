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

use std::any::Any;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task;

use openssl::ssl::{SslAcceptor, SslStream};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::Error;

/// The main type for doing async I/O on one server connection.
///
/// This fulfils two roles:
/// - Supporting switching from cleartext to TLS mid-stream, as required by
///   STARTTLS, without re-framing or copying buffered socket data.
/// - Allowing an out-of-band writer (the idle-timeout path) to share the
///   connection with the session that owns the buffered stream.
///
/// Clones of `ServerIo` track the same underlying state.
#[derive(Clone)]
pub struct ServerIo {
    socket: Arc<Socket>,
    mode: Arc<Mutex<Mode>>,
    _owned: Arc<dyn Any + Send + Sync>,
}

impl ServerIo {
    /// Sets up a `ServerIo` which runs over the given socket.
    ///
    /// The `ServerIo` owns the socket; it is closed when the last clone is
    /// dropped. The socket is put into non-blocking mode.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        let fd = sock.as_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let socket = Arc::new(Socket {
            fd: AsyncFd::with_interest(
                fd,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )?,
        });

        Ok(Self {
            socket: Arc::clone(&socket),
            mode: Arc::new(Mutex::new(Mode::Cleartext(SocketRw(socket)))),
            _owned: Arc::new(sock),
        })
    }

    pub fn is_ssl(&self) -> bool {
        matches!(*self.mode.lock().unwrap(), Mode::Ssl(_))
    }

    /// Describes the negotiated TLS session, if there is one.
    pub fn ssl_string(&self) -> Option<String> {
        match *self.mode.lock().unwrap() {
            Mode::Cleartext(..) => None,
            Mode::Ssl(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{tls_version}:{cipher}:{strength}",
                    tls_version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    strength = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs server-side TLS setup with the given acceptor.
    ///
    /// The caller must not read or write through any clone of this handle
    /// until the handshake completes.
    pub async fn ssl_accept(&self, acceptor: &SslAcceptor) -> Result<(), Error> {
        let result = acceptor.accept(SocketRw(Arc::clone(&self.socket)));
        let stream = self.complete_ssl_handshake(result).await?;
        *self.mode.lock().unwrap() = Mode::Ssl(stream);
        Ok(())
    }

    async fn complete_ssl_handshake(
        &self,
        mut result: Result<
            SslStream<SocketRw>,
            openssl::ssl::HandshakeError<SocketRw>,
        >,
    ) -> Result<SslStream<SocketRw>, Error> {
        // The workflow around the ready guards is awkward because there's no
        // way to tell Tokio "I just saw that it's not ready, block until it's
        // ready again"; there's also no way to know which operation we need
        // without running through one pass of the OpenSSL implementation.
        // Instead, we get the guard when Tokio thinks the operation is ready
        // (but we know it probably isn't, because OpenSSL just told us, but
        // because of the await point it may have become actually ready) and
        // then need to do another round of the loop to test whether it's still
        // blocked. Then, once we do get another WANT_READ/WANT_WRITE while
        // holding the guard, we can finally tell Tokio that it's not ready and
        // drop the guard.
        let mut read_guard =
            None::<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>>;
        let mut write_guard =
            None::<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>>;

        loop {
            match result {
                Ok(stream) => return Ok(stream),

                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(openssl::ssl::HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss));
                },

                Err(openssl::ssl::HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            if let Some(mut read_guard) = read_guard.take() {
                                read_guard.clear_ready();
                            }

                            read_guard =
                                Some(self.socket.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            if let Some(mut write_guard) = write_guard.take() {
                                write_guard.clear_ready();
                            }

                            write_guard =
                                Some(self.socket.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Called when an error is returned from `ssl_read` or `ssl_write`.
    ///
    /// The main purpose of this function is to handle the cases where OpenSSL
    /// returns `WANT_READ` or `WANT_WRITE`: it arranges a readiness check for
    /// the socket and clears its readiness status if currently set. Because of
    /// this, it is critical that this *only* be called immediately after
    /// `ssl_read` or `ssl_write`, with no await points in between, so that we
    /// can be certain that the `WANT_READ` or `WANT_WRITE` indicate that there
    /// is absolutely no data on the socket.
    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                futures::ready!(self.socket.fd.poll_read_ready(ctx))?
                    .clear_ready();
                // Call again to get tokio to actually watch for more changes.
                futures::ready!(self.socket.fd.poll_read_ready(ctx))?
                    .retain_ready();
                // If we get here, the FD has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.socket.fd.poll_write_ready(ctx))?
                    .clear_ready();
                // Call again to get tokio to actually watch for more changes.
                futures::ready!(self.socket.fd.poll_write_ready(ctx))?
                    .retain_ready();
                // If we get here, the FD has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            // As can be seen in the `fmt::Display` implementation of
            // `openssl::ssl::Error`, EOF is represented by the SYSCALL error
            // code with no associated IO error, and into_io_error() doesn't
            // bother to translate that.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

enum Mode {
    Cleartext(SocketRw),
    Ssl(SslStream<SocketRw>),
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer anything itself (i.e. SslStream::flush() just
        // delegates to the underlying writer without invoking OpenSSL) and we
        // also have no buffers, so there's nothing to do.
        task::Poll::Ready(Ok(()))
    }

    /// If there is an SSL session, the session is shut down, returning the
    /// socket to cleartext.
    ///
    /// During the shutdown process, other reads and writes are not
    /// well-defined.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.lock().unwrap();
        let done = if let Mode::Ssl(ref mut ssl) = *mode {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            }

            true
        } else {
            false
        };

        if done {
            *mode = Mode::Cleartext(SocketRw(Arc::clone(&self.socket)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Holds the registered file descriptor of the underlying socket.
///
/// This structure is tracked separately from the actual reader/writer as we
/// need to be able to "see through" the SSL stream in order to wait on the
/// underlying FD to become ready.
struct Socket {
    fd: AsyncFd<RawFd>,
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the raw socket file descriptor.
///
/// The synchronous implementations are what OpenSSL drives; with the socket
/// in non-blocking mode they surface `WouldBlock`, which the TLS layer
/// reports as `WANT_READ`/`WANT_WRITE`.
struct SocketRw(Arc<Socket>);

impl io::Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let fd = *self.0.fd.get_ref();
        nix::unistd::read(fd, dst).map_err(nix_to_io)
    }
}

impl io::Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let fd = *self.0.fd.get_ref();
        nix::unistd::write(fd, src)
            .map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for SocketRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let async_fd = &self.0.fd;
        loop {
            let mut guard = futures::ready!(async_fd.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SocketRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let async_fd = &self.0.fd;
        loop {
            let mut guard = futures::ready!(async_fd.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf)
                    .map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mhss_to_error<S>(mhss: openssl::ssl::MidHandshakeSslStream<S>) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
