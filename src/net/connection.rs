//! One socket serving one request.
//!
//! A [`Connection`] is a small state machine advanced by readiness events:
//! connect, TLS handshake (if any), send the request, read the head, stream
//! the body. TLS runs through `rustls` without owning the socket, so each
//! readiness event moves the handshake exactly as far as the bytes allow and
//! the socket is never switched between blocking modes.

use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use rustls::ClientConnection;
use rustls::pki_types::ServerName;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

use super::request::{Request, Target};
use super::response::{MAX_HEAD_SIZE, ResponseHead, build_request, resume_header_scan};
use crate::error::NetError;

/// Plaintext bytes read per readiness event, at most.
const READ_BUDGET: usize = 64 * 1024;

type ConnectFuture = Pin<Box<dyn Future<Output = Result<TcpStream, NetError>>>>;

enum Socket {
    Connecting(ConnectFuture),
    Open(TcpStream),
}

/// What woke a connection up.
pub(crate) enum Wake {
    Connected(Result<TcpStream, NetError>),
    Ready(io::Result<Ready>),
}

/// Something a connection wants its owner to know.
#[derive(Debug)]
pub(crate) enum Progress {
    Headers(ResponseHead),
    Body(Bytes),
    Redirect(String),
    Done,
}

/// `io::Read`/`io::Write` over a non-blocking tokio socket.
struct TryIo<'a>(&'a TcpStream);

impl Read for TryIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for TryIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct Connection {
    pub request: Request,
    /// URL currently being fetched, after redirects.
    pub target: Target,
    pub hops: u32,
    socket: Socket,
    tls: Option<ClientConnection>,
    /// Serialized request, written once the transport is ready.
    outgoing: Vec<u8>,
    request_sent: bool,
    head: Vec<u8>,
    response: Option<ResponseHead>,
    body_remaining: Option<u64>,
    /// Body bytes to drop because the server ignored our `Range`.
    discard: u64,
}

impl Connection {
    /// Parses the target. Resolution and connect run as the connection is
    /// polled.
    pub fn open(
        request: Request,
        url: &str,
        hops: u32,
        user_agent: &str,
        tls_config: impl FnOnce() -> Arc<rustls::ClientConfig>,
    ) -> Result<Self, NetError> {
        let target = Target::parse(url)?;
        let tls = if target.tls {
            let name = ServerName::try_from(target.host.clone())
                .map_err(|e| NetError::InvalidUrl(format!("{}: {e}", target.host)))?;
            Some(ClientConnection::new(tls_config(), name)?)
        } else {
            None
        };
        let outgoing = build_request(&target, user_agent, request.offset);
        let connecting = Box::pin(connect(target.host.clone(), target.port));

        Ok(Self {
            request,
            target,
            hops,
            socket: Socket::Connecting(connecting),
            tls,
            outgoing,
            request_sent: false,
            head: Vec::new(),
            response: None,
            body_remaining: None,
            discard: 0,
        })
    }

    fn wants_write(&self) -> bool {
        match &self.tls {
            Some(tls) => tls.wants_write() || (!tls.is_handshaking() && !self.request_sent),
            None => !self.request_sent,
        }
    }

    /// Waits until the connection can make progress.
    pub async fn wait(&mut self) -> Wake {
        let interest = if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match &mut self.socket {
            Socket::Connecting(connect) => Wake::Connected(connect.await),
            Socket::Open(stream) => Wake::Ready(stream.ready(interest).await),
        }
    }

    /// Advances the state machine after a wake-up.
    pub fn advance(&mut self, wake: Wake, progress: &mut Vec<Progress>) -> Result<(), NetError> {
        match wake {
            Wake::Connected(result) => {
                let stream = result?;
                tracing::trace!(request = %self.request.id, "connected");
                self.socket = Socket::Open(stream);
                Ok(())
            }
            Wake::Ready(result) => {
                result?;
                let Socket::Open(stream) = &self.socket else {
                    return Ok(());
                };
                let (data, eof) = match self.tls.as_mut() {
                    Some(tls) => {
                        pump_tls(tls, stream, &mut self.outgoing, &mut self.request_sent)?
                    }
                    None => pump_plain(stream, &mut self.outgoing, &mut self.request_sent)?,
                };
                if !data.is_empty() {
                    self.absorb(&data, progress)?;
                }
                if eof && !matches!(progress.last(), Some(Progress::Done | Progress::Redirect(_)))
                {
                    self.close(progress)?;
                }
                Ok(())
            }
        }
    }

    fn absorb(&mut self, data: &[u8], progress: &mut Vec<Progress>) -> Result<(), NetError> {
        if self.response.is_none() {
            let scanned = self.head.len();
            self.head.extend_from_slice(data);
            let Some(end) = resume_header_scan(&self.head, scanned) else {
                if self.head.len() > MAX_HEAD_SIZE {
                    return Err(NetError::MalformedResponse("response head too large".into()));
                }
                return Ok(());
            };
            let head = ResponseHead::parse(&self.head[..end])?;
            let rest = self.head.split_off(end);
            self.head.clear();

            if head.status.code == 416 && self.request.offset > 0 {
                // Resumed at or past the end: nothing left to fetch.
                tracing::debug!(
                    request = %self.request.id,
                    offset = self.request.offset,
                    "range already complete"
                );
                progress.push(Progress::Done);
                return Ok(());
            }
            if let Some(location) = head.location() {
                progress.push(Progress::Redirect(location.to_string()));
                return Ok(());
            }
            if !head.is_success() {
                return Err(NetError::HttpStatus {
                    code: head.status.code,
                    message: head.status.message.clone(),
                });
            }
            if self.request.offset > 0 && head.status.code != 206 {
                self.discard = self.request.offset;
            }
            self.body_remaining = head.content_length();
            self.response = Some(head.clone());
            progress.push(Progress::Headers(head));
            return self.absorb_body(&rest, progress);
        }
        self.absorb_body(data, progress)
    }

    fn absorb_body(&mut self, data: &[u8], progress: &mut Vec<Progress>) -> Result<(), NetError> {
        let data = match self.body_remaining {
            Some(remaining) => &data[..data.len().min(remaining as usize)],
            None => data,
        };
        if let Some(remaining) = self.body_remaining.as_mut() {
            *remaining -= data.len() as u64;
        }
        let skip = self.discard.min(data.len() as u64) as usize;
        self.discard -= skip as u64;
        if skip < data.len() {
            progress.push(Progress::Body(Bytes::copy_from_slice(&data[skip..])));
        }
        if self.body_remaining == Some(0) {
            progress.push(Progress::Done);
        }
        Ok(())
    }

    /// The peer closed the connection.
    fn close(&mut self, progress: &mut Vec<Progress>) -> Result<(), NetError> {
        if self.response.is_none() {
            return Err(NetError::MalformedResponse(
                "connection closed before the response head".into(),
            ));
        }
        if let Some(remaining) = self.body_remaining.filter(|&n| n > 0) {
            return Err(NetError::MalformedResponse(format!(
                "connection closed with {remaining} body bytes outstanding"
            )));
        }
        progress.push(Progress::Done);
        Ok(())
    }
}

/// Resolves `host` without blocking the runtime and tries each address in
/// turn.
async fn connect(host: String, port: u16) -> Result<TcpStream, NetError> {
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|source| NetError::Resolve {
            host: host.clone(),
            source,
        })?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                tracing::trace!(%addr, %error, "connect attempt failed");
                last = Some(error);
            }
        }
    }
    Err(match last {
        Some(error) => NetError::Connect(error),
        None => NetError::Resolve {
            host,
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        },
    })
}

/// Writes the request and reads whatever the socket has. Returns the bytes
/// read and whether the peer closed.
fn pump_plain(
    stream: &TcpStream,
    outgoing: &mut Vec<u8>,
    sent: &mut bool,
) -> Result<(Vec<u8>, bool), NetError> {
    if !*sent {
        while !outgoing.is_empty() {
            match stream.try_write(outgoing) {
                Ok(n) => {
                    outgoing.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((Vec::new(), false)),
                Err(e) => return Err(e.into()),
            }
        }
        *sent = true;
    }

    let mut data = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    while data.len() < READ_BUDGET {
        match stream.try_read(&mut buf) {
            Ok(0) => return Ok((data, true)),
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok((data, false))
}

/// One round of TLS I/O: flush records, read records, hand the request to
/// the session once the handshake is done, then drain plaintext.
fn pump_tls(
    tls: &mut ClientConnection,
    stream: &TcpStream,
    outgoing: &mut Vec<u8>,
    sent: &mut bool,
) -> Result<(Vec<u8>, bool), NetError> {
    let mut io = TryIo(stream);
    let mut eof = false;

    flush_tls(tls, &mut io)?;
    while tls.wants_read() {
        match tls.read_tls(&mut io) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(_) => {
                tls.process_new_packets()?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }

    if !tls.is_handshaking() && !*sent {
        tls.writer().write_all(outgoing)?;
        outgoing.clear();
        *sent = true;
    }
    flush_tls(tls, &mut io)?;

    let mut data = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    while data.len() < READ_BUDGET {
        match tls.reader().read(&mut buf) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            // Peer closed without close_notify; most servers do.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                eof = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((data, eof))
}

fn flush_tls(tls: &mut ClientConnection, io: &mut TryIo<'_>) -> Result<(), NetError> {
    while tls.wants_write() {
        match tls.write_tls(io) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
