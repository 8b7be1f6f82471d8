//! `ssh2`-backed shell sessions and dynamic SOCKS forwards.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::{Channel, ErrorCode, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ChainmailError, Result};
use crate::model::proxy::SocksVersion;

use super::shell::{DynamicForward, ForwardEvent, ShellConnector, ShellSession, ShellTarget};
use super::socks;

/// libssh2 "would block" in non-blocking mode.
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const PUMP_IDLE: Duration = Duration::from_millis(5);
const RELAY_BUFFER: usize = 32 * 1024;
const FORWARD_EVENT_CAPACITY: usize = 64;

fn transport(msg: impl Into<String>) -> ChainmailError {
    ChainmailError::Transport(msg.into())
}

// ── Connector ───────────────────────────────────────────────────

/// Opens password-authenticated sessions with `ssh2`.
///
/// Host keys are not verified: any key the server presents is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Connector;

#[async_trait]
impl ShellConnector for Ssh2Connector {
    async fn connect(&self, target: &ShellTarget) -> Result<Box<dyn ShellSession>> {
        let stream = open_socket(target).await?;
        let peer = stream.peer_addr().ok().map(|a| a.ip());

        let std_stream = stream
            .into_std()
            .map_err(|e| transport(format!("failed to convert stream: {e}")))?;
        std_stream
            .set_nonblocking(false)
            .map_err(|e| transport(format!("failed to set blocking mode: {e}")))?;

        let login = target.login.clone();
        let password = target.password.clone();
        let session = tokio::task::spawn_blocking(move || handshake(std_stream, &login, &password))
            .await
            .map_err(|e| ChainmailError::Unexpected(format!("handshake task failed: {e}")))??;

        let label = format!("{}@{}:{}", target.login, target.host, target.port);
        info!(session = %label, peer = ?peer, "Shell session authenticated");
        Ok(Box::new(Ssh2Session {
            session,
            peer,
            connected: AtomicBool::new(true),
            label,
            channel_timeout: target.connect_timeout,
        }))
    }
}

async fn open_socket(target: &ShellTarget) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| transport(format!("failed to resolve {}: {e}", target.host)))?
        .collect();

    // A bound socket can only reach peers of its own family.
    let addr = match target.bind {
        Some(bind) => addrs.iter().find(|a| a.is_ipv4() == bind.is_ipv4()),
        None => addrs.first(),
    }
    .copied()
    .ok_or_else(|| transport(format!("no usable address for {}", target.host)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| transport(format!("failed to create socket: {e}")))?;

    if let Some(bind) = target.bind {
        socket
            .bind(SocketAddr::new(bind, 0))
            .map_err(|e| transport(format!("failed to bind to tunnel address {bind}: {e}")))?;
        debug!(bind = %bind, "Shell socket bound to tunnel address");
    }

    tokio::time::timeout(target.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            transport(format!(
                "connection to {addr} timed out after {:?}",
                target.connect_timeout
            ))
        })?
        .map_err(|e| transport(format!("failed to connect to {addr}: {e}")))
}

fn handshake(stream: std::net::TcpStream, login: &str, password: &str) -> Result<Session> {
    let mut session =
        Session::new().map_err(|e| transport(format!("failed to create session: {e}")))?;
    session.set_tcp_stream(stream);
    session
        .handshake()
        .map_err(|e| transport(format!("handshake failed: {e}")))?;
    session
        .userauth_password(login, password)
        .map_err(|e| transport(format!("authentication failed for {login}: {e}")))?;
    if !session.authenticated() {
        return Err(transport(format!("authentication rejected for {login}")));
    }
    Ok(session)
}

// ── Session ─────────────────────────────────────────────────────

struct Ssh2Session {
    session: Session,
    peer: Option<IpAddr>,
    connected: AtomicBool,
    label: String,
    channel_timeout: Duration,
}

#[async_trait]
impl ShellSession for Ssh2Session {
    async fn open_dynamic_forward(
        &self,
        listen: SocketAddr,
        version: SocksVersion,
    ) -> Result<Box<dyn DynamicForward>> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| transport(format!("failed to bind SOCKS port {listen}: {e}")))?;
        let local = listener.local_addr().map_err(|e| ChainmailError::io("<socks listener>", e))?;

        // Relays share the session from several threads.
        self.session.set_blocking(false);

        let (events, _) = broadcast::channel(FORWARD_EVENT_CAPACITY);
        let handle = tokio::spawn(accept_loop(
            listener,
            self.session.clone(),
            version,
            events.clone(),
            self.channel_timeout,
        ));
        info!(session = %self.label, listen = %local, %version, "Dynamic forward started");

        Ok(Box::new(Ssh2Forward {
            local,
            events,
            handle: Mutex::new(Some(handle)),
            started: AtomicBool::new(true),
        }))
    }

    fn peer_addr(&self) -> Option<IpAddr> {
        self.peer
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let session = self.session.clone();
        let result = tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            session.disconnect(None, "bye", None)
        })
        .await;
        match result {
            Ok(Ok(())) => info!(session = %self.label, "Shell session disconnected"),
            Ok(Err(e)) => debug!(session = %self.label, error = %e, "Disconnect was not clean"),
            Err(e) => warn!(session = %self.label, error = %e, "Disconnect task failed"),
        }
    }
}

// ── Forward ─────────────────────────────────────────────────────

struct Ssh2Forward {
    local: SocketAddr,
    events: broadcast::Sender<ForwardEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Ssh2Forward {
    fn abort(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl DynamicForward for Ssh2Forward {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn events(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    async fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            self.abort();
            info!(listen = %self.local, "Dynamic forward stopped");
        }
    }
}

impl Drop for Ssh2Forward {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Session,
    version: SocksVersion,
    events: broadcast::Sender<ForwardEvent>,
    channel_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                debug!(%peer, "SOCKS client connected");
                let session = session.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        relay_client(client, session, version, &events, channel_timeout).await
                    {
                        debug!(%peer, error = %e, "SOCKS relay ended with error");
                        let _ = events.send(ForwardEvent::Error {
                            message: e.to_string(),
                        });
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "SOCKS accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn relay_client(
    mut client: TcpStream,
    session: Session,
    version: SocksVersion,
    events: &broadcast::Sender<ForwardEvent>,
    channel_timeout: Duration,
) -> Result<()> {
    let request = socks::accept(&mut client, version).await?;
    let target = request.target();
    debug!(%target, "SOCKS CONNECT");
    let _ = events.send(ForwardEvent::Request {
        target: target.clone(),
    });

    let opened = tokio::task::spawn_blocking(move || {
        open_channel(&session, &request.host, request.port, channel_timeout)
    })
    .await
    .map_err(|e| ChainmailError::Unexpected(format!("channel task failed: {e}")))?;

    let channel = match opened {
        Ok(channel) => channel,
        Err(e) => {
            socks::reply(&mut client, version, false).await?;
            return Err(e);
        }
    };
    socks::reply(&mut client, version, true).await?;
    pump(client, channel).await;
    debug!(%target, "SOCKS relay closed");
    Ok(())
}

fn open_channel(session: &Session, host: &str, port: u16, timeout: Duration) -> Result<Channel> {
    let deadline = Instant::now() + timeout;
    loop {
        match session.channel_direct_tcpip(host, port, None) {
            Ok(channel) => return Ok(channel),
            Err(e)
                if matches!(e.code(), ErrorCode::Session(code) if code == LIBSSH2_ERROR_EAGAIN)
                    && Instant::now() < deadline =>
            {
                std::thread::sleep(PUMP_IDLE);
            }
            Err(e) => {
                return Err(transport(format!(
                    "direct-tcpip to {host}:{port} failed: {e}"
                )))
            }
        }
    }
}

/// Remote end of a relayed connection, driven from a dedicated thread.
trait RelayChannel: Read + Write + Send + 'static {
    /// Signal that the local client will send nothing more.
    /// `Ok(false)` means "try again".
    fn send_eof(&mut self) -> std::io::Result<bool>;
    fn at_eof(&self) -> bool;
    fn close(&mut self);
}

impl RelayChannel for Channel {
    fn send_eof(&mut self) -> std::io::Result<bool> {
        match Channel::send_eof(self) {
            Ok(()) => Ok(true),
            Err(e) if matches!(e.code(), ErrorCode::Session(code) if code == LIBSSH2_ERROR_EAGAIN) => {
                Ok(false)
            }
            Err(e) => Err(std::io::Error::other(e)),
        }
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }

    fn close(&mut self) {
        let _ = Channel::close(self);
    }
}

/// Copy bytes both ways between a local client and a shell channel.
///
/// A client half-close is passed on as channel EOF, and the remote's
/// remaining output is still delivered until it reaches EOF itself.
async fn pump<C: RelayChannel>(client: TcpStream, channel: C) {
    let (mut client_read, mut client_write) = client.into_split();
    let (tx_to_client, mut rx_to_client) = mpsc::unbounded_channel::<Vec<u8>>();
    let (tx_to_remote, rx_to_remote) = mpsc::unbounded_channel::<Vec<u8>>();

    let channel_thread = std::thread::spawn(move || drive_channel(channel, rx_to_remote, tx_to_client));

    let mut upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx_to_remote.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut downstream = tokio::spawn(async move {
        while let Some(data) = rx_to_client.recv().await {
            if client_write.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = client_write.shutdown().await;
    });

    tokio::select! {
        _ = &mut downstream => upstream.abort(),
        _ = &mut upstream => {
            let _ = downstream.await;
        }
    }

    let _ = tokio::task::spawn_blocking(move || channel_thread.join()).await;
}

fn drive_channel<C: RelayChannel>(
    mut channel: C,
    mut rx_to_remote: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_to_client: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut pending: Vec<u8> = Vec::new();
    let mut client_closed = false;
    let mut eof_sent = false;

    loop {
        let mut idle = true;

        if pending.is_empty() && !client_closed {
            match rx_to_remote.try_recv() {
                Ok(data) => pending = data,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => client_closed = true,
            }
        }
        if !pending.is_empty() {
            match channel.write(&pending) {
                Ok(n) => {
                    pending.drain(..n);
                    idle = false;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        } else if client_closed && !eof_sent {
            match channel.send_eof() {
                Ok(done) => eof_sent = done,
                Err(_) => break,
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.at_eof() {
                    break;
                }
            }
            Ok(n) => {
                idle = false;
                if tx_to_client.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => break,
        }

        if idle {
            std::thread::sleep(PUMP_IDLE);
        }
    }

    channel.close();
}
