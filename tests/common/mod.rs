//! In-memory shell and protocol doubles shared by the integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use chainmail::chain::{
    ChainSettings, DynamicForward, ForwardEvent, NoTunnel, ProxyChainBuilder, ShellConnector,
    ShellSession, ShellTarget, SocksEndpoint, TunnelController,
};
use chainmail::config::SessionConfig;
use chainmail::error::{ChainmailError, Result};
use chainmail::events::{ClientEvent, EventBus, PoolKind};
use chainmail::model::account::{Endpoint, MailAccount, ReceiveProtocol, Security};
use chainmail::model::proxy::{ProxyAccount, SocksVersion};
use chainmail::pool::{AccountPool, SharedPool};
use chainmail::session::{
    ClientFactory, MailboxAccess, MailboxClient, MailboxStatus, OutboundMessage, ProtocolClient,
    SessionExecutor, SessionToken, SubmissionClient,
};
use chainmail::store::DirectoryStore;

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

// ── Shell doubles ───────────────────────────────────────────────

/// What the fake shell layer saw.
#[derive(Default)]
pub struct ShellLog {
    pub connects: AtomicUsize,
    pub forwards: AtomicUsize,
    pub stops: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub last_target: Mutex<Option<ShellTarget>>,
    pub last_listen: Mutex<Option<SocketAddr>>,
    pub forward_tx: Mutex<Option<broadcast::Sender<ForwardEvent>>>,
}

pub struct MockConnector {
    pub log: Arc<ShellLog>,
    pub fail_connect: bool,
    pub fail_forward: bool,
    pub peer: Option<IpAddr>,
}

impl MockConnector {
    pub fn new(log: Arc<ShellLog>) -> Self {
        Self {
            log,
            fail_connect: false,
            fail_forward: false,
            peer: Some("198.51.100.20".parse().unwrap()),
        }
    }
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn connect(&self, target: &ShellTarget) -> Result<Box<dyn ShellSession>> {
        *self.log.last_target.lock().unwrap() = Some(target.clone());
        if self.fail_connect {
            return Err(ChainmailError::Transport("authentication refused".into()));
        }
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            log: Arc::clone(&self.log),
            fail_forward: self.fail_forward,
            peer: self.peer,
            connected: AtomicBool::new(true),
        }))
    }
}

struct MockSession {
    log: Arc<ShellLog>,
    fail_forward: bool,
    peer: Option<IpAddr>,
    connected: AtomicBool,
}

#[async_trait]
impl ShellSession for MockSession {
    async fn open_dynamic_forward(
        &self,
        listen: SocketAddr,
        _version: SocksVersion,
    ) -> Result<Box<dyn DynamicForward>> {
        *self.log.last_listen.lock().unwrap() = Some(listen);
        if self.fail_forward {
            return Err(ChainmailError::Transport("address already in use".into()));
        }
        self.log.forwards.fetch_add(1, Ordering::SeqCst);
        let (tx, _) = broadcast::channel(16);
        *self.log.forward_tx.lock().unwrap() = Some(tx.clone());
        Ok(Box::new(MockForward {
            log: Arc::clone(&self.log),
            listen,
            tx,
            started: AtomicBool::new(true),
        }))
    }

    fn peer_addr(&self) -> Option<IpAddr> {
        self.peer
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MockForward {
    log: Arc<ShellLog>,
    listen: SocketAddr,
    tx: broadcast::Sender<ForwardEvent>,
    started: AtomicBool,
}

#[async_trait]
impl DynamicForward for MockForward {
    fn local_addr(&self) -> SocketAddr {
        self.listen
    }

    fn events(&self) -> broadcast::Receiver<ForwardEvent> {
        self.tx.subscribe()
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.log.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub fn chain_builder(
    connector: MockConnector,
    tunnel: Arc<dyn TunnelController>,
    settings: ChainSettings,
    events: EventBus,
) -> ProxyChainBuilder {
    ProxyChainBuilder::new(Arc::new(connector), tunnel, settings, events)
}

// ── Protocol doubles ────────────────────────────────────────────

/// Scripted behavior of the fake protocol clients.
#[derive(Default)]
pub struct Script {
    pub messages: Vec<Vec<u8>>,
    pub failing_fetch: Vec<u64>,
    pub panic_on_fetch: Option<u64>,
    /// Fetch never completes for these indices.
    pub hanging_fetch: Vec<u64>,
    /// Fire `cancel` once this index has been fetched.
    pub cancel_after_fetch: Option<(u64, CancellationToken)>,
    pub fail_connect: bool,
    /// Reject outbound messages whose bytes contain this marker.
    pub reject_marker: Option<String>,
}

/// What the fake protocol clients saw.
#[derive(Default)]
pub struct ClientLog {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub quits: AtomicUsize,
    pub fetched: AtomicUsize,
    pub deleted: AtomicUsize,
    pub expunges: AtomicUsize,
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub socks: Mutex<Option<SocksEndpoint>>,
    pub access: Mutex<Option<MailboxAccess>>,
}

pub struct MockFactory {
    pub script: Arc<Script>,
    pub log: Arc<ClientLog>,
}

impl ClientFactory for MockFactory {
    fn mailbox(
        &self,
        _protocol: ReceiveProtocol,
        socks: SocksEndpoint,
    ) -> Result<Box<dyn MailboxClient>> {
        *self.log.socks.lock().unwrap() = Some(socks);
        Ok(Box::new(MockClient::new(&self.script, &self.log)))
    }

    fn submission(&self, socks: SocksEndpoint) -> Result<Box<dyn SubmissionClient>> {
        *self.log.socks.lock().unwrap() = Some(socks);
        Ok(Box::new(MockClient::new(&self.script, &self.log)))
    }
}

struct MockClient {
    script: Arc<Script>,
    log: Arc<ClientLog>,
    connected: bool,
    tx: broadcast::Sender<ClientEvent>,
}

impl MockClient {
    fn new(script: &Arc<Script>, log: &Arc<ClientLog>) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            script: Arc::clone(script),
            log: Arc::clone(log),
            connected: false,
            tx,
        }
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn connect(&mut self, endpoint: &Endpoint, _token: &SessionToken) -> Result<()> {
        if self.script.fail_connect {
            return Err(ChainmailError::Transport(format!(
                "connection to {} refused",
                endpoint.host
            )));
        }
        self.connected = true;
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(ClientEvent::Connected {
            host: endpoint.host.clone(),
        });
        Ok(())
    }

    async fn authenticate(
        &mut self,
        _login: &str,
        _password: &str,
        _token: &SessionToken,
    ) -> Result<()> {
        let _ = self.tx.send(ClientEvent::Authenticated);
        Ok(())
    }

    async fn disconnect(&mut self, quit: bool) {
        self.connected = false;
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        if quit {
            self.log.quits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl MailboxClient for MockClient {
    async fn open_inbox(&mut self, access: MailboxAccess) -> Result<MailboxStatus> {
        *self.log.access.lock().unwrap() = Some(access);
        Ok(MailboxStatus {
            total: self.script.messages.len() as u64,
            recent: 0,
        })
    }

    async fn fetch(&mut self, index: u64) -> Result<Vec<u8>> {
        if self.script.panic_on_fetch == Some(index) {
            panic!("mailbox client blew up on message {index}");
        }
        if self.script.hanging_fetch.contains(&index) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.script.failing_fetch.contains(&index) {
            return Err(ChainmailError::Protocol(format!("FETCH {index} failed")));
        }
        self.log.fetched.fetch_add(1, Ordering::SeqCst);
        if let Some((at, cancel)) = &self.script.cancel_after_fetch {
            if *at == index {
                cancel.cancel();
            }
        }
        self.script
            .messages
            .get(index as usize)
            .cloned()
            .ok_or_else(|| ChainmailError::Protocol(format!("no message {index}")))
    }

    async fn mark_deleted(&mut self, _index: u64) -> Result<()> {
        self.log.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn expunge(&mut self) -> Result<()> {
        self.log.expunges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SubmissionClient for MockClient {
    async fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        if let Some(marker) = &self.script.reject_marker {
            if String::from_utf8_lossy(&message.raw).contains(marker.as_str()) {
                return Err(ChainmailError::Protocol("550 message rejected".into()));
            }
        }
        self.log.sent.lock().unwrap().push(message.clone());
        let _ = self.tx.send(ClientEvent::MessageSent);
        Ok(())
    }
}

// ── Session harness ─────────────────────────────────────────────

pub fn proxy() -> ProxyAccount {
    ProxyAccount::new("proxy.example.net", "relay", "hunter2", SocksVersion::V5)
}

pub fn mail_account() -> MailAccount {
    let mut account = MailAccount::new("sender@example.com", "secret");
    account.display_name = Some("Sam Sender".into());
    account.imap = Some(Endpoint::new("imap.example.com", 993, Security::Tls));
    account.smtp = Some(Endpoint::new("smtp.example.com", 587, Security::StartTls));
    account
}

/// A ready-to-run executor over fakes, with a temporary account root and
/// message store.
pub struct Harness {
    pub executor: SessionExecutor,
    pub proxies: SharedPool<ProxyAccount>,
    pub shell: Arc<ShellLog>,
    pub clients: Arc<ClientLog>,
    pub events: EventBus,
    pub store: Arc<DirectoryStore>,
    pub root: tempfile::TempDir,
}

pub struct HarnessOptions {
    pub script: Script,
    pub config: SessionConfig,
    pub proxies: Vec<ProxyAccount>,
    pub fail_chain: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            script: Script::default(),
            config: SessionConfig::default(),
            proxies: vec![proxy()],
            fail_chain: false,
        }
    }
}

pub fn harness(options: HarnessOptions) -> Harness {
    let events = EventBus::default();
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(DirectoryStore::new(root.path().join("store")));

    let shell = Arc::new(ShellLog::default());
    let mut connector = MockConnector::new(Arc::clone(&shell));
    connector.fail_connect = options.fail_chain;
    let chains = chain_builder(
        connector,
        Arc::new(NoTunnel),
        ChainSettings::default(),
        events.clone(),
    );

    let proxies = SharedPool::new(
        AccountPool::new(PoolKind::Proxies, events.clone()).with_entries(options.proxies),
    );

    let clients = Arc::new(ClientLog::default());
    let factory = Arc::new(MockFactory {
        script: Arc::new(options.script),
        log: Arc::clone(&clients),
    });

    let executor = SessionExecutor::new(
        proxies.clone(),
        chains,
        factory,
        store.clone(),
        events.clone(),
    )
    .with_config(options.config)
    .with_seed(7);

    Harness {
        executor,
        proxies,
        shell,
        clients,
        events,
        store,
        root,
    }
}

/// Write `files` into the account's outbound queue.
pub fn enqueue(root: &Path, config: &SessionConfig, files: &[(&str, &str)]) -> PathBuf {
    let queue = root.join(&config.queue_dir);
    std::fs::create_dir_all(&queue).unwrap();
    for (name, body) in files {
        std::fs::write(queue.join(name), body).unwrap();
    }
    queue
}
