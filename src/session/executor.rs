//! Runs one receive or send session for one mail account.

use std::future::Future;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::bounce;
use crate::chain::{ProxyChain, ProxyChainBuilder, SocksEndpoint};
use crate::config::SessionConfig;
use crate::error::{ChainmailError, FailureKind, Result};
use crate::events::{EngineEvent, EventBus, LifecycleRelay, SessionMode};
use crate::model::account::{CurrentAction, Endpoint, MailAccount};
use crate::model::proxy::{ProxyAccount, SocksVersion};
use crate::pool::SharedPool;
use crate::store::{Category, MessageStore, StoreHandle};

use super::client::{ClientFactory, MailboxAccess, MailboxClient, SubmissionClient};
use super::compose::{compose, CLIENT_SIGNATURES};
use super::stats::SessionStats;
use super::token::SessionToken;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// Send path with an empty queue.
    NoWork,
    /// The token fired; items processed before that are kept.
    Cancelled,
    Failed(FailureKind),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

pub struct SessionExecutor {
    proxies: SharedPool<ProxyAccount>,
    proxy_kind: Option<SocksVersion>,
    chains: ProxyChainBuilder,
    clients: Arc<dyn ClientFactory>,
    store: Arc<dyn MessageStore>,
    events: EventBus,
    stats: Arc<SessionStats>,
    config: SessionConfig,
    rng: Mutex<fastrand::Rng>,
}

impl SessionExecutor {
    pub fn new(
        proxies: SharedPool<ProxyAccount>,
        chains: ProxyChainBuilder,
        clients: Arc<dyn ClientFactory>,
        store: Arc<dyn MessageStore>,
        events: EventBus,
    ) -> Self {
        Self {
            proxies,
            proxy_kind: None,
            chains,
            clients,
            store,
            events,
            stats: Arc::new(SessionStats::default()),
            config: SessionConfig::default(),
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Share counters with other executors.
    pub fn with_stats(mut self, stats: Arc<SessionStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Only route through proxies of this SOCKS version.
    pub fn with_proxy_kind(mut self, kind: Option<SocksVersion>) -> Self {
        self.proxy_kind = kind;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock().unwrap_or_else(PoisonError::into_inner) = fastrand::Rng::with_seed(seed);
        self
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Run a session and report plain success.
    ///
    /// `NoWork`, `Cancelled`, and every failure map to `false`.
    pub async fn run(
        &self,
        mode: SessionMode,
        account: &mut MailAccount,
        root: &Path,
        token: &SessionToken,
    ) -> bool {
        self.execute(mode, account, root, token).await.is_success()
    }

    /// Run a session. Never panics and never returns an error: every failure
    /// is logged and folded into the outcome.
    ///
    /// `account.current_action` is set for the duration of the call and is
    /// back to `None` when it returns, whatever the outcome.
    pub async fn execute(
        &self,
        mode: SessionMode,
        account: &mut MailAccount,
        root: &Path,
        token: &SessionToken,
    ) -> SessionOutcome {
        let endpoint = match required_endpoint(mode, account) {
            Ok(endpoint) => endpoint.clone(),
            Err(e) => {
                warn!(account = %account.login, ?mode, error = %e, "Session not started");
                return SessionOutcome::Failed(e.kind());
            }
        };

        if mode == SessionMode::Send {
            match queued_files(&root.join(&self.config.queue_dir)) {
                Ok(files) if files.is_empty() => {
                    info!(account = %account.login, "Send queue is empty");
                    return SessionOutcome::NoWork;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(account = %account.login, error = %e, "Cannot read send queue");
                    return SessionOutcome::Failed(e.kind());
                }
            }
        }

        let busy = BusyGuard::set(account, mode);
        let snapshot = busy.account.clone();
        let login = snapshot.login.clone();
        self.events.publish(EngineEvent::Begin {
            account: login.clone(),
            mode,
        });
        info!(account = %login, ?mode, "Session started");

        let mut resources = Resources::default();
        let driven = AssertUnwindSafe(self.drive(
            mode,
            &snapshot,
            &endpoint,
            root,
            token,
            &mut resources,
        ))
        .catch_unwind()
        .await;

        let outcome = match driven {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(account = %login, ?mode, error = %e, "Session failed");
                SessionOutcome::Failed(e.kind())
            }
            Err(panic) => {
                error!(account = %login, ?mode, panic = %panic_message(&*panic), "Session panicked");
                SessionOutcome::Failed(FailureKind::Unexpected)
            }
        };

        resources.release().await;
        drop(busy);

        self.events.publish(EngineEvent::End {
            account: login.clone(),
            mode,
            success: outcome.is_success(),
        });
        info!(account = %login, ?mode, ?outcome, "Session finished");
        outcome
    }

    async fn drive(
        &self,
        mode: SessionMode,
        account: &MailAccount,
        endpoint: &Endpoint,
        root: &Path,
        token: &SessionToken,
        res: &mut Resources,
    ) -> Result<SessionOutcome> {
        let proxy = self
            .proxies
            .select(self.proxy_kind)
            .await
            .ok_or_else(|| ChainmailError::Transport("no eligible proxy account".into()))?;
        let chain = self.chains.build(&proxy).await.ok_or_else(|| {
            ChainmailError::Transport(format!("could not build chain through {}", proxy.key()))
        })?;
        let chain = res.chain.insert(chain);
        let socks = chain.socks();
        let egress = chain.egress_ip();

        match mode {
            SessionMode::Receive => self.receive(account, endpoint, socks, token, res).await,
            SessionMode::Send => {
                self.send(account, endpoint, socks, egress, root, token, res)
                    .await
            }
        }
    }

    // ── Receive ─────────────────────────────────────────────────

    async fn receive(
        &self,
        account: &MailAccount,
        endpoint: &Endpoint,
        socks: SocksEndpoint,
        token: &SessionToken,
        res: &mut Resources,
    ) -> Result<SessionOutcome> {
        let client = res
            .mailbox
            .insert(self.clients.mailbox(account.receive_protocol, socks)?);
        res.relay = Some(LifecycleRelay::spawn(
            client.events(),
            self.events.clone(),
            account.login.clone(),
        ));

        self.io("connect", client.connect(endpoint, token)).await?;
        let password = account.password.as_deref().unwrap_or_default();
        self.io("authenticate", client.authenticate(&account.login, password, token))
            .await?;

        let access = if self.config.purge {
            MailboxAccess::ReadWrite
        } else {
            MailboxAccess::ReadOnly
        };
        let status = self.io("open inbox", client.open_inbox(access)).await?;
        self.stats.receive.record_seen(status.total, status.recent);
        info!(account = %account.login, total = status.total, recent = status.recent, "Inbox opened");
        if let Some(reason) = token.reason() {
            info!(account = %account.login, ?reason, "Receive cancelled before the first message");
            return Ok(SessionOutcome::Cancelled);
        }

        let lease = res
            .lease
            .insert(StoreLease::open(Arc::clone(&self.store), &account.store_key())?);

        let mut received = 0u64;
        let mut cancelled = false;
        for index in 0..status.total {
            if let Some(reason) = token.reason() {
                info!(account = %account.login, ?reason, processed = index, "Receive cancelled");
                cancelled = true;
                break;
            }

            match self.receive_one(client.as_mut(), &lease.handle, index).await {
                Ok(category) => {
                    received += 1;
                    self.stats.receive.add_received();
                    debug!(account = %account.login, index, %category, "Message received");
                }
                Err(e) => {
                    self.stats.receive.add_failed();
                    warn!(account = %account.login, index, error = %e, "Skipping message");
                    continue;
                }
            }

            if self.config.purge {
                match self.io("mark deleted", client.mark_deleted(index)).await {
                    Ok(()) => self.stats.receive.add_deleted(),
                    Err(e) => warn!(account = %account.login, index, error = %e, "Failed to mark message deleted"),
                }
            }
        }

        if self.config.purge {
            if let Err(e) = self.io("expunge", client.expunge()).await {
                warn!(account = %account.login, error = %e, "Expunge failed");
            }
        }

        self.events.publish(EngineEvent::DeliveryIn {
            account: account.login.clone(),
            received,
        });
        Ok(if cancelled {
            SessionOutcome::Cancelled
        } else {
            SessionOutcome::Completed
        })
    }

    async fn receive_one(
        &self,
        client: &mut dyn MailboxClient,
        handle: &StoreHandle,
        index: u64,
    ) -> Result<Category> {
        let raw = self
            .io("fetch", client.fetch(index))
            .await
            .map_err(|e| ChainmailError::Item {
                index: index as usize,
                reason: e.to_string(),
            })?;

        let category = if bounce::detect(&raw).is_bounce {
            Category::Bounces
        } else {
            Category::Inbox
        };
        self.store.add(handle, category, &raw)?;
        Ok(category)
    }

    // ── Send ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        account: &MailAccount,
        endpoint: &Endpoint,
        socks: SocksEndpoint,
        egress: Option<IpAddr>,
        root: &Path,
        token: &SessionToken,
        res: &mut Resources,
    ) -> Result<SessionOutcome> {
        let files = queued_files(&root.join(&self.config.queue_dir))?;
        if files.is_empty() {
            return Ok(SessionOutcome::NoWork);
        }
        self.stats.send.record_seen(files.len() as u64, 0);

        let client = res.submission.insert(self.clients.submission(socks)?);
        res.relay = Some(LifecycleRelay::spawn(
            client.events(),
            self.events.clone(),
            account.login.clone(),
        ));

        self.io("connect", client.connect(endpoint, token)).await?;
        let password = account.password.as_deref().unwrap_or_default();
        self.io("authenticate", client.authenticate(&account.login, password, token))
            .await?;

        if let Some(reason) = token.reason() {
            info!(account = %account.login, ?reason, "Send cancelled before the first file");
            return Ok(SessionOutcome::Cancelled);
        }

        let origin = if self.config.fake_origin_ip { egress } else { None };
        let archive = root
            .join(&self.config.sent_dir)
            .join(Local::now().format("%Y%m%d_%H%M%S").to_string());

        let mut sent = 0u64;
        let mut cancelled = false;
        for (index, path) in files.iter().enumerate() {
            if let Some(reason) = token.reason() {
                info!(account = %account.login, ?reason, processed = index, "Send cancelled");
                cancelled = true;
                break;
            }

            match self
                .send_one(client.as_mut(), account, path, origin, &archive)
                .await
            {
                Ok(()) => {
                    sent += 1;
                    self.stats.send.add_sent();
                    debug!(account = %account.login, file = %path.display(), "Message sent");
                }
                Err(e) => {
                    self.stats.send.add_failed();
                    warn!(account = %account.login, file = %path.display(), error = %e, "Message left in queue");
                }
            }
        }

        self.events.publish(EngineEvent::DeliveryOut {
            account: account.login.clone(),
            sent,
        });
        Ok(if cancelled {
            SessionOutcome::Cancelled
        } else {
            SessionOutcome::Completed
        })
    }

    async fn send_one(
        &self,
        client: &mut dyn SubmissionClient,
        account: &MailAccount,
        path: &Path,
        origin: Option<IpAddr>,
        archive: &Path,
    ) -> Result<()> {
        let raw = std::fs::read(path).map_err(|e| ChainmailError::io(path, e))?;
        let message = compose(&raw, account, origin, self.next_pick())?;
        self.io("send", client.send(&message)).await?;
        archive_sent(path, archive)
    }

    fn next_pick(&self) -> usize {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usize(..CLIENT_SIGNATURES.len())
    }

    /// Apply the configured I/O timeout, if any, to one protocol operation.
    async fn io<T>(&self, what: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.io_timeout() {
            Some(limit) => tokio::time::timeout(limit, op).await.map_err(|_| {
                ChainmailError::Transport(format!("{what} timed out after {limit:?}"))
            })?,
            None => op.await,
        }
    }
}

fn required_endpoint(mode: SessionMode, account: &MailAccount) -> Result<&Endpoint> {
    match mode {
        SessionMode::Receive => account.require_receive(),
        SessionMode::Send => account.require_send(),
    }
}

/// Regular, non-hidden files in the queue directory, by name.
pub fn queued_files(queue: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(queue) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ChainmailError::io(queue, e)),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .collect();
    files.sort();
    Ok(files)
}

fn archive_sent(path: &Path, archive: &Path) -> Result<()> {
    std::fs::create_dir_all(archive).map_err(|e| ChainmailError::io(archive, e))?;
    let name = path
        .file_name()
        .ok_or_else(|| ChainmailError::Unexpected(format!("queue entry without a name: {}", path.display())))?;
    let target = archive.join(name);
    std::fs::rename(path, &target).map_err(|e| ChainmailError::io(&target, e))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Scoped resources ────────────────────────────────────────────

/// Marks the account busy; resets the marker when dropped.
struct BusyGuard<'a> {
    account: &'a mut MailAccount,
}

impl<'a> BusyGuard<'a> {
    fn set(account: &'a mut MailAccount, mode: SessionMode) -> Self {
        account.current_action = match mode {
            SessionMode::Receive => CurrentAction::Receiving,
            SessionMode::Send => CurrentAction::Sending,
        };
        Self { account }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.account.current_action = CurrentAction::None;
    }
}

/// An open message-store account, closed on drop.
struct StoreLease {
    store: Arc<dyn MessageStore>,
    handle: StoreHandle,
}

impl StoreLease {
    fn open(store: Arc<dyn MessageStore>, key: &str) -> Result<Self> {
        let handle = store.open(key)?;
        Ok(Self { store, handle })
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        self.store.close(&self.handle.key);
    }
}

/// Everything a session may hold, released in one place.
#[derive(Default)]
struct Resources {
    chain: Option<ProxyChain>,
    relay: Option<LifecycleRelay>,
    mailbox: Option<Box<dyn MailboxClient>>,
    submission: Option<Box<dyn SubmissionClient>>,
    lease: Option<StoreLease>,
}

impl Resources {
    async fn release(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.unsubscribe();
        }
        if let Some(mut client) = self.mailbox.take() {
            if client.is_connected() {
                client.disconnect(true).await;
            }
        }
        if let Some(mut client) = self.submission.take() {
            if client.is_connected() {
                client.disconnect(true).await;
            }
        }
        if let Some(mut chain) = self.chain.take() {
            chain.dispose().await;
        }
        self.lease.take();
    }
}
