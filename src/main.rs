//! CLI entry point for `chainmail`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use chainmail::bounce::{self, BounceResult};
use chainmail::chain::{tunnel, ChainSettings, ProxyChainBuilder, Ssh2Connector};
use chainmail::config::{self, Config};
use chainmail::events::{EngineEvent, EventBus, PoolKind};
use chainmail::model::account::MailAccount;
use chainmail::model::proxy::{ProxyAccount, SocksVersion};
use chainmail::pool::{AccountPool, PoolEntry, ProxyCredentials};
use chainmail::session::queued_files;

#[derive(Parser)]
#[command(
    name = "chainmail",
    version,
    about = "Receive and send mail through rotating SOCKS-over-SSH proxy chains"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Proxy account file (overrides the configured one)
    #[arg(long, global = true, value_name = "FILE", env = "CHAINMAIL_PROXIES")]
    proxies_file: Option<PathBuf>,

    /// Mail account file (overrides the configured one)
    #[arg(long, global = true, value_name = "FILE", env = "CHAINMAIL_ACCOUNTS")]
    accounts_file: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify message files as bounces or regular mail
    Classify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Inspect and select proxy accounts
    Proxies {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// Inspect mail accounts
    Accounts {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Build a proxy chain and hold the local SOCKS forward open until Ctrl-C
    Forward {
        /// Proxy host to use instead of a random pick
        #[arg(long)]
        proxy: Option<String>,
        /// SOCKS version (v4 or v5)
        #[arg(long)]
        kind: Option<SocksVersion>,
    },
    /// List pending outbound messages below an account root
    Queue { root: PathBuf },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Subcommand)]
enum ProxyAction {
    /// List every proxy account
    List,
    /// Pick an eligible proxy at random
    Select {
        #[arg(long)]
        kind: Option<SocksVersion>,
    },
    /// Find a proxy by host or login@host
    Find { identity: String },
}

#[derive(Subcommand)]
enum AccountAction {
    /// List every mail account
    List,
    /// Find an account by login or address
    Find { identity: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _guard = setup_logging(log_level, &config);

    let proxies_file = cli
        .proxies_file
        .unwrap_or_else(|| config.pool.proxies_file.clone());
    let accounts_file = cli
        .accounts_file
        .unwrap_or_else(|| config.pool.accounts_file.clone());

    match cli.command {
        Commands::Classify { files, json } => cmd_classify(&files, json),
        Commands::Proxies { action } => cmd_proxies(action, &proxies_file),
        Commands::Accounts { action } => cmd_accounts(action, &accounts_file),
        Commands::Forward { proxy, kind } => {
            cmd_forward(&config, &proxies_file, proxy.as_deref(), kind).await
        }
        Commands::Queue { root } => cmd_queue(&root, &config),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
///
/// The returned guard flushes the file writer when dropped.
fn setup_logging(
    level: &str,
    config: &Config,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "chainmail.log");
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        None
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "chainmail", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

// ── classify ────────────────────────────────────────────────────

fn cmd_classify(files: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Classifying [{bar:40.cyan/blue}] {pos}/{len}")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let mut results = Vec::with_capacity(files.len());
    for path in files {
        let raw = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        results.push((path.as_path(), bounce::detect(&raw)));
        pb.inc(1);
    }
    pb.finish_and_clear();
    tracing::info!(files = files.len(), elapsed = ?start.elapsed(), "Classification done");

    if json {
        print_classify_json(&results)
    } else {
        print_classify_table(&results);
        Ok(())
    }
}

fn print_classify_table(results: &[(&Path, BounceResult)]) {
    println!();
    println!(
        "  {:<40} {:<8} {:<16} {:<8} {}",
        "File", "Bounce", "Kind", "Status", "Recipient"
    );
    println!("  {}", "-".repeat(98));

    for (path, result) in results {
        let name: String = path.display().to_string().chars().take(39).collect();
        let kind = result
            .kind
            .map(|k| format!("{k:?}"))
            .unwrap_or_else(|| "-".to_string());
        let records = result.delivery_status_records();
        let (status, recipient) = records
            .first()
            .map(|r| (r.status_code.as_str(), r.recipient.as_str()))
            .unwrap_or(("-", "-"));
        println!(
            "  {:<40} {:<8} {:<16} {:<8} {}",
            name,
            if result.is_bounce { "yes" } else { "no" },
            kind,
            status,
            recipient
        );
        for extra in records.iter().skip(1) {
            println!(
                "  {:<40} {:<8} {:<16} {:<8} {}",
                "", "", "", extra.status_code, extra.recipient
            );
        }
    }
    println!();
}

fn print_classify_json(results: &[(&Path, BounceResult)]) -> anyhow::Result<()> {
    let items: Vec<serde_json::Value> = results
        .iter()
        .map(|(path, result)| {
            serde_json::json!({
                "file": path.to_string_lossy(),
                "is_bounce": result.is_bounce,
                "kind": result.kind,
                "status_records": result.delivery_status_records(),
                "has_original": result.original_message.is_some(),
            })
        })
        .collect();

    let bounces = results.iter().filter(|(_, r)| r.is_bounce).count();
    let output = serde_json::json!({
        "file_count": results.len(),
        "bounce_count": bounces,
        "results": items,
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ── pools ───────────────────────────────────────────────────────

fn load_proxies(path: &Path, events: EventBus) -> anyhow::Result<AccountPool<ProxyAccount>> {
    let mut pool =
        AccountPool::new(PoolKind::Proxies, events).with_eligibility(ProxyCredentials);
    if !pool.load(path) {
        anyhow::bail!("no proxy accounts loaded from {}", path.display());
    }
    Ok(pool)
}

fn load_accounts(path: &Path) -> anyhow::Result<AccountPool<MailAccount>> {
    let mut pool = AccountPool::new(PoolKind::Accounts, EventBus::default());
    if !pool.load(path) {
        anyhow::bail!("no mail accounts loaded from {}", path.display());
    }
    Ok(pool)
}

fn cmd_proxies(action: ProxyAction, path: &Path) -> anyhow::Result<()> {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let mut pool = load_proxies(path, events)?;

    match action {
        ProxyAction::List => {
            let now = chrono::Utc::now();
            println!();
            println!(
                "  {:<4} {:<32} {:<16} {:<5} {:<8} {:<8} {}",
                "#", "Host", "Login", "Kind", "Enabled", "Expired", "Label"
            );
            println!("  {}", "-".repeat(90));
            for (i, proxy) in pool.entries().iter().enumerate() {
                println!(
                    "  {:<4} {:<32} {:<16} {:<5} {:<8} {:<8} {}",
                    i + 1,
                    proxy.host.chars().take(31).collect::<String>(),
                    proxy.login.chars().take(15).collect::<String>(),
                    proxy.kind,
                    if proxy.enabled { "yes" } else { "no" },
                    if proxy.is_expired(now) { "yes" } else { "no" },
                    proxy.label.as_deref().unwrap_or("")
                );
            }
            println!();
        }
        ProxyAction::Select { kind } => {
            let picked = pool.select(kind).map(ProxyAccount::key);
            while let Ok(event) = rx.try_recv() {
                if let EngineEvent::DateExpired { id, .. } = event {
                    eprintln!("  skipped expired proxy {id}");
                }
            }
            match picked {
                Some(key) => println!("{key}"),
                None => anyhow::bail!("no eligible proxy account"),
            }
        }
        ProxyAction::Find { identity } => match pool.find(&identity) {
            Some(proxy) => println!("{} ({})", proxy.key(), proxy.kind),
            None => anyhow::bail!("no enabled proxy matches '{identity}'"),
        },
    }
    Ok(())
}

fn cmd_accounts(action: AccountAction, path: &Path) -> anyhow::Result<()> {
    let pool = load_accounts(path)?;

    match action {
        AccountAction::List => {
            println!();
            println!(
                "  {:<4} {:<32} {:<6} {:<8} {:<8} {}",
                "#", "Address", "Recv", "Enabled", "Receive", "Send"
            );
            println!("  {}", "-".repeat(80));
            for (i, account) in pool.entries().iter().enumerate() {
                println!(
                    "  {:<4} {:<32} {:<6} {:<8} {:<8} {}",
                    i + 1,
                    account.address().chars().take(31).collect::<String>(),
                    format!("{:?}", account.receive_protocol).to_lowercase(),
                    if account.enabled { "yes" } else { "no" },
                    if account.require_receive().is_ok() { "ready" } else { "-" },
                    if account.require_send().is_ok() { "ready" } else { "-" },
                );
            }
            println!();
        }
        AccountAction::Find { identity } => match pool.find(&identity) {
            Some(account) => println!("{} ({})", account.address(), account.login),
            None => anyhow::bail!("no enabled account matches '{identity}'"),
        },
    }
    Ok(())
}

// ── forward ─────────────────────────────────────────────────────

async fn cmd_forward(
    config: &Config,
    path: &Path,
    proxy: Option<&str>,
    kind: Option<SocksVersion>,
) -> anyhow::Result<()> {
    let events = EventBus::default();
    let mut pool = load_proxies(path, events.clone())?;

    let picked = match proxy {
        Some(name) => {
            if !pool.select_by_name(name) {
                anyhow::bail!("proxy '{name}' is not eligible");
            }
            pool.selected().cloned()
        }
        None => pool.select(kind).cloned(),
    };
    let Some(picked) = picked else {
        anyhow::bail!("no eligible proxy account");
    };

    let builder = ProxyChainBuilder::new(
        Arc::new(Ssh2Connector),
        tunnel::from_config(&config.chain),
        ChainSettings::from(&config.chain),
        events.clone(),
    );
    let Some(mut chain) = builder.build(&picked).await else {
        anyhow::bail!("could not build a chain through {}", picked.key());
    };

    println!(
        "  SOCKS{} forward on {} via {}",
        if chain.socks().version == SocksVersion::V4 { "4" } else { "5" },
        chain.socks().socket_addr(),
        chain.proxy()
    );
    if let Some(ip) = chain.egress_ip() {
        println!("  Egress address {ip}");
    }
    println!("  Press Ctrl-C to stop");

    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Ok(EngineEvent::ForwardRequest { target, .. }) => tracing::info!(%target, "CONNECT"),
                Ok(EngineEvent::ForwardError { message, .. }) => tracing::warn!(%message, "Forward error"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    chain.dispose().await;
    Ok(())
}

// ── queue ───────────────────────────────────────────────────────

fn cmd_queue(root: &Path, config: &Config) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let queue = root.join(&config.session.queue_dir);
    let files = queued_files(&queue)?;

    println!();
    println!("  {} pending message(s) in {}", files.len(), queue.display());
    if files.is_empty() {
        println!();
        return Ok(());
    }
    println!();

    let mut total = 0u64;
    for path in &files {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        total += size;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!("  {:<50} {:>10}", name, format_size(size, BINARY));
    }
    println!("  {}", "-".repeat(61));
    println!("  {:<50} {:>10}", "Total", format_size(total, BINARY));
    println!();
    Ok(())
}
