//! Integration tests for receive and send sessions over fake shells and
//! protocol clients.

mod common;

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;

use chainmail::config::SessionConfig;
use chainmail::error::FailureKind;
use chainmail::events::{EngineEvent, SessionMode};
use chainmail::model::account::CurrentAction;
use chainmail::model::proxy::SocksVersion;
use chainmail::session::{SessionOutcome, SessionToken};
use chainmail::store::{Category, MessageStore};

use common::{count, enqueue, fixture, harness, mail_account, Harness, HarnessOptions, Script};

fn regular(n: usize) -> Vec<u8> {
    format!("From: friend{n}@example.org\r\nTo: sender@example.com\r\nSubject: note {n}\r\n\r\nhello {n}\r\n")
        .into_bytes()
}

fn inbox_with_bounce() -> Vec<Vec<u8>> {
    vec![
        regular(1),
        std::fs::read(fixture("qmail_two.eml")).unwrap(),
        regular(2),
    ]
}

fn stored(h: &Harness, category: Category) -> u64 {
    let key = mail_account().store_key();
    let handle = h.store.open(&key).unwrap();
    let n = h.store.count(&handle, category).unwrap();
    h.store.close(&key);
    n
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Chain torn down and client closed.
fn assert_released(h: &Harness) {
    assert_eq!(count(&h.shell.connects), count(&h.shell.disconnects));
    assert_eq!(count(&h.shell.forwards), count(&h.shell.stops));
    assert_eq!(count(&h.clients.connects), count(&h.clients.disconnects));
    assert!(!h.store.is_open(&mail_account().store_key()));
}

// ─── Test 1: receive files bounces apart from regular mail ──────────

#[tokio::test]
async fn test_receive_end_to_end() {
    let h = harness(HarnessOptions {
        script: Script {
            messages: inbox_with_bounce(),
            ..Script::default()
        },
        ..HarnessOptions::default()
    });
    let mut rx = h.events.subscribe();
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(stored(&h, Category::Inbox), 2);
    assert_eq!(stored(&h, Category::Bounces), 1);
    assert_eq!(account.current_action, CurrentAction::None);
    assert_eq!(count(&h.shell.connects), 1);
    assert_released(&h);
    assert_eq!(count(&h.clients.quits), 1);
    assert_eq!(count(&h.clients.deleted), 0);
    assert_eq!(count(&h.clients.expunges), 0);

    let snap = h.executor.stats().receive.snapshot();
    assert_eq!(snap.deleted, 0);
    assert_eq!(snap.total, 3);
    assert_eq!(snap.received, 3);
    assert_eq!(snap.failed, 0);

    let events = drain(&mut rx);
    assert_eq!(
        events.first(),
        Some(&EngineEvent::Begin {
            account: "sender@example.com".into(),
            mode: SessionMode::Receive
        })
    );
    assert!(events.contains(&EngineEvent::DeliveryIn {
        account: "sender@example.com".into(),
        received: 3
    }));
    assert!(events.contains(&EngineEvent::End {
        account: "sender@example.com".into(),
        mode: SessionMode::Receive,
        success: true
    }));
}

// ─── Test 2: client routed through the chain's SOCKS endpoint ───────

#[tokio::test]
async fn test_receive_uses_chain_endpoint() {
    let h = harness(HarnessOptions {
        script: Script {
            messages: vec![regular(1)],
            ..Script::default()
        },
        ..HarnessOptions::default()
    });
    let mut account = mail_account();
    assert!(
        h.executor
            .run(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
            .await
    );

    let socks = h.clients.socks.lock().unwrap().expect("client got an endpoint");
    assert_eq!(socks.version, SocksVersion::V5);
    assert_eq!(socks.port, 1085);
    assert!(socks.host.is_loopback());
}

// ─── Test 3: a failing item is skipped, the rest are stored ─────────

#[tokio::test]
async fn test_per_item_failure_continues() {
    let h = harness(HarnessOptions {
        script: Script {
            messages: inbox_with_bounce(),
            failing_fetch: vec![0],
            ..Script::default()
        },
        ..HarnessOptions::default()
    });
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(stored(&h, Category::Inbox), 1);
    assert_eq!(stored(&h, Category::Bounces), 1);
    let snap = h.executor.stats().receive.snapshot();
    assert_eq!(snap.received, 2);
    assert_eq!(snap.failed, 1);
}

// ─── Test 4: a panic mid-session still releases everything ──────────

#[tokio::test]
async fn test_panic_releases_resources() {
    let h = harness(HarnessOptions {
        script: Script {
            messages: inbox_with_bounce(),
            panic_on_fetch: Some(1),
            ..Script::default()
        },
        ..HarnessOptions::default()
    });
    let mut rx = h.events.subscribe();
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Failed(FailureKind::Unexpected));
    assert_eq!(account.current_action, CurrentAction::None);
    assert_eq!(count(&h.shell.disconnects), 1);
    assert_released(&h);
    assert_eq!(stored(&h, Category::Inbox), 1);

    let events = drain(&mut rx);
    assert!(events.contains(&EngineEvent::End {
        account: "sender@example.com".into(),
        mode: SessionMode::Receive,
        success: false
    }));
}

// ─── Test 5: cancelled before the loop processes nothing ────────────

#[tokio::test]
async fn test_cancelled_before_loop() {
    let h = harness(HarnessOptions {
        script: Script {
            messages: inbox_with_bounce(),
            ..Script::default()
        },
        ..HarnessOptions::default()
    });
    let mut account = mail_account();
    let token = SessionToken::new();
    token.cancel();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &token)
        .await;

    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert_eq!(count(&h.clients.fetched), 0);
    assert_eq!(stored(&h, Category::Inbox), 0);
    assert_released(&h);
}

// ─── Test 6: external cancellation stops between items ──────────────

#[tokio::test]
async fn test_external_cancel_mid_loop() {
    let external = CancellationToken::new();
    let h = harness(HarnessOptions {
        script: Script {
            messages: inbox_with_bounce(),
            cancel_after_fetch: Some((0, external.clone())),
            ..Script::default()
        },
        ..HarnessOptions::default()
    });
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(
            SessionMode::Receive,
            &mut account,
            h.root.path(),
            &SessionToken::with_external(external),
        )
        .await;

    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert_eq!(count(&h.clients.fetched), 1);
    assert_eq!(stored(&h, Category::Inbox), 1);
    assert!(
        !h.executor
            .run(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::unconfigured())
            .await
    );
}

// ─── Test 7: purge marks every stored item and expunges once ────────

#[tokio::test]
async fn test_purge_deletes_and_expunges() {
    let h = harness(HarnessOptions {
        script: Script {
            messages: inbox_with_bounce(),
            failing_fetch: vec![2],
            ..Script::default()
        },
        config: SessionConfig {
            purge: true,
            ..SessionConfig::default()
        },
        ..HarnessOptions::default()
    });
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(count(&h.clients.deleted), 2);
    assert_eq!(count(&h.clients.expunges), 1);
    assert_eq!(
        *h.clients.access.lock().unwrap(),
        Some(chainmail::session::MailboxAccess::ReadWrite)
    );
}

// ─── Test 8: incomplete account never builds a chain ────────────────

#[tokio::test]
async fn test_incomplete_account() {
    let h = harness(HarnessOptions::default());
    let mut rx = h.events.subscribe();
    let mut account = mail_account();
    account.imap = None;

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(
        outcome,
        SessionOutcome::Failed(FailureKind::ConfigurationIncomplete)
    );
    assert_eq!(count(&h.shell.connects), 0);
    assert_eq!(account.current_action, CurrentAction::None);
    assert!(drain(&mut rx).is_empty());
}

// ─── Test 9: no eligible proxy is a transport failure ───────────────

#[tokio::test]
async fn test_no_eligible_proxy() {
    let h = harness(HarnessOptions {
        proxies: Vec::new(),
        ..HarnessOptions::default()
    });
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Failed(FailureKind::Transport));
    assert_eq!(count(&h.shell.connects), 0);
    assert_eq!(count(&h.clients.connects), 0);
}

// ─── Test 10: failed chain leaves the proxy eligible ────────────────

#[tokio::test]
async fn test_chain_failure_keeps_proxy_eligible() {
    let h = harness(HarnessOptions {
        fail_chain: true,
        ..HarnessOptions::default()
    });
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Failed(FailureKind::Transport));
    assert_eq!(count(&h.clients.connects), 0);
    assert!(h.proxies.select(None).await.is_some());
}

// ─── Test 11: client connect failure still disposes the chain ───────

#[tokio::test]
async fn test_connect_failure_disposes_chain() {
    let h = harness(HarnessOptions {
        script: Script {
            fail_connect: true,
            ..Script::default()
        },
        ..HarnessOptions::default()
    });
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Failed(FailureKind::Transport));
    assert_eq!(count(&h.shell.disconnects), 1);
    assert_eq!(count(&h.shell.stops), 1);
}

// ─── Test 12: a hung fetch times out as a per-item failure ──────────

#[tokio::test(start_paused = true)]
async fn test_io_timeout_per_item() {
    let h = harness(HarnessOptions {
        script: Script {
            messages: inbox_with_bounce(),
            hanging_fetch: vec![1],
            ..Script::default()
        },
        config: SessionConfig {
            io_timeout_secs: Some(5),
            ..SessionConfig::default()
        },
        ..HarnessOptions::default()
    });
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(stored(&h, Category::Inbox), 2);
    assert_eq!(stored(&h, Category::Bounces), 0);
    assert_eq!(h.executor.stats().receive.snapshot().failed, 1);
}

// ─── Test 13: send moves delivered files, keeps rejected ones ───────

#[tokio::test]
async fn test_send_archives_and_keeps_failures() {
    let config = SessionConfig::default();
    let h = harness(HarnessOptions {
        script: Script {
            reject_marker: Some("REJECT-ME".into()),
            ..Script::default()
        },
        config: config.clone(),
        ..HarnessOptions::default()
    });
    let queue = enqueue(
        h.root.path(),
        &config,
        &[
            ("001.eml", "To: a@example.org\nSubject: one\n\nfirst\n"),
            ("002.eml", "To: b@example.org\nSubject: REJECT-ME\n\nsecond\n"),
            ("003.eml", "To: c@example.org\nCc: d@example.org\nSubject: three\n\nthird\n"),
        ],
    );
    let mut rx = h.events.subscribe();
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Send, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(account.current_action, CurrentAction::None);
    assert!(!queue.join("001.eml").exists());
    assert!(queue.join("002.eml").exists());
    assert!(!queue.join("003.eml").exists());

    let archived: Vec<_> = walk_files(&h.root.path().join(&config.sent_dir));
    assert_eq!(archived.len(), 2);

    let sent = h.clients.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].recipients, vec!["c@example.org", "d@example.org"]);
    assert_eq!(sent[0].from, "sender@example.com");
    let head = String::from_utf8_lossy(&sent[0].raw);
    assert!(head.contains("From: Sam Sender <sender@example.com>"));
    assert!(head.contains("X-Mailer: "));
    assert!(!head.contains("X-Originating-IP"));

    let snap = h.executor.stats().send.snapshot();
    assert_eq!(snap.sent, 2);
    assert_eq!(snap.failed, 1);
    assert!(drain(&mut rx).contains(&EngineEvent::DeliveryOut {
        account: "sender@example.com".into(),
        sent: 2
    }));
    assert_released(&h);
}

// ─── Test 14: a file left in the queue goes out on the next run ─────

#[tokio::test]
async fn test_send_retries_queued_failure() {
    let config = SessionConfig::default();
    let h = harness(HarnessOptions {
        script: Script {
            reject_marker: Some("REJECT-ME".into()),
            ..Script::default()
        },
        config: config.clone(),
        ..HarnessOptions::default()
    });
    let queue = enqueue(
        h.root.path(),
        &config,
        &[
            ("001.eml", "To: a@example.org\nSubject: one\n\nfirst\n"),
            ("002.eml", "To: b@example.org\nSubject: REJECT-ME\n\nsecond\n"),
        ],
    );
    let mut account = mail_account();

    assert!(
        h.executor
            .run(SessionMode::Send, &mut account, h.root.path(), &SessionToken::new())
            .await
    );
    assert!(queue.join("002.eml").exists());

    std::fs::write(queue.join("002.eml"), "To: b@example.org\nSubject: two\n\nsecond\n").unwrap();
    let outcome = h
        .executor
        .execute(SessionMode::Send, &mut account, h.root.path(), &SessionToken::new())
        .await;

    assert_eq!(outcome, SessionOutcome::Completed);
    assert!(!queue.join("002.eml").exists());
    assert_eq!(walk_files(&h.root.path().join(&config.sent_dir)).len(), 2);

    let sent = h.clients.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].recipients, vec!["b@example.org"]);
    assert_eq!(h.executor.stats().send.snapshot().sent, 2);
    assert_released(&h);
}

// ─── Test 15: empty mailbox with a cancelled token is not success ───

#[tokio::test]
async fn test_cancelled_empty_mailbox() {
    let h = harness(HarnessOptions::default());
    let mut account = mail_account();
    let token = SessionToken::new();
    token.cancel();

    let outcome = h
        .executor
        .execute(SessionMode::Receive, &mut account, h.root.path(), &token)
        .await;
    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert_released(&h);

    assert!(
        !h.executor
            .run(SessionMode::Receive, &mut account, h.root.path(), &SessionToken::unconfigured())
            .await
    );
    assert_eq!(account.current_action, CurrentAction::None);
}

// ─── Test 16: cancelled send leaves the whole queue in place ────────

#[tokio::test]
async fn test_cancelled_send_keeps_queue() {
    let config = SessionConfig::default();
    let h = harness(HarnessOptions {
        config: config.clone(),
        ..HarnessOptions::default()
    });
    let queue = enqueue(
        h.root.path(),
        &config,
        &[("001.eml", "To: a@example.org\nSubject: one\n\nfirst\n")],
    );
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Send, &mut account, h.root.path(), &SessionToken::unconfigured())
        .await;

    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert!(queue.join("001.eml").exists());
    assert!(h.clients.sent.lock().unwrap().is_empty());
    assert_released(&h);
}

// ─── Test 17: empty queue is no work and builds no chain ────────────

#[tokio::test]
async fn test_send_empty_queue() {
    let h = harness(HarnessOptions::default());
    let mut account = mail_account();

    let outcome = h
        .executor
        .execute(SessionMode::Send, &mut account, h.root.path(), &SessionToken::new())
        .await;
    assert_eq!(outcome, SessionOutcome::NoWork);
    assert_eq!(count(&h.shell.connects), 0);
    assert!(
        !h.executor
            .run(SessionMode::Send, &mut account, h.root.path(), &SessionToken::new())
            .await
    );
}

// ─── Test 18: origin header carries the chain's egress address ──────

#[tokio::test]
async fn test_send_stamps_egress_ip() {
    let config = SessionConfig {
        fake_origin_ip: true,
        ..SessionConfig::default()
    };
    let h = harness(HarnessOptions {
        config: config.clone(),
        ..HarnessOptions::default()
    });
    enqueue(
        h.root.path(),
        &config,
        &[("001.eml", "To: a@example.org\nSubject: hi\n\nbody\n")],
    );
    let mut account = mail_account();

    assert!(
        h.executor
            .run(SessionMode::Send, &mut account, h.root.path(), &SessionToken::new())
            .await
    );

    let sent = h.clients.sent.lock().unwrap().clone();
    let egress: IpAddr = "198.51.100.20".parse().unwrap();
    assert!(String::from_utf8_lossy(&sent[0].raw).contains(&format!("[{egress}]")));
}

fn walk_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path));
        } else {
            out.push(path);
        }
    }
    out
}
