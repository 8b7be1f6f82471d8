//! Plain-text bounces in the qmail-send layout.
//!
//! ```text
//! Hi. This is the qmail-send program at mx.example.com.
//! I'm afraid I wasn't able to deliver your message to the following addresses.
//!
//! <user@example.org>:
//! Remote host said: 550 5.1.1 mailbox unavailable
//!
//! --- Below this line is a copy of the message.
//!
//! <original message>
//! ```

use std::sync::LazyLock;

use mail_parser::{Message, MimeHeaders, PartType};
use regex::Regex;

use super::{BounceKind, BounceResult, StatusRecord, ACTION_FAILED, DEFAULT_STATUS};

/// Opening words of every bounce this detector accepts.
pub const GREETING: &str = "Hi. This is the qmail-send program at";

/// Diagnostic of the synthetic record emitted when no paragraph matched.
pub const NO_PARAGRAPHS: &str = "no failure paragraphs found.";

/// A dash-prefixed line followed by a blank line: end of the notification.
static DELIMITER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^-[^\n]*\n[ \t]*(?:\n|$)").expect("valid regex"));

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("valid regex"));

static ADDRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<([^<>\s]+)>:?\s*$").expect("valid regex"));

/// Enhanced status code (`class.subject.detail`); the first match on the
/// first matching line wins.
static STATUS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d\.\d+\.\d+").expect("valid regex"));

/// Classify `msg` if its primary body is a qmail-style plain-text bounce.
pub fn detect(msg: &Message<'_>) -> Option<BounceResult> {
    let text = primary_plain_text(msg)?;
    detect_text(text)
}

/// Text-level detector; `None` unless `text` starts with [`GREETING`].
pub fn detect_text(text: &str) -> Option<BounceResult> {
    let text = text.replace("\r\n", "\n");
    if !text.trim_start().starts_with(GREETING) {
        return None;
    }

    let (head, original) = match DELIMITER.find(&text) {
        Some(m) => (&text[..m.start()], Some(&text[m.end()..])),
        None => (text.as_str(), None),
    };

    let mut paragraphs = PARAGRAPH_BREAK
        .split(head)
        .map(str::trim)
        .filter(|p| !p.is_empty());
    // The first paragraph is the introduction.
    paragraphs.next();

    let mut records: Vec<StatusRecord> = paragraphs.filter_map(parse_paragraph).collect();
    if records.is_empty() {
        records.push(StatusRecord {
            recipient: String::new(),
            action: ACTION_FAILED.to_string(),
            status_code: DEFAULT_STATUS.to_string(),
            diagnostic: NO_PARAGRAPHS.to_string(),
        });
    }

    Some(BounceResult {
        is_bounce: true,
        kind: Some(BounceKind::Heuristic),
        status_records: records,
        notification_body: head.trim_end().to_string(),
        original_message: original
            .map(|o| o.trim_start_matches('\n'))
            .filter(|o| !o.trim().is_empty())
            .map(|o| o.as_bytes().to_vec()),
        delivery_status: None,
    })
}

/// One recipient paragraph: `<address>:` on the first line, free text after.
fn parse_paragraph(paragraph: &str) -> Option<StatusRecord> {
    let (first, rest) = paragraph.split_once('\n').unwrap_or((paragraph, ""));
    let recipient = ADDRESS_LINE.captures(first.trim())?.get(1)?.as_str();

    let status_code = rest
        .lines()
        .find_map(|line| STATUS_CODE.find(line))
        .map_or(DEFAULT_STATUS, |m| m.as_str());

    let diagnostic = rest
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Some(StatusRecord {
        recipient: recipient.to_string(),
        action: ACTION_FAILED.to_string(),
        status_code: status_code.to_string(),
        diagnostic,
    })
}

/// The root body if it is `text/plain` (or untyped) text.
fn primary_plain_text<'a>(msg: &'a Message<'_>) -> Option<&'a str> {
    let root = msg.root_part();
    if let Some(ct) = root.content_type() {
        let plain = ct.ctype().eq_ignore_ascii_case("text")
            && ct.subtype().is_none_or(|s| s.eq_ignore_ascii_case("plain"));
        if !plain {
            return None;
        }
    }
    match &root.body {
        PartType::Text(text) => Some(text.as_ref()),
        _ => None,
    }
}
