//! Standard delivery-status notifications (`multipart/report`).

use mail_parser::{Message, MessagePart, MimeHeaders, PartType};

use crate::parser::header::{field_groups, get_header};

use super::{BounceKind, BounceResult, StatusRecord, ACTION_FAILED, DEFAULT_STATUS};

/// Nesting limit when descending into attached messages.
const MAX_DEPTH: usize = 4;

/// Find a delivery-status report anywhere in `msg`.
///
/// The report's second part is kept as the raw status block and its third
/// part as the original message; neither is parsed further here.
pub fn detect(msg: &Message<'_>) -> Option<BounceResult> {
    find_report(msg, 0)
}

fn find_report(msg: &Message<'_>, depth: usize) -> Option<BounceResult> {
    for part in &msg.parts {
        match &part.body {
            PartType::Multipart(children) if is_delivery_report(part) => {
                let child = |n: usize| children.get(n).and_then(|&id| msg.parts.get(id));
                return Some(BounceResult {
                    is_bounce: true,
                    kind: Some(BounceKind::DeliveryStatus),
                    status_records: Vec::new(),
                    notification_body: child(0).map(part_text).unwrap_or_default(),
                    delivery_status: child(1).map(part_text),
                    original_message: child(2).map(|p| p.contents().to_vec()),
                });
            }
            PartType::Message(inner) if depth < MAX_DEPTH => {
                if let Some(found) = find_report(inner, depth + 1) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

/// `multipart/report` whose report-type is absent or `delivery-status`.
fn is_delivery_report(part: &MessagePart<'_>) -> bool {
    part.content_type().is_some_and(|ct| {
        ct.ctype().eq_ignore_ascii_case("multipart")
            && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("report"))
            && ct
                .attribute("report-type")
                .is_none_or(|t| t.eq_ignore_ascii_case("delivery-status"))
    })
}

fn part_text(part: &MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.to_string(),
        _ => String::from_utf8_lossy(part.contents()).into_owned(),
    }
}

/// Parse per-recipient groups of a raw `message/delivery-status` block.
pub fn parse_status_block(block: &str) -> Vec<StatusRecord> {
    field_groups(block)
        .iter()
        .filter_map(|fields| {
            let recipient = get_header(fields, "final-recipient")
                .or_else(|| get_header(fields, "original-recipient"))?;
            Some(StatusRecord {
                recipient: strip_type(recipient).trim_matches(['<', '>']).to_string(),
                action: get_header(fields, "action")
                    .map_or(ACTION_FAILED, str::trim)
                    .to_ascii_lowercase(),
                status_code: get_header(fields, "status")
                    .and_then(|s| s.split_whitespace().next())
                    .unwrap_or(DEFAULT_STATUS)
                    .to_string(),
                diagnostic: get_header(fields, "diagnostic-code")
                    .map(|d| strip_type(d).to_string())
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Drop an RFC 3464 type prefix such as `rfc822;` or `smtp;`.
fn strip_type(value: &str) -> &str {
    match value.split_once(';') {
        Some((kind, rest)) if !kind.contains(char::is_whitespace) => rest.trim(),
        _ => value.trim(),
    }
}
