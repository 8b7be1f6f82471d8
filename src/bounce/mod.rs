//! Bounce classification.
//!
//! [`detect`] is a pure function of the message bytes: a qmail-style
//! plain-text detector runs first, then a generic walk for a
//! `multipart/report` delivery-status notification.

pub mod dsn;
pub mod heuristic;

use mail_parser::{Message, MessageParser};
use serde::Serialize;

/// Status code used when none could be recovered.
pub const DEFAULT_STATUS: &str = "5.3.0";

pub const ACTION_FAILED: &str = "failed";

/// Which detector recognised the bounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BounceKind {
    Heuristic,
    DeliveryStatus,
}

/// One failed (or delayed) recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub recipient: String,
    pub action: String,
    pub status_code: String,
    pub diagnostic: String,
}

/// Outcome of [`detect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BounceResult {
    pub is_bounce: bool,
    pub kind: Option<BounceKind>,
    /// Filled by the plain-text detector; empty for delivery-status reports
    /// (see [`BounceResult::delivery_status_records`]).
    pub status_records: Vec<StatusRecord>,
    pub notification_body: String,
    pub original_message: Option<Vec<u8>>,
    /// Raw `message/delivery-status` block of a report.
    pub delivery_status: Option<String>,
}

impl BounceResult {
    pub fn not_bounce() -> Self {
        Self::default()
    }

    /// Status records, parsing the raw delivery-status block if that is all
    /// the result carries.
    pub fn delivery_status_records(&self) -> Vec<StatusRecord> {
        match &self.delivery_status {
            Some(block) if self.status_records.is_empty() => dsn::parse_status_block(block),
            _ => self.status_records.clone(),
        }
    }
}

/// Classify a raw RFC 5322 message.
pub fn detect(raw: &[u8]) -> BounceResult {
    match MessageParser::default().parse(raw) {
        Some(msg) => detect_message(&msg),
        None => BounceResult::not_bounce(),
    }
}

/// Classify an already parsed message.
pub fn detect_message(msg: &Message<'_>) -> BounceResult {
    heuristic::detect(msg)
        .or_else(|| dsn::detect(msg))
        .unwrap_or_default()
}
