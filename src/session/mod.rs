//! Receive and send sessions over a proxy chain.
//!
//! A session selects a proxy, builds a chain through it, drives a protocol
//! client over the chain's SOCKS endpoint, and releases every resource it
//! acquired no matter how it ends.

pub mod client;
pub mod compose;
pub mod executor;
pub mod stats;
pub mod token;

pub use client::{
    ClientFactory, MailboxAccess, MailboxClient, MailboxStatus, OutboundMessage, ProtocolClient,
    SubmissionClient,
};
pub use executor::{queued_files, SessionExecutor, SessionOutcome};
pub use stats::{ProtocolStats, SessionStats, StatsSnapshot};
pub use token::{CancelReason, SessionToken};
