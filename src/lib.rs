//! `chainmail` — a mail-transfer engine that receives and sends mail through
//! rotating, chained SOCKS-over-SSH proxies.
//!
//! This crate provides the account and proxy pools, the proxy chain builder,
//! the session executor, and the delivery-failure (bounce) classifier.

pub mod bounce;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod model;
pub mod parser;
pub mod pool;
pub mod session;
pub mod store;
