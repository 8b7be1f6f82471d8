//! Core data model types: mail accounts, proxy accounts, and addresses.

pub mod account;
pub mod address;
pub mod proxy;
