//! Sovereign: mode governance for an AI runtime.
//!
//! Decides whether the runtime may operate ONLINE, OFFLINE, SOVEREIGN, or in
//! QUARANTINE, which locally stored model bundle it may use, and records
//! every governed decision in a tamper-evident audit chain.
//!
//! See `DESIGN.md` for the architecture and its decisions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod audit;
pub mod bundle;
pub mod network;
pub mod signals;

pub mod governance;
pub mod service;
