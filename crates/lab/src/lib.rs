//! Session lifecycle and reconciliation subsystem for the lab platform.
//!
//! Exposed as a library so integration tests (and embedders) can build the
//! API router and services in-process.

pub mod api;
pub mod browser;
pub mod bus;
pub mod db;
pub mod error;
pub mod events;
pub mod github;
pub mod monitor;
pub mod orchestrate;
pub mod ports;
pub mod project;
pub mod prompts;
pub mod proxy;
pub mod sandbox;
pub mod session;
pub mod settings;
pub mod sse;
