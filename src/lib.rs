//! # axnc-rs
//!
//! Notification center event pipeline.
//!
//! Events are produced against a registry of codes, routed by user rules,
//! fanned out onto a partitioned per-channel log, and delivered by channel
//! handlers (email, chat, UI store, support archive). Postgres backs the
//! log and the stores; an axum surface manages rules and stored events.

pub mod api;
pub mod codes;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod model;
pub mod producer;
pub mod retry;
pub mod rules;
pub mod store;
pub mod telemetry;
pub mod transport;
