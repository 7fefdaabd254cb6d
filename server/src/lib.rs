//! Parley: a clustered real-time messaging server.
//!
//! Clients open long-lived sessions, join named topics, publish messages
//! and receive fan-out broadcasts with receipts, typing indicators and
//! presence. This crate implements the core topic runtime: the per-topic
//! event loop, the access control algebra, the hub, push receipts, and the
//! master/proxy cluster scheme. Transport framing, persistent store
//! backends and push connectors plug in at the seams defined in
//! `domain::hub`, `data::traits` and `domain::push`.

pub mod app;
pub mod core;
pub mod data;
pub mod domain;
