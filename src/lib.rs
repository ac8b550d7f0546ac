//! Wakegate - a gateway that fronts idled Jenkins CI pods
//!
//! This library provides an HTTP gateway that:
//! - Classifies inbound traffic into webhook and UI flows by a marker header
//! - Resolves requests to tenant namespaces via external directory services
//! - Wakes idled pods on demand through a lifecycle (idler) backend
//! - Buffers webhook events durably in sqlite and replays them once the pod runs
//! - Routes browser sessions to pod routes via cookie-keyed TTL caches
//! - Reverse-proxies UI traffic with redirect-aware gateway error handling

pub mod buffer;
pub mod cache;
pub mod clients;
pub mod config;
pub mod cookies;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod pod;
pub mod proxy;
pub mod resolver;
pub mod store;
pub mod ui;

/// Boxed response/request body used throughout the proxy data path
pub type GatewayBody =
    http_body_util::combinators::BoxBody<hyper::body::Bytes, hyper::Error>;
