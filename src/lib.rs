//! Flowproxy - control plane for a cluster of HAProxy instances
//!
//! This library:
//! - Accepts service registration, removal and certificate requests over HTTP
//! - Persists every service in a registry (Consul KV or local files)
//! - Rebuilds the complete HAProxy configuration from the registry on every change
//! - Checks the rendered configuration with HAProxy before swapping it in
//! - Replays mutating requests against every sibling instance so the cluster converges

pub mod api;
pub mod certs;
pub mod config;
pub mod distribute;
pub mod engine;
pub mod error;
pub mod listener;
pub mod reconfigure;
pub mod registry;
pub mod remove;
pub mod service;
