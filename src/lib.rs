//! SLA aggregation, caching and site reconciliation engine.
//!
//! Module map (EMBP: each module exposes its surface through `mod.rs` or its
//! single file, and `main.rs` only talks to the gateways):
//! - `config`     – environment configuration
//! - `schema`     – idempotent table creation
//! - `store`      – storage traits with Postgres and in-memory backends
//! - `cache`      – get-or-compute cache with range invalidation
//! - `registry`   – sites registry client and snapshot
//! - `spreadsheet`, `loader` – upload parsing and bulk insert
//! - `aggregator` – daily/weekly/monthly/detail/master views
//! - `nms`, `reconcile` – NMS inventory client and site status sync
//! - `export`     – telemetry xlsx export
//! - `routes`     – HTTP gateway

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod loader;
pub mod models;
pub mod nms;
pub mod reconcile;
pub mod registry;
pub mod routes;
pub mod schema;
pub mod spreadsheet;
pub mod store;

pub use config::Config;
pub use error::{SlaError, SlaResult};
