//! # zipstream-api
//!
//! HTTP composition layer for the zipstream download egress service.
//!
//! One inbound `GET /{id}` becomes: an authenticated manifest lookup, a
//! bounded-concurrency fan-out of object fetches guarded by retries and a
//! circuit breaker, and a single serialized write path that interleaves the
//! fetched bytes into an on-the-fly ZIP stream — without ever buffering a
//! whole file or the whole archive.
//!
//! This crate is a thin composition layer: backend behavior lives in
//! `zipstream-core`.
//!
//! ## Endpoints
//!
//! ```text
//! GET /{id}     - Streaming ZIP download (expiry/signature query params)
//! GET /health   - Dependency health (database, storage)
//! GET /metrics  - Prometheus exposition (optional basic auth)
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod assembler;
pub mod callback;
pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod metrics;
pub mod server;
pub mod signature;
