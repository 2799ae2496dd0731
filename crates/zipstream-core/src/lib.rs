//! # zipstream-core
//!
//! Backend building blocks for the zipstream download egress service.
//!
//! This crate provides everything below the HTTP surface:
//!
//! - **Error Types**: the shared failure taxonomy (missing vs. transient vs.
//!   permanent) that drives retry and partial-download semantics
//! - **Manifest Model**: the stored record describing one download
//! - **Manifest Stores**: tabular (Postgres/MySQL) and key-value (Redis)
//!   lookup backends with startup schema detection
//! - **Object Storage**: S3-compatible and local-filesystem fetch backends
//!   behind a retrying, breaker-guarded front
//! - **Circuit Breaker**: the per-backend failure isolation state machine
//!
//! The HTTP composition layer lives in `zipstream-api`; request code never
//! constructs backends itself, it only calls the traits defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod breaker;
pub mod db;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod observability;
pub mod storage;

pub use error::{Error, Result};
pub use manifest::DownloadManifest;
