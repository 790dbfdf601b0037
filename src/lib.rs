//! J-Quants API client with transparent snapshot caching
//!
//! This crate exposes two layers: [`api::ApiClient`], which owns the
//! access-token lifecycle and issues authenticated requests with transient
//! retry, and [`cache::CachedClient`], which serves previously captured
//! snapshots whenever one satisfies a caller-supplied freshness threshold.

pub mod api;
pub mod cache;
pub mod cli;
