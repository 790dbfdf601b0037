//! Authenticated access to the J-Quants API
//!
//! This module provides the low-level client that exchanges a long-lived
//! refresh token for short-lived ID tokens and issues bearer-authenticated
//! GET requests with transient-failure retry.

mod client;

pub use client::{
    to_records, unwrap_envelope, ApiClient, ApiError, ClientConfig, DEFAULT_BASE_URL,
    REFRESH_TOKEN_ENV,
};
