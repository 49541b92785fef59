//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `auth`: JWT validation and identity resolution
//! - `config`: Application configuration and settings
//! - `error`: Unified error types
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection pool and retry backoff

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
