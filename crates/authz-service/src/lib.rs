//! Authorization & Credit Core Library
//!
//! This library provides tenant authorization and credit accounting on top of
//! a Postgres + row-level-security backend and a Redis-compatible key-value
//! store. It is transport-agnostic: the host embeds [`core::AuthzCore`]
//! behind whatever inbound layer it chooses.
//!
//! # Modules
//!
//! - `config` - Service configuration
//! - `core` - Composition root and inbound operation surface
//! - `cache` - Multi-tier cache (in-process TTL map + Redis)
//! - `credential` - Privileged service credential gate
//! - `db` - Connection pools, circuit breaker, query executor
//! - `errors` - Error types
//! - `models` - Data models
//! - `observability` - Metrics and the performance monitor
//! - `services` - User resolver, authorization engine, credit engine
//! - `token` - Bearer token classification and validation

pub mod cache;
pub mod config;
pub mod core;
pub mod credential;
pub mod db;
pub mod errors;
pub mod models;
pub mod observability;
pub mod services;
pub mod token;
