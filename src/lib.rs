//! Codedrop Server Library
//!
//! Chunked uploads that end in a short numeric share code. A code allows a
//! limited number of downloads before it expires.
//!
//! # Modules
//!
//! - `transfer`: Upload sessions, artifacts, share codes and sweeping
//! - `persistence`: Durable records for the transfer state
//! - `routes`: HTTP surface
//! - `config`: Environment-driven configuration

pub mod config;
pub mod persistence;
pub mod routes;
pub mod state;
pub mod transfer;
