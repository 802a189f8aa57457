//! Stitch Server Library
//!
//! Chunked upload engine and its HTTP surface. The server binary is in
//! main.rs.
//!
//! # Modules
//!
//! - `upload`: Chunk staging, ordered merge, instant-upload lookup and hashing
//! - `routes`: Axum handlers exposing the upload protocol
//! - `config`: Environment-driven configuration

pub mod config;
pub mod routes;
pub mod state;
pub mod upload;
