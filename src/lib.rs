#![forbid(unsafe_code)]

//! Library half of the TubeShare backend.
//!
//! The binary in `src/bin/backend.rs` only wires HTTP routes together; the
//! storage, engagement bookkeeping and media streaming all live here so they
//! can be exercised directly from tests.

pub mod blob;
pub mod catalog;
pub mod config;
pub mod engagement;
pub mod error;
pub mod media;
pub mod security;
