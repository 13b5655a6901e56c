//! # Deployment engine and content-addressed store for sandboxed apps
//!
//! This crate implements the core of a sandboxed-application distribution
//! system: an OCI-style registry client over local layouts and HTTP, a
//! content-addressed repo of commits and trees, a per-installation
//! deployment directory manager with atomic activation, and a facility for
//! grafting host subtrees into the mount namespace of a live application.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod bundle;
pub mod cli;
pub mod config;
pub mod delta;
pub mod deploy;
pub mod digest;
pub mod errors;
pub mod exports;
pub mod inject;
pub mod installation;
pub mod instance;
pub mod keyfile;
pub mod oci;
pub mod ocidir;
pub mod pull;
pub mod refspec;
pub mod registry;
pub mod repo;
pub mod sign;
