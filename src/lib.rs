//! credstore - mutual-TLS identity and trust management for HTTP clients
//!
//! This crate loads credential stores (identity material and trust anchors),
//! selects the client certificate to present per destination host, builds
//! OpenSSL client contexts under different trust policies and offers the
//! certificate introspection helpers used for diagnostics.

pub mod resource;
pub mod security;
