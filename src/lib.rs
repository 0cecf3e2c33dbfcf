//! teeproxy - HTTP traffic duplication
//!
//! Accepts HTTP/1.x requests and forwards a copy of each one to a primary
//! and a shadow backend. The primary's response goes back to the caller; the
//! shadow's is drained and discarded.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod server;
pub mod tls;
