//! Traffic duplication
//!
//! This module implements the core of the relay: splitting an inbound
//! request into a primary and a shadow copy, sending each to its backend,
//! and relaying the primary's response to the caller.

pub mod backend;
pub mod dispatcher;
pub mod duplicator;
pub mod relay;
pub mod upstream;

pub use backend::BackendResponse;
pub use dispatcher::DualDispatcher;
pub use duplicator::{Duplicate, duplicate};
pub use relay::{RelayOutcome, relay};
pub use upstream::BackendClient;
