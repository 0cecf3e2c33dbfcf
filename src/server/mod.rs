//! Frontend listener.

pub mod listener;
