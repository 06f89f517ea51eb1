//! Domain types - suite entities and configuration
//!
//! These types are shared by the launcher and the daemon and are independent
//! of the transports that carry them.

pub mod config;
pub mod suite;
