//! Real-time messaging and notification router.
//!
//! Users talk to each other or to a shared support pool over persistent
//! WebSocket connections; an HTTP surface mirrors the same operations for
//! clients without a live connection.

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod identity;
pub mod notify;
pub mod protocol;
pub mod read_state;
pub mod registry;
pub mod routing;
pub mod server;
pub mod web;
