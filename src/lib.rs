//! `netfs`: a peer-to-peer file-transfer agent for a trusted LAN.
//!
//! The crate is organized around a pluggable [`transport`], a tabular
//! [`record`] store, a permission-gated [`volume`] namespace, LAN
//! [`network`] discovery, a persistent [`task`] engine, the [`server`]
//! composition root, and a typed [`peer`] client. [`config`] and
//! [`error`] are the ambient seams every other module shares.

pub mod config;
pub mod error;
pub mod network;
pub mod peer;
pub mod record;
pub mod server;
pub mod task;
pub mod transport;
pub mod volume;

pub use error::{NetfsError, Result};
