//! Shared primitives for the Rill service host and pub/sub fabric.
//!
//! This crate carries the value types every other layer speaks: normalized
//! [`Uri`]s, [`Message`]s with ordered headers and cookies, the typed
//! configuration tree, the injectable [`Clock`], and the error taxonomy with
//! its status mapping.

pub mod clock;
pub mod config;
pub mod error;
pub mod headers;
pub mod id;
pub mod message;
pub mod uri;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ConfigNode;
pub use error::{CoreError, Result};
pub use headers::Headers;
pub use message::{Body, Cookie, Message, status};
pub use uri::Uri;
