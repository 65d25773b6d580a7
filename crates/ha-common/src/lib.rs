//! Common types shared across the XRd HA app crates.

pub mod logging;
pub mod net;
pub mod types;

pub use net::Ipv4Net;
pub use types::{DisconnectReason, VrrpEvent, VrrpRole, VrrpSession};
