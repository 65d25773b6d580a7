//! VRRP session types, as tracked within this application.

use std::fmt;

/// A VRRP session key, consisting of XR interface name and VRID.
///
/// Used for registered actions and received telemetry notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VrrpSession {
    pub interface_name: String,
    pub vrid: u8,
}

impl VrrpSession {
    pub fn new(interface_name: impl Into<String>, vrid: u8) -> Self {
        Self {
            interface_name: interface_name.into(),
            vrid,
        }
    }
}

impl fmt::Display for VrrpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<xr_interface={},vrid={}>", self.interface_name, self.vrid)
    }
}

/// VRRP session role. Only the active side should attract traffic for the
/// group's virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrrpRole {
    Inactive,
    Active,
}

impl fmt::Display for VrrpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VrrpRole::Inactive => write!(f, "INACTIVE"),
            VrrpRole::Active => write!(f, "ACTIVE"),
        }
    }
}

/// A role observation for a VRRP session, extracted from one telemetry
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpEvent {
    pub session: VrrpSession,
    pub role: VrrpRole,
}

impl VrrpEvent {
    pub fn new(session: VrrpSession, role: VrrpRole) -> Self {
        Self { session, role }
    }
}

/// Why a telemetry stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer completed or half-closed the stream.
    ClosedByPeer,
    /// The underlying transport failed (keepalive timeout, reset, ...).
    TransportLost,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClosedByPeer => write!(f, "closed by peer"),
            DisconnectReason::TransportLost => write!(f, "transport lost"),
        }
    }
}
