//! XRd HA app telemetry endpoint.
//!
//! Accepts the paired router's model-driven telemetry dial-out stream and
//! passes decoded VRRP role observations to a [`TelemetryHandler`].
//!
//! # Components
//!
//! - **decode**: self-describing GPB key-value extraction of VRRP sessions
//! - **receiver**: the gRPC dial-out service and its lifecycle handling

pub mod decode;
pub mod receiver;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    pub mod mdt_dialout {
        tonic::include_proto!("mdt_dialout");
    }

    pub mod telemetry {
        tonic::include_proto!("telemetry");
    }
}

pub use receiver::{TelemetryHandler, TelemetryServer, TelemetryServerError};
