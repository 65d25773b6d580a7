//! AWS EC2 adapter for the XRd HA app.
//!
//! Wraps the EC2 Query API behind the three operations the engine needs:
//! assigning a secondary private IP (VIP) to an attached ENI, re-targeting
//! a route-table entry, and validating configured resources at startup.
//! Identity and credentials come from the instance metadata service
//! (IMDSv2); requests are SigV4-signed against a caller-supplied private
//! endpoint.
//!
//! All operations are synchronous from the engine's viewpoint: no
//! background work is spawned here.

pub mod client;
pub mod error;
mod imds;
mod sigv4;

use async_trait::async_trait;
use std::net::Ipv4Addr;

use ha_common::Ipv4Net;

pub use client::Ec2Client;
pub use error::AwsError;

/// The cloud-side operations used by the engine.
///
/// `precheck = true` reads the current cloud state first and returns early
/// without side effect when it already matches intent; `precheck = false`
/// applies the mutation unconditionally.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Resolve a device index to the attached ENI id.
    fn indexed_eni(&self, device_index: u32) -> Result<String, AwsError>;

    /// Confirm a route table exists.
    async fn validate_route_table(&self, route_table_id: &str) -> Result<(), AwsError>;

    /// Confirm a network interface exists.
    async fn validate_network_interface(&self, eni_id: &str) -> Result<(), AwsError>;

    /// Assign a secondary private IPv4 address to the ENI at the given
    /// device index, moving it from any other interface that holds it.
    async fn assign_vip(
        &self,
        device_index: u32,
        vip: Ipv4Addr,
        precheck: bool,
    ) -> Result<(), AwsError>;

    /// Point the route for `destination` in the given route table at the
    /// given ENI, creating the route if it does not exist.
    async fn update_route_table(
        &self,
        route_table_id: &str,
        destination: Ipv4Net,
        target_network_interface: &str,
        precheck: bool,
    ) -> Result<(), AwsError>;
}
