//! XRd HA app.
//!
//! Sidecar controller paired 1:1 with an XRd vRouter instance. The router
//! streams VRRP operational state over model-driven telemetry dial-out;
//! when a configured VRRP group goes active here, the app re-steers AWS
//! networking (secondary private IPs, route-table entries) towards this
//! instance.
//!
//! # Components
//!
//! - **config**: the `/etc/ha_app/config.yaml` loader and action table
//! - **engine**: session state tracking, go-active dispatch, and the
//!   periodic consistency check

pub mod config;
pub mod engine;
