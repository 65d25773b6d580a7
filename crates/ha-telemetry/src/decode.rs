//! Decoding of self-describing GPB key-value telemetry into VRRP events.

use ha_common::{VrrpEvent, VrrpRole, VrrpSession};
use prost::Message;
use thiserror::Error;
use tracing::error;

use crate::proto::telemetry::{telemetry_field::ValueByType, Telemetry, TelemetryField};

/// The YANG path carrying IPv4 VRRP operational state.
pub const VRRP_ENCODING_PATH: &str =
    "Cisco-IOS-XR-ipv4-vrrp-oper:vrrp/ipv4/virtual-routers/virtual-router";

/// State string reported by the router for the master role.
const MASTER_STATE: &str = "state-master";

/// Failure to decode a dial-out payload into a telemetry envelope.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("message carries a JSON payload")]
    Json,

    #[error("failed to decode telemetry payload: {0}")]
    Gpb(#[from] prost::DecodeError),
}

/// A VRRP session row missing expected structure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("field {0:?} not found in the gpbkv data")]
    Missing(String),

    #[error("field {0:?} does not hold a string value")]
    NotString(String),

    #[error("field {0:?} does not hold a uint32 value")]
    NotUint32(String),

    #[error("virtual-router-id {0} out of range (1-255)")]
    VridOutOfRange(u32),
}

/// Parse a dial-out payload as a telemetry envelope.
///
/// Routers can be configured to stream JSON instead of GPB; that shows up
/// here as an undecodable payload that parses as JSON, and is reported
/// separately so the caller can warn rather than log a decode error.
pub fn parse_payload(data: &[u8]) -> Result<Telemetry, PayloadError> {
    match Telemetry::decode(data) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            if serde_json::from_slice::<serde_json::Value>(data).is_ok() {
                Err(PayloadError::Json)
            } else {
                Err(PayloadError::Gpb(err))
            }
        }
    }
}

/// Extract VRRP role observations from a telemetry message, in wire order.
///
/// Rows with unexpected structure are logged at error level and skipped;
/// the remaining rows are still delivered.
pub fn vrrp_events(msg: &Telemetry) -> Vec<VrrpEvent> {
    let mut events = Vec::with_capacity(msg.data_gpbkv.len());
    for row in &msg.data_gpbkv {
        match vrrp_event_from_row(row) {
            Ok(event) => events.push(event),
            Err(err) => {
                error!(error = %err, "VRRP session data has unexpected structure");
            }
        }
    }
    events
}

fn vrrp_event_from_row(row: &TelemetryField) -> Result<VrrpEvent, FieldError> {
    let keys = field(&row.fields, "keys")?;
    let content = field(&row.fields, "content")?;
    let interface_name = string_value(field(&keys.fields, "interface-name")?)?;
    let vrid_raw = uint32_value(field(&keys.fields, "virtual-router-id")?)?;
    let vrid = u8::try_from(vrid_raw).map_err(|_| FieldError::VridOutOfRange(vrid_raw))?;
    if vrid == 0 {
        return Err(FieldError::VridOutOfRange(vrid_raw));
    }
    let state = string_value(field(&content.fields, "vrrp-state")?)?;
    Ok(VrrpEvent::new(
        VrrpSession::new(interface_name, vrid),
        role_from_state(state),
    ))
}

/// Map the router's state string to a role.
///
/// The master role is conveyed by the `state-master` literal (matched
/// case-insensitively on the suffix); every other state string, including
/// backup and init, maps to inactive.
fn role_from_state(state: &str) -> VrrpRole {
    if state.to_ascii_lowercase().ends_with(MASTER_STATE) {
        VrrpRole::Active
    } else {
        VrrpRole::Inactive
    }
}

fn field<'a>(fields: &'a [TelemetryField], name: &str) -> Result<&'a TelemetryField, FieldError> {
    fields
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| FieldError::Missing(name.to_string()))
}

fn string_value(f: &TelemetryField) -> Result<&str, FieldError> {
    match &f.value_by_type {
        Some(ValueByType::StringValue(s)) => Ok(s),
        _ => Err(FieldError::NotString(f.name.clone())),
    }
}

fn uint32_value(f: &TelemetryField) -> Result<u32, FieldError> {
    match f.value_by_type {
        Some(ValueByType::Uint32Value(v)) => Ok(v),
        _ => Err(FieldError::NotUint32(f.name.clone())),
    }
}
