//! Shared test support: a recording mock cloud client and telemetry
//! message builders.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::{mpsc, Barrier};

use ha_aws::{AwsError, CloudClient};
use ha_common::Ipv4Net;
use ha_telemetry::proto::mdt_dialout::MdtDialoutArgs;
use ha_telemetry::proto::telemetry::{telemetry_field::ValueByType, Telemetry, TelemetryField};

/// One mutating or prechecked adapter invocation, as observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    AssignVip {
        device_index: u32,
        vip: Ipv4Addr,
        precheck: bool,
    },
    UpdateRouteTable {
        route_table_id: String,
        destination: Ipv4Net,
        target_network_interface: String,
        precheck: bool,
    },
}

/// Recording mock of the cloud client.
///
/// Calls are pushed to `calls` and mirrored over a channel so tests can
/// await asynchronously dispatched work. An optional barrier makes
/// concurrent calls rendezvous, and `fail_next` injects one failure.
pub struct MockCloud {
    calls: Mutex<Vec<CloudCall>>,
    tx: mpsc::UnboundedSender<CloudCall>,
    fail_next: Mutex<Option<AwsError>>,
    barrier: Mutex<Option<Arc<Barrier>>>,
}

impl MockCloud {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CloudCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                tx,
                fail_next: Mutex::new(None),
                barrier: Mutex::new(None),
            }),
            rx,
        )
    }

    pub fn fail_next(&self, err: AwsError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn set_barrier(&self, barrier: Arc<Barrier>) {
        *self.barrier.lock().unwrap() = Some(barrier);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: CloudCall) -> Result<(), AwsError> {
        self.calls.lock().unwrap().push(call.clone());
        let barrier = self.barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let failure = self.fail_next.lock().unwrap().take();
        let _ = self.tx.send(call);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    fn indexed_eni(&self, device_index: u32) -> Result<String, AwsError> {
        Ok(format!("eni-device-{device_index}"))
    }

    async fn validate_route_table(&self, _route_table_id: &str) -> Result<(), AwsError> {
        Ok(())
    }

    async fn validate_network_interface(&self, _eni_id: &str) -> Result<(), AwsError> {
        Ok(())
    }

    async fn assign_vip(
        &self,
        device_index: u32,
        vip: Ipv4Addr,
        precheck: bool,
    ) -> Result<(), AwsError> {
        self.record(CloudCall::AssignVip {
            device_index,
            vip,
            precheck,
        })
        .await
    }

    async fn update_route_table(
        &self,
        route_table_id: &str,
        destination: Ipv4Net,
        target_network_interface: &str,
        precheck: bool,
    ) -> Result<(), AwsError> {
        self.record(CloudCall::UpdateRouteTable {
            route_table_id: route_table_id.to_string(),
            destination,
            target_network_interface: target_network_interface.to_string(),
            precheck,
        })
        .await
    }
}

/// Receive the next recorded call, failing the test on timeout.
pub async fn recv_call(rx: &mut mpsc::UnboundedReceiver<CloudCall>) -> CloudCall {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for cloud call")
        .expect("mock cloud channel closed")
}

/// Assert no further calls arrive within a settle window.
pub async fn assert_no_call(rx: &mut mpsc::UnboundedReceiver<CloudCall>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        rx.try_recv().is_err(),
        "unexpected cloud call was dispatched"
    );
}

fn string_field(name: &str, value: &str) -> TelemetryField {
    TelemetryField {
        name: name.to_string(),
        value_by_type: Some(ValueByType::StringValue(value.to_string())),
        ..Default::default()
    }
}

fn uint32_field(name: &str, value: u32) -> TelemetryField {
    TelemetryField {
        name: name.to_string(),
        value_by_type: Some(ValueByType::Uint32Value(value)),
        ..Default::default()
    }
}

/// Build a dial-out message carrying one VRRP session row.
pub fn vrrp_msg(intf: &str, vrid: u32, state: &str) -> MdtDialoutArgs {
    let row = TelemetryField {
        fields: vec![
            TelemetryField {
                name: "keys".to_string(),
                fields: vec![
                    string_field("interface-name", intf),
                    uint32_field("virtual-router-id", vrid),
                ],
                ..Default::default()
            },
            TelemetryField {
                name: "content".to_string(),
                fields: vec![string_field("vrrp-state", state)],
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let telemetry = Telemetry {
        encoding_path: ha_telemetry::decode::VRRP_ENCODING_PATH.to_string(),
        data_gpbkv: vec![row],
        ..Default::default()
    };
    MdtDialoutArgs {
        req_id: 1,
        data: telemetry.encode_to_vec(),
        errors: String::new(),
    }
}
