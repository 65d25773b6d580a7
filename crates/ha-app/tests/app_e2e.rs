//! End-to-end test: a real telemetry dial-out stream driving the engine,
//! with cloud effects observed through the mock client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;

use common::{assert_no_call, recv_call, vrrp_msg, CloudCall, MockCloud};

use ha_app::config;
use ha_app::engine::Engine;
use ha_common::{VrrpRole, VrrpSession};
use ha_telemetry::proto::mdt_dialout::g_rpc_mdt_dialout_client::GRpcMdtDialoutClient;
use ha_telemetry::TelemetryServer;

const CONFIG: &str = r#"
global:
  aws:
    ec2_private_endpoint_url: https://ec2.us-east-1.amazonaws.com
groups:
  - xr_interface: HundredGigE0/0/0/1
    vrid: 1
    action:
      type: aws_activate_vip
      device_index: 0
      vip: 10.0.2.100
"#;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_go_active_via_telemetry_stream() {
    let (cloud, mut rx) = MockCloud::new();
    let (_, table) = config::parse(CONFIG).expect("config parses");
    let engine = Arc::new(Engine::new(table, cloud.clone(), Duration::from_secs(10)));

    let server = TelemetryServer::bind("127.0.0.1:0".parse().unwrap(), engine.clone())
        .await
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve().await;
    });

    let mut client = GRpcMdtDialoutClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");
    let (tx, stream_rx) = tokio::sync::mpsc::channel(8);
    let call = tokio::spawn(async move { client.mdt_dialout(ReceiverStream::new(stream_rx)).await });

    // The router reports the group active; exactly one no-precheck
    // assignment lands on the cloud side.
    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-master"))
        .await
        .expect("send");
    assert_eq!(
        recv_call(&mut rx).await,
        CloudCall::AssignVip {
            device_index: 0,
            vip: "10.0.2.100".parse().unwrap(),
            precheck: false,
        }
    );
    let session = VrrpSession::new("HundredGigE0/0/0/1", 1);
    assert_eq!(engine.role(&session), Some(VrrpRole::Active));

    // A repeated active observation over the wire is not re-dispatched.
    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-master"))
        .await
        .expect("send");
    assert_no_call(&mut rx).await;

    // An observation for an unconfigured group is dropped.
    tx.send(vrrp_msg("HundredGigE0/0/0/9", 7, "state-master"))
        .await
        .expect("send");
    assert_no_call(&mut rx).await;

    // Stream teardown resets the session table.
    drop(tx);
    call.await.expect("join").expect("rpc result");
    let engine_for_wait = engine.clone();
    wait_until(move || engine_for_wait.role(&session) == Some(VrrpRole::Inactive)).await;

    // With everything inactive, a consistency check is a no-op.
    engine.check_consistency_once().await;
    assert_no_call(&mut rx).await;
}
