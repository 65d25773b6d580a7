//! Integration tests for the telemetry dial-out endpoint, driving a real
//! gRPC client against a server on an ephemeral port.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use tokio_stream::wrappers::ReceiverStream;

use ha_common::{DisconnectReason, VrrpEvent, VrrpRole, VrrpSession};
use ha_telemetry::proto::mdt_dialout::g_rpc_mdt_dialout_client::GRpcMdtDialoutClient;
use ha_telemetry::proto::mdt_dialout::MdtDialoutArgs;
use ha_telemetry::proto::telemetry::{telemetry_field::ValueByType, Telemetry, TelemetryField};
use ha_telemetry::{decode, TelemetryHandler, TelemetryServer};

#[derive(Default)]
struct RecordingHandler {
    connects: Mutex<Vec<String>>,
    events: Mutex<Vec<VrrpEvent>>,
    disconnects: Mutex<Vec<DisconnectReason>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<VrrpEvent> {
        self.events.lock().unwrap().clone()
    }

    fn disconnects(&self) -> Vec<DisconnectReason> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl TelemetryHandler for RecordingHandler {
    fn on_connect(&self, peer: &str) {
        self.connects.lock().unwrap().push(peer.to_string());
    }

    fn handle_event(&self, event: VrrpEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        self.disconnects.lock().unwrap().push(reason);
    }
}

async fn start_server() -> (Arc<RecordingHandler>, SocketAddr) {
    let handler = Arc::new(RecordingHandler::default());
    let server = TelemetryServer::bind("127.0.0.1:0".parse().unwrap(), handler.clone())
        .await
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    (handler, addr)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
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

fn vrrp_msg_on_path(path: &str, intf: &str, vrid: u32, state: &str) -> MdtDialoutArgs {
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
        encoding_path: path.to_string(),
        data_gpbkv: vec![row],
        ..Default::default()
    };
    MdtDialoutArgs {
        req_id: 1,
        data: telemetry.encode_to_vec(),
        errors: String::new(),
    }
}

fn vrrp_msg(intf: &str, vrid: u32, state: &str) -> MdtDialoutArgs {
    vrrp_msg_on_path(decode::VRRP_ENCODING_PATH, intf, vrid, state)
}

#[tokio::test]
async fn test_events_delivered_and_stream_close_reported() {
    let (handler, addr) = start_server().await;

    let mut client = GRpcMdtDialoutClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");
    let (tx, rx) = tokio::sync::mpsc::channel::<MdtDialoutArgs>(8);
    let call = tokio::spawn(async move { client.mdt_dialout(ReceiverStream::new(rx)).await });

    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-master"))
        .await
        .expect("send");
    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-backup"))
        .await
        .expect("send");

    let events_handler = handler.clone();
    wait_until(move || events_handler.events().len() == 2).await;

    let events = handler.events();
    assert_eq!(
        events[0],
        VrrpEvent::new(
            VrrpSession::new("HundredGigE0/0/0/1", 1),
            VrrpRole::Active
        )
    );
    assert_eq!(events[1].role, VrrpRole::Inactive);
    assert_eq!(handler.connects.lock().unwrap().len(), 1);
    assert!(handler.disconnects().is_empty());

    // Half-close the stream; the server reports a peer-initiated close.
    drop(tx);
    let disc_handler = handler.clone();
    wait_until(move || !disc_handler.disconnects().is_empty()).await;
    assert_eq!(handler.disconnects(), vec![DisconnectReason::ClosedByPeer]);

    call.await.expect("join").expect("rpc result");
}

#[tokio::test]
async fn test_second_concurrent_stream_refused() {
    let (handler, addr) = start_server().await;

    let mut client = GRpcMdtDialoutClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");
    let (tx, rx) = tokio::sync::mpsc::channel::<MdtDialoutArgs>(8);
    let _call = tokio::spawn(async move { client.mdt_dialout(ReceiverStream::new(rx)).await });

    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-master"))
        .await
        .expect("send");
    let events_handler = handler.clone();
    wait_until(move || !events_handler.events().is_empty()).await;

    // The first stream is live; a second one must be refused.
    let mut client2 = GRpcMdtDialoutClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");
    let (_tx2, rx2) = tokio::sync::mpsc::channel::<MdtDialoutArgs>(8);
    let err = client2
        .mdt_dialout(ReceiverStream::new(rx2))
        .await
        .expect_err("second stream should be refused");
    assert_eq!(err.code(), tonic::Code::ResourceExhausted);

    // The first stream is unaffected.
    tx.send(vrrp_msg("HundredGigE0/0/0/2", 2, "state-master"))
        .await
        .expect("send");
    let events_handler = handler.clone();
    wait_until(move || events_handler.events().len() == 2).await;
    assert!(handler.disconnects().is_empty());
}

#[tokio::test]
async fn test_reconnect_after_close_accepted() {
    let (handler, addr) = start_server().await;

    let mut client = GRpcMdtDialoutClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");

    let (tx, rx) = tokio::sync::mpsc::channel::<MdtDialoutArgs>(8);
    let call = tokio::spawn({
        let mut client = client.clone();
        async move { client.mdt_dialout(ReceiverStream::new(rx)).await }
    });
    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-master"))
        .await
        .expect("send");
    let events_handler = handler.clone();
    wait_until(move || !events_handler.events().is_empty()).await;
    drop(tx);
    call.await.expect("join").expect("rpc result");

    // Slot is released; a fresh stream is accepted and delivers again.
    let (tx, rx) = tokio::sync::mpsc::channel::<MdtDialoutArgs>(8);
    let _call = tokio::spawn(async move { client.mdt_dialout(ReceiverStream::new(rx)).await });
    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-master"))
        .await
        .expect("send");
    let events_handler = handler.clone();
    wait_until(move || events_handler.events().len() == 2).await;
    assert_eq!(handler.connects.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_bad_payloads_do_not_terminate_stream() {
    let (handler, addr) = start_server().await;

    let mut client = GRpcMdtDialoutClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");
    let (tx, rx) = tokio::sync::mpsc::channel::<MdtDialoutArgs>(8);
    let _call = tokio::spawn(async move { client.mdt_dialout(ReceiverStream::new(rx)).await });

    // JSON payload: warned about and dropped.
    tx.send(MdtDialoutArgs {
        req_id: 1,
        data: br#"{"telemetry": "json"}"#.to_vec(),
        errors: String::new(),
    })
    .await
    .expect("send");

    // Undecodable payload: error logged and dropped.
    tx.send(MdtDialoutArgs {
        req_id: 2,
        data: vec![0xff, 0xff, 0xff, 0xff],
        errors: String::new(),
    })
    .await
    .expect("send");

    // Unexpected path: logged once and dropped.
    tx.send(vrrp_msg_on_path(
        "Cisco-IOS-XR-other-oper:some/other/path",
        "HundredGigE0/0/0/1",
        1,
        "state-master",
    ))
    .await
    .expect("send");

    // The stream is still live and a good message is delivered.
    tx.send(vrrp_msg("HundredGigE0/0/0/1", 1, "state-master"))
        .await
        .expect("send");
    let events_handler = handler.clone();
    wait_until(move || events_handler.events().len() == 1).await;
    assert_eq!(handler.events()[0].role, VrrpRole::Active);
    assert!(handler.disconnects().is_empty());
}
