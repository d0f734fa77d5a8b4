//! End-to-end tests against a scripted mock CSMS.
//!
//! The mock accepts one WebSocket connection, auto-answers charge-point
//! calls with canned CALLRESULTs, forwards every received frame to the
//! test, and lets the test inject CSMS-initiated frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use cpsim_engine::{EngineEvent, Simulator, SimulatorConfig};

struct MockCsms {
    port: u16,
    inject_tx: mpsc::Sender<Value>,
    seen_rx: mpsc::Receiver<Value>,
}

impl MockCsms {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (inject_tx, mut inject_rx) = mpsc::channel::<Value>(16);
        let (seen_tx, seen_rx) = mpsc::channel::<Value>(64);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();

            loop {
                tokio::select! {
                    frame = rx.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(_)) => continue,
                            _ => break,
                        };
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        let _ = seen_tx.send(frame.clone()).await;

                        if frame[0] == 2 {
                            let unique_id = frame[1].as_str().unwrap();
                            let action = frame[2].as_str().unwrap();
                            let reply = json!([3, unique_id, canned_reply(action)]);
                            tx.send(Message::Text(reply.to_string())).await.unwrap();
                        }
                    }
                    inject = inject_rx.recv() => {
                        let Some(frame) = inject else { break };
                        tx.send(Message::Text(frame.to_string())).await.unwrap();
                    }
                }
            }
        });

        Self {
            port,
            inject_tx,
            seen_rx,
        }
    }

    async fn inject(&self, frame: Value) {
        self.inject_tx.send(frame).await.unwrap();
    }

    /// Next frame matching the predicate, skipping others.
    async fn next_frame(&mut self, mut pred: impl FnMut(&Value) -> bool) -> Value {
        timeout(Duration::from_secs(5), async {
            loop {
                let frame = self.seen_rx.recv().await.expect("mock closed");
                if pred(&frame) {
                    return frame;
                }
            }
        })
        .await
        .expect("no matching frame within 5s")
    }

    async fn next_call(&mut self, action: &str) -> Value {
        self.next_frame(|f| f[0] == 2 && f[2] == action).await
    }
}

fn canned_reply(action: &str) -> Value {
    match action {
        "BootNotification" => json!({
            "currentTime": "2026-08-23T12:00:00Z",
            "interval": 3600,
            "status": "Accepted"
        }),
        "StartTransaction" => json!({
            "idTagInfo": {"status": "Accepted"},
            "transactionId": 555
        }),
        "Heartbeat" => json!({"currentTime": "2026-08-23T12:00:00Z"}),
        _ => json!({}),
    }
}

fn simulator(port: u16) -> Simulator {
    Simulator::new(SimulatorConfig {
        csms_url: format!("ws://127.0.0.1:{port}"),
        identity: "CP-TEST".into(),
        connector_count: 2,
        request_timeout: Duration::from_secs(5),
        reconnect_delay: Duration::from_millis(100),
        ..SimulatorConfig::default()
    })
}

async fn wait_for_boot(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::BootAccepted { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("boot not accepted within 5s");
}

#[tokio::test]
async fn operator_start_transaction_happy_path() {
    let mut csms = MockCsms::start().await;
    let sim = simulator(csms.port);
    let mut events = sim.subscribe();

    let runner = sim.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });
    wait_for_boot(&mut events).await;

    let transaction_id = sim.start_transaction(1, "TAG123").await.unwrap();
    assert_eq!(transaction_id, 555);

    let start = csms.next_call("StartTransaction").await;
    assert_eq!(start[3]["connectorId"], 1);
    assert_eq!(start[3]["idTag"], "TAG123");
    assert_eq!(start[3]["meterStart"], 0);

    // Preparing then Charging announced around the StartTransaction
    let status = csms
        .next_frame(|f| {
            f[0] == 2 && f[2] == "StatusNotification" && f[3]["status"] == "Charging"
        })
        .await;
    assert_eq!(status[3]["connectorId"], 1);
    assert_eq!(status[3]["errorCode"], "NoError");

    let statuses = sim.connector_statuses().await;
    assert_eq!(
        statuses[0].status,
        cpsim_engine::types::ChargePointStatus::Charging
    );

    sim.stop_transaction(1, cpsim_engine::types::Reason::Local)
        .await
        .unwrap();
    let stop = csms.next_call("StopTransaction").await;
    assert_eq!(stop[3]["transactionId"], 555);
    assert_eq!(stop[3]["reason"], "Local");

    sim.disconnect();
    let _ = run_handle.await;
}

#[tokio::test]
async fn remote_start_transaction_from_csms() {
    let mut csms = MockCsms::start().await;
    let sim = simulator(csms.port);
    let mut events = sim.subscribe();

    let runner = sim.clone();
    tokio::spawn(async move { runner.run().await });
    wait_for_boot(&mut events).await;

    csms.inject(json!([
        2,
        "csms-1",
        "RemoteStartTransaction",
        {"idTag": "TAG42", "connectorId": 1}
    ]))
    .await;

    // the response goes out before the transaction itself starts
    let reply = csms.next_frame(|f| f[0] == 3 && f[1] == "csms-1").await;
    assert_eq!(reply[2]["status"], "Accepted");

    let start = csms.next_call("StartTransaction").await;
    assert_eq!(start[3]["idTag"], "TAG42");

    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::TransactionStarted { transaction_id, .. }) = events.recv().await
            {
                assert_eq!(transaction_id, 555);
                return;
            }
        }
    })
    .await
    .expect("transaction did not start");

    sim.disconnect();
}

#[tokio::test]
async fn unknown_unique_id_is_dropped() {
    let mut csms = MockCsms::start().await;
    let sim = simulator(csms.port);
    let mut events = sim.subscribe();

    let runner = sim.clone();
    tokio::spawn(async move { runner.run().await });
    wait_for_boot(&mut events).await;

    // stray result for a call that was never made
    csms.inject(json!([3, "never-sent", {"status": "Accepted"}]))
        .await;

    // session must still answer subsequent requests
    csms.inject(json!([
        2,
        "csms-2",
        "GetConfiguration",
        {"key": ["HeartbeatInterval"]}
    ]))
    .await;

    let reply = csms.next_frame(|f| f[0] == 3 && f[1] == "csms-2").await;
    assert_eq!(reply[2]["configurationKey"][0]["key"], "HeartbeatInterval");
    assert_eq!(reply[2]["configurationKey"][0]["value"], "60");

    let statuses = sim.connector_statuses().await;
    assert!(statuses
        .iter()
        .all(|s| s.status == cpsim_engine::types::ChargePointStatus::Available));

    sim.disconnect();
}

#[tokio::test]
async fn change_configuration_validation_over_the_wire() {
    let mut csms = MockCsms::start().await;
    let sim = simulator(csms.port);
    let mut events = sim.subscribe();

    let runner = sim.clone();
    tokio::spawn(async move { runner.run().await });
    wait_for_boot(&mut events).await;

    csms.inject(json!([
        2,
        "cfg-1",
        "ChangeConfiguration",
        {"key": "HeartbeatInterval", "value": "-5"}
    ]))
    .await;
    let reply = csms.next_frame(|f| f[0] == 3 && f[1] == "cfg-1").await;
    assert_eq!(reply[2]["status"], "Rejected");

    let (known, _) = sim
        .get_configuration(Some(&["HeartbeatInterval".to_string()]))
        .await;
    assert_eq!(known[0].value.as_deref(), Some("60"));

    // unknown action answered with NotImplemented, same uniqueId
    csms.inject(json!([2, "dt-1", "DataTransfer", {}])).await;
    let error = csms.next_frame(|f| f[0] == 4 && f[1] == "dt-1").await;
    assert_eq!(error[2], "NotImplemented");

    sim.disconnect();
}
