use atpneumatics::protocol::{AirValveState, MessageCodec};
use atpneumatics::schema::{FieldKind, FieldSpec, Schema, SchemaKey, SchemaRegistry};
use atpneumatics::subsystems::{ActuatorGroup, OpenCloseState};
use atpneumatics::*;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;

const INITIAL_EVENTS: usize = 13;

struct TestClient {
    handle: SimulatorHandle,
    rx: UnboundedReceiver<Value>,
}

impl TestClient {
    async fn connect(config: SimulatorConfig) -> Self {
        Self::connect_handle(SimulatorHandle::from_config(config).unwrap()).await
    }

    async fn connect_handle(handle: SimulatorHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        handle.connect_command_client(tx).await.unwrap();
        let mut client = Self { handle, rx };
        assert_eq!(client.drain().len(), INITIAL_EVENTS);
        client
    }

    async fn send(&self, payload: Value) {
        self.handle.handle_payload(&payload.to_string()).await;
    }

    async fn command(&self, name: &str, sequence_id: i64) {
        self.send(json!({"id": format!("cmd_{name}"), "sequence_id": sequence_id, "value": true}))
            .await;
    }

    /// Next message, letting the paused clock run forward to the next timer.
    async fn next(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(120), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed")
    }

    fn drain(&mut self) -> Vec<Value> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }
}

fn response(id: &str, sequence_id: i64) -> Value {
    json!({"id": id, "sequence_id": sequence_id})
}

fn vents_config() -> SimulatorConfig {
    let mut config = SimulatorConfig::default();
    config.device.cell_vents_close_time = 0.4;
    config.device.cell_vents_open_time = 0.8;
    config
}

#[tokio::test(start_paused = true)]
async fn test_in_order_commands_each_get_ack_and_success() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    let commands = [
        "m1CloseAirValve",
        "m1OpenAirValve",
        "m2CloseAirValve",
        "closeInstrumentAirValve",
        "closeMasterAirSupply",
        "openMasterAirSupply",
    ];
    for (index, name) in commands.iter().enumerate() {
        let sequence_id = index as i64 + 1;
        client.command(name, sequence_id).await;

        let messages = client.drain();
        assert_eq!(messages.len(), 3, "{name}: {messages:?}");
        assert_eq!(messages[0], response("ack", sequence_id));
        assert_eq!(messages[2], response("success", sequence_id));
    }

    let stats = client.handle.stats().await;
    assert_eq!(stats.commands_accepted, commands.len() as u64);
    assert_eq!(stats.commands_rejected, 0);
}

#[tokio::test(start_paused = true)]
async fn test_valve_command_emits_its_state_event() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    client.command("closeMasterAirSupply", 1).await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 1),
            json!({"id": "mainValveState", "state": 3}),
            response("success", 1),
        ]
    );

    // Already closed: the state is still reported
    client.command("closeMasterAirSupply", 2).await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 2),
            json!({"id": "mainValveState", "state": 3}),
            response("success", 2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_valve_after_connect_reports_state() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    // Every valve is already open after initialization
    client.command("openMasterAirSupply", 1).await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 1),
            json!({"id": "mainValveState", "state": 2}),
            response("success", 1),
        ]
    );

    client.command("openInstrumentAirValve", 2).await;
    assert_eq!(
        client.drain()[1],
        json!({"id": "instrumentState", "state": 2})
    );
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_set_pressure_reports_event() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    // Default m2 set-pressure
    client
        .send(json!({"id": "cmd_m2SetPressure", "sequence_id": 1, "pressure": 6.0, "value": true}))
        .await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 1),
            json!({"id": "m2SetPressure", "pressure": 6.0}),
            response("success", 1),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_out_of_sequence_command_gets_noack() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    client.command("m1CloseAirValve", 1).await;
    client.drain();

    // Gap
    client.command("closeMasterAirSupply", 3).await;
    assert_eq!(client.drain(), vec![response("noack", 3)]);
    // Duplicate
    client.command("closeMasterAirSupply", 1).await;
    assert_eq!(client.drain(), vec![response("noack", 1)]);

    {
        let simulator = client.handle.lock().await;
        assert_eq!(simulator.device().valves.main, AirValveState::Opened);
        assert_eq!(simulator.sequence().last_accepted(), Some(1));
    }

    client.command("closeMasterAirSupply", 2).await;
    assert_eq!(client.drain()[0], response("ack", 2));
    assert_eq!(client.handle.stats().await.commands_rejected, 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_payload_does_not_consume_sequence_id() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    client.command("m2OpenAirValve", 1).await;
    client.drain();

    client.command("rotateDome", 2).await;
    assert_eq!(client.drain(), vec![response("noack", 2)]);

    client
        .send(json!({"id": "cmd_m1SetPressure", "sequence_id": 2, "value": true}))
        .await;
    assert_eq!(client.drain(), vec![response("noack", 2)]);

    client
        .send(json!({"id": "cmd_m1SetPressure", "sequence_id": 2, "pressure": 7.5, "value": true}))
        .await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 2),
            json!({"id": "m1SetPressure", "pressure": 7.5}),
            response("success", 2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_payloads_are_dropped() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    client.handle.handle_payload("this is not json").await;
    client.send(json!({"id": "cmd_openM1Cover", "value": true})).await;
    assert!(client.drain().is_empty());

    // The counter was never seeded
    client.command("openInstrumentAirValve", 40).await;
    assert_eq!(client.drain()[0], response("ack", 40));
}

#[tokio::test(start_paused = true)]
async fn test_vents_open_scenario() {
    let mut client = TestClient::connect(vents_config()).await;

    client.command("openM1CellVents", 1).await;
    let started = Instant::now();
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 1),
            json!({"id": "cellVentsState", "state": 4}),
            json!({"id": "m1VentsPosition", "position": 2}),
            json!({"id": "m1VentsLimitSwitches", "ventsClosedActive": false, "ventsOpenedActive": false}),
        ]
    );

    assert_eq!(client.next().await, json!({"id": "cellVentsState", "state": 2}));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(800), "settled after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1100), "settled after {elapsed:?}");

    assert_eq!(client.next().await, json!({"id": "m1VentsPosition", "position": 0}));
    assert_eq!(
        client.next().await,
        json!({"id": "m1VentsLimitSwitches", "ventsClosedActive": false, "ventsOpenedActive": true})
    );
    assert_eq!(client.next().await, response("success", 1));
}

#[tokio::test(start_paused = true)]
async fn test_redundant_close_while_closing_is_noop() {
    let mut client = TestClient::connect(vents_config()).await;

    client.command("openM1CellVents", 1).await;
    client.drain();
    assert_eq!(client.next().await["id"], "cellVentsState");
    while client.next().await != response("success", 1) {}

    client.command("closeM1CellVents", 2).await;
    assert_eq!(client.drain().len(), 4);

    client.command("closeM1CellVents", 3).await;
    assert_eq!(client.drain(), vec![response("ack", 3), response("success", 3)]);

    // Only the first close settles
    let mut settled = Vec::new();
    loop {
        let message = client.next().await;
        let done = message == response("success", 2);
        settled.push(message);
        if done {
            break;
        }
    }
    assert_eq!(settled.len(), 4);
    assert_eq!(settled[0], json!({"id": "cellVentsState", "state": 3}));
}

#[tokio::test(start_paused = true)]
async fn test_close_cover_when_closed_completes_without_events() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    client.command("closeM1Cover", 1).await;
    assert_eq!(client.drain(), vec![response("ack", 1), response("success", 1)]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(client.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_opposite_request_supersedes_cover_transition() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;
    let all_closed = json!({
        "id": "m1CoverLimitSwitches",
        "cover1ClosedActive": false, "cover2ClosedActive": false,
        "cover3ClosedActive": false, "cover4ClosedActive": false,
        "cover1OpenedActive": false, "cover2OpenedActive": false,
        "cover3OpenedActive": false, "cover4OpenedActive": false,
    });

    client.command("openM1Cover", 1).await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 1),
            all_closed.clone(),
            json!({"id": "m1CoverState", "state": 4}),
        ]
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(client.drain().is_empty());

    client.command("closeM1Cover", 2).await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 2),
            response("success", 1),
            all_closed,
            json!({"id": "m1CoverState", "state": 4}),
        ]
    );

    // Past the point where the open would have settled
    tokio::time::sleep(Duration::from_secs(16)).await;
    let messages = client.drain();
    assert!(
        !messages.contains(&json!({"id": "m1CoverState", "state": 2})),
        "cancelled open settled: {messages:?}"
    );

    let mut rest = messages;
    while rest.last() != Some(&response("success", 2)) {
        rest.push(client.next().await);
    }
    assert!(rest.contains(&json!({"id": "m1CoverState", "state": 3})));
    assert_eq!(
        client.handle.lock().await.device().covers.timer().state(),
        OpenCloseState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_zero_transition_time_still_reports_motion() {
    let mut config = SimulatorConfig::default();
    config.device.m1_covers_open_time = 0.0;
    let mut client = TestClient::connect(config).await;

    client.command("openM1Cover", 1).await;
    let mut messages = client.drain();
    while messages.last() != Some(&response("success", 1)) {
        messages.push(client.next().await);
    }

    let states: Vec<_> = messages
        .iter()
        .filter(|m| m["id"] == "m1CoverState")
        .map(|m| m["state"].clone())
        .collect();
    assert_eq!(states, vec![json!(4), json!(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_covers_and_vents_move_concurrently() {
    let mut config = vents_config();
    config.device.m1_covers_open_time = 2.0;
    let mut client = TestClient::connect(config).await;

    client.command("openM1Cover", 1).await;
    client.command("openM1CellVents", 2).await;
    client.drain();

    let mut successes = Vec::new();
    while successes.len() < 2 {
        let message = client.next().await;
        if message["id"] == "success" {
            successes.push(message["sequence_id"].as_i64().unwrap());
        }
    }
    // Vents (0.8 s) settle before the covers (2 s)
    assert_eq!(successes, vec![2, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_set_pressure_drives_telemetry() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;

    client
        .send(json!({"id": "cmd_m1SetPressure", "sequence_id": 2, "pressure": 35, "value": true}))
        .await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 2),
            json!({"id": "m1SetPressure", "pressure": 35.0}),
            response("success", 2),
        ]
    );

    let (tx, mut telemetry) = mpsc::unbounded_channel();
    let mut simulator = client.handle.lock().await;
    simulator.connect_telemetry_client(tx);
    assert_eq!(simulator.update_telemetry().unwrap(), 4);

    assert_eq!(
        telemetry.try_recv().unwrap(),
        json!({"id": "m1AirPressure", "pressure": 35.0})
    );
    assert_eq!(
        telemetry.try_recv().unwrap(),
        json!({"id": "m2AirPressure", "pressure": 6.0})
    );
    assert_eq!(
        telemetry.try_recv().unwrap(),
        json!({"id": "mainAirSourcePressure", "pressure": 10.0})
    );
    assert_eq!(
        telemetry.try_recv().unwrap(),
        json!({"id": "loadCell", "cellLoad": 100.0})
    );
}

#[tokio::test(start_paused = true)]
async fn test_closed_master_supply_zeroes_line_pressure() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;
    client.command("closeMasterAirSupply", 1).await;
    client.drain();

    let (tx, mut telemetry) = mpsc::unbounded_channel();
    let mut simulator = client.handle.lock().await;
    simulator.connect_telemetry_client(tx);
    simulator.update_telemetry().unwrap();

    assert_eq!(telemetry.try_recv().unwrap()["pressure"], json!(0.0));
    assert_eq!(telemetry.try_recv().unwrap()["pressure"], json!(0.0));
    assert_eq!(telemetry.try_recv().unwrap()["pressure"], json!(10.0));
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_loop_runs_while_client_connected() {
    let mut config = SimulatorConfig::default();
    config.telemetry_interval = 0.5;
    let handle = SimulatorHandle::from_config(config).unwrap();

    let (tx, mut telemetry) = mpsc::unbounded_channel();
    handle.connect_telemetry_client(tx).await;

    for _ in 0..3 {
        for expected in Telemetry::NAMES {
            let sample = tokio::time::timeout(Duration::from_secs(5), telemetry.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(sample["id"], *expected);
        }
    }

    handle.disconnect_telemetry_client().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(telemetry.recv().await.is_none());
    assert!(handle.stats().await.telemetry_emitted >= 12);
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_paused_when_offline() {
    let mut client = TestClient::connect(SimulatorConfig::default()).await;
    client.command("exitControl", 1).await;
    client.drain();
    assert_eq!(client.handle.simulator_state().await, SimulatorState::Offline);

    let (tx, mut telemetry) = mpsc::unbounded_channel();
    client.handle.connect_telemetry_client(tx).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(telemetry.try_recv().is_err());

    client.command("standby", 2).await;
    let sample = tokio::time::timeout(Duration::from_secs(5), telemetry.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sample["id"], "m1AirPressure");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_transitions() {
    let mut client = TestClient::connect(vents_config()).await;
    client.command("openM1CellVents", 1).await;
    client.drain();

    client.handle.disconnect_command_client().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    {
        let simulator = client.handle.lock().await;
        assert!(simulator.device().vents.timer().pending().is_none());
    }
    assert!(client.drain().is_empty());

    // Reconnecting reinitializes everything and reseeds the sequence
    let mut client = TestClient::connect_handle(client.handle.clone()).await;
    client.command("openM1CellVents", 1).await;
    assert_eq!(client.drain()[0], response("ack", 1));
}

#[tokio::test(start_paused = true)]
async fn test_handler_error_answers_fail() {
    // Only accept an opened m1 valve, so closing it cannot be reported
    let mut registry = SchemaRegistry::standard();
    registry
        .register(
            Schema::new(SchemaKey::for_event("m1State"))
                .field(FieldSpec::required("id", FieldKind::Literal("m1State".to_owned())))
                .field(FieldSpec::required("state", FieldKind::IntEnum(&[2]))),
        )
        .unwrap();
    let simulator = PneumaticsSimulator::with_codec(
        SimulatorConfig::default(),
        MessageCodec::with_registry(registry),
    )
    .unwrap();
    let mut client = TestClient::connect_handle(SimulatorHandle::new(simulator)).await;

    client.command("m1CloseAirValve", 1).await;
    assert_eq!(client.drain(), vec![response("ack", 1), response("fail", 1)]);

    // The connection and the sequence carry on
    client.command("m2CloseAirValve", 2).await;
    assert_eq!(client.drain().last(), Some(&response("success", 2)));

    let stats = client.handle.stats().await;
    assert_eq!(stats.commands_failed, 1);
    assert_eq!(stats.commands_accepted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_motion_report_rolls_group_back() {
    // Settled cover states only, so the in-motion report cannot go out
    let mut registry = SchemaRegistry::standard();
    registry
        .register(
            Schema::new(SchemaKey::for_event("m1CoverState"))
                .field(FieldSpec::required("id", FieldKind::Literal("m1CoverState".to_owned())))
                .field(FieldSpec::required("state", FieldKind::IntEnum(&[2, 3]))),
        )
        .unwrap();
    let simulator = PneumaticsSimulator::with_codec(
        SimulatorConfig::default(),
        MessageCodec::with_registry(registry),
    )
    .unwrap();
    let mut client = TestClient::connect_handle(SimulatorHandle::new(simulator)).await;
    let switches = |closed: bool| {
        json!({
            "id": "m1CoverLimitSwitches",
            "cover1ClosedActive": closed, "cover2ClosedActive": closed,
            "cover3ClosedActive": closed, "cover4ClosedActive": closed,
            "cover1OpenedActive": false, "cover2OpenedActive": false,
            "cover3OpenedActive": false, "cover4OpenedActive": false,
        })
    };

    client.command("openM1Cover", 1).await;
    assert_eq!(
        client.drain(),
        vec![
            response("ack", 1),
            switches(false),
            switches(true),
            json!({"id": "m1CoverState", "state": 3}),
            response("fail", 1),
        ]
    );
    {
        let simulator = client.handle.lock().await;
        assert_eq!(simulator.device().covers.timer().state(), OpenCloseState::Closed);
        assert!(simulator.device().covers.timer().pending().is_none());
    }

    // Retrying is not mistaken for a redundant request
    client.command("openM1Cover", 2).await;
    assert_eq!(client.drain().last(), Some(&response("fail", 2)));

    // And the closed end is still recognised
    client.command("closeM1Cover", 3).await;
    assert_eq!(client.drain(), vec![response("ack", 3), response("success", 3)]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(client.drain().is_empty());
    assert_eq!(client.handle.stats().await.commands_failed, 2);
}
