//! Simulator core: owns the device state, answers commands and pushes events
//! and telemetry to whichever clients are connected.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SimulatorConfig};
use crate::protocol::{
    Ack, AirValveState, Command, CommandResponse, DecodedCommand, Event, MessageCodec,
    PowerStatus, ProtocolError,
};
use crate::sequence::SequenceValidator;
use crate::subsystems::{
    ActuatorGroup, AirLine, DeviceState, Direction, EventList, GroupId, Motion,
    PendingTransition, TransitionRequest, Valve,
};
use crate::telemetry;

/// Channel feeding one connection's writer task.
pub type MessageSink = UnboundedSender<Value>;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Summary state reported to the outer control system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulatorState {
    Offline,
    Standby,
    Disabled,
    Enabled,
    Fault,
}

impl SimulatorState {
    /// Telemetry is only sampled in these states.
    pub fn is_active(self) -> bool {
        !matches!(self, SimulatorState::Offline | SimulatorState::Fault)
    }
}

impl fmt::Display for SimulatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SimulatorState::Offline => "OFFLINE",
            SimulatorState::Standby => "STANDBY",
            SimulatorState::Disabled => "DISABLED",
            SimulatorState::Enabled => "ENABLED",
            SimulatorState::Fault => "FAULT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorStats {
    pub commands_accepted: u64,
    pub commands_rejected: u64,
    pub commands_failed: u64,
    pub events_emitted: u64,
    pub telemetry_emitted: u64,
}

/// What is left to do for an acknowledged command once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Finished; answer SUCCESS now.
    Done,
    /// A timed transition is under way; SUCCESS follows its settled events.
    Pending {
        group: GroupId,
        run_id: u64,
        wait: Duration,
    },
}

#[derive(Debug)]
pub struct PneumaticsSimulator {
    device: DeviceState,
    codec: MessageCodec,
    sequence: SequenceValidator,
    config: SimulatorConfig,
    simulator_state: SimulatorState,
    stats: SimulatorStats,
    evt_sink: Option<MessageSink>,
    tel_sink: Option<MessageSink>,
    telemetry_task: Option<JoinHandle<()>>,
}

impl PneumaticsSimulator {
    pub fn new(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        Self::with_codec(config, MessageCodec::new())
    }

    /// Use a codec with a custom schema registry.
    pub fn with_codec(config: SimulatorConfig, codec: MessageCodec) -> Result<Self, SimulatorError> {
        config.validate()?;
        // Tuning applies from the start; its events go to the first client.
        let mut device = DeviceState::new();
        device.configure(&config.device);
        Ok(Self {
            device,
            codec,
            sequence: SequenceValidator::new(),
            config,
            simulator_state: SimulatorState::Standby,
            stats: SimulatorStats::default(),
            evt_sink: None,
            tel_sink: None,
            telemetry_task: None,
        })
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    pub fn simulator_state(&self) -> SimulatorState {
        self.simulator_state
    }

    /// For the outer control system, which owns the lifecycle policy.
    pub fn set_simulator_state(&mut self, state: SimulatorState) {
        if self.simulator_state != state {
            info!("Simulator state {} -> {}", self.simulator_state, state);
            self.simulator_state = state;
        }
    }

    pub fn sequence(&self) -> &SequenceValidator {
        &self.sequence
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.config.telemetry_interval)
            .unwrap_or(Duration::from_secs(1))
    }

    /// A new command/event client: reseed the sequence counter, then report
    /// the configured and initial device state to it.
    pub fn connect_command_client(&mut self, sink: MessageSink) -> Result<(), SimulatorError> {
        info!("Command client connected");
        self.evt_sink = Some(sink);
        self.sequence.reset();
        self.configure()?;
        self.initialize()
    }

    /// Cancel in-flight transitions and stop sending events.
    pub fn disconnect_command_client(&mut self) {
        for cancelled in [
            self.device.covers.timer_mut().cancel(),
            self.device.vents.timer_mut().cancel(),
        ]
        .into_iter()
        .flatten()
        {
            info!(
                "Cancelled {:?} transition of command {} on disconnect",
                cancelled.direction, cancelled.sequence_id
            );
        }
        self.evt_sink = None;
        info!("Command client disconnected");
    }

    pub fn connect_telemetry_client(&mut self, sink: MessageSink) {
        info!("Telemetry client connected");
        self.tel_sink = Some(sink);
    }

    pub fn disconnect_telemetry_client(&mut self) {
        self.stop_telemetry();
        self.tel_sink = None;
        info!("Telemetry client disconnected");
    }

    pub fn set_telemetry_task(&mut self, task: JoinHandle<()>) {
        self.stop_telemetry();
        self.telemetry_task = Some(task);
    }

    pub fn stop_telemetry(&mut self) {
        if let Some(task) = self.telemetry_task.take() {
            task.abort();
            info!("Telemetry loop stopped");
        }
    }

    /// Apply the device tuning and report the set-pressures.
    pub fn configure(&mut self) -> Result<(), SimulatorError> {
        self.config.device.validate()?;
        let events = self.device.configure(&self.config.device);
        self.emit_all(&events)
    }

    /// Put the device in its power-on state and report every group of it.
    pub fn initialize(&mut self) -> Result<(), SimulatorError> {
        self.device.e_stop = false;
        self.emit_event(&Event::EStop { triggered: false })?;

        let (cancelled, events) = self.device.vents.initialize();
        self.log_reset(GroupId::Vents, cancelled);
        self.emit_all(&events)?;

        let (cancelled, events) = self.device.covers.initialize();
        self.log_reset(GroupId::Covers, cancelled);
        self.emit_all(&events)?;

        for valve in [Valve::Instrument, Valve::M1, Valve::M2, Valve::Main] {
            let event = self.device.valves.set(valve, AirValveState::Opened);
            self.emit_event(&event)?;
        }

        self.device.power = PowerStatus {
            power_on_l1: true,
            power_on_l2: true,
            power_on_l3: true,
        };
        let event = Event::PowerStatus(self.device.power);
        self.emit_event(&event)
    }

    fn log_reset(&self, group: GroupId, cancelled: Option<PendingTransition>) {
        if let Some(cancelled) = cancelled {
            info!(
                "Re-initialization cancelled {} transition of command {}",
                group, cancelled.sequence_id
            );
        }
    }

    /// Take one inbound line through sequencing, validation, ACK and the
    /// handler. Returns the timed transition left to wait out, if any.
    pub fn handle_line(&mut self, line: &str) -> Option<Dispatch> {
        let raw = match self.codec.parse(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Dropping unreadable payload: {}", e);
                self.stats.commands_rejected += 1;
                return None;
            }
        };

        let Some(sequence_id) = raw.sequence_id else {
            warn!("Dropping payload without a sequence id: {}", raw.payload);
            self.stats.commands_rejected += 1;
            return None;
        };

        if !self.sequence.is_next(sequence_id) {
            warn!(
                "Rejecting {:?} with sequence id {} (expected {:?})",
                raw.id,
                sequence_id,
                self.sequence.expected()
            );
            self.reject(sequence_id);
            return None;
        }

        let decoded = match self.codec.decode(&raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Rejecting command {}: {}", sequence_id, e);
                self.reject(sequence_id);
                return None;
            }
        };

        self.sequence.validate(sequence_id);
        self.stats.commands_accepted += 1;
        info!(
            "Command {} ({}) accepted {:?}",
            decoded.command.name(),
            sequence_id,
            decoded.args
        );
        self.send_response(Ack::Ack, sequence_id);

        match self.dispatch(&decoded) {
            Ok(Dispatch::Done) => {
                self.send_response(Ack::Success, sequence_id);
                None
            }
            Ok(pending) => Some(pending),
            Err(e) => {
                error!("Command {} ({}) failed: {}", decoded.command.name(), sequence_id, e);
                self.stats.commands_failed += 1;
                self.send_response(Ack::Fail, sequence_id);
                None
            }
        }
    }

    /// Run the handler of an acknowledged command.
    pub fn dispatch(&mut self, decoded: &DecodedCommand) -> Result<Dispatch, SimulatorError> {
        let sequence_id = decoded.sequence_id;
        match decoded.command {
            Command::CloseInstrumentAirValve => self.set_valve(Valve::Instrument, AirValveState::Closed),
            Command::OpenInstrumentAirValve => self.set_valve(Valve::Instrument, AirValveState::Opened),
            Command::M1CloseAirValve => self.set_valve(Valve::M1, AirValveState::Closed),
            Command::M1OpenAirValve => self.set_valve(Valve::M1, AirValveState::Opened),
            Command::M2CloseAirValve => self.set_valve(Valve::M2, AirValveState::Closed),
            Command::M2OpenAirValve => self.set_valve(Valve::M2, AirValveState::Opened),
            Command::CloseMasterAirSupply => self.set_valve(Valve::Main, AirValveState::Closed),
            Command::OpenMasterAirSupply => self.set_valve(Valve::Main, AirValveState::Opened),

            Command::M1SetPressure { pressure } => self.set_pressure(AirLine::M1, pressure),
            Command::M2SetPressure { pressure } => self.set_pressure(AirLine::M2, pressure),

            Command::CloseM1Cover => self.move_group(GroupId::Covers, Direction::Close, sequence_id),
            Command::OpenM1Cover => self.move_group(GroupId::Covers, Direction::Open, sequence_id),
            Command::CloseM1CellVents => self.move_group(GroupId::Vents, Direction::Close, sequence_id),
            Command::OpenM1CellVents => self.move_group(GroupId::Vents, Direction::Open, sequence_id),

            Command::Start => self.lifecycle(SimulatorState::Disabled),
            Command::Enable => self.lifecycle(SimulatorState::Enabled),
            Command::Disable => self.lifecycle(SimulatorState::Disabled),
            Command::Standby => self.lifecycle(SimulatorState::Standby),
            Command::ExitControl => self.lifecycle(SimulatorState::Offline),
        }
    }

    fn set_valve(&mut self, valve: Valve, state: AirValveState) -> Result<Dispatch, SimulatorError> {
        let event = self.device.valves.set(valve, state);
        debug!("{} valve {:?}", valve, state);
        self.emit_event(&event)?;
        Ok(Dispatch::Done)
    }

    fn set_pressure(&mut self, line: AirLine, pressure: f64) -> Result<Dispatch, SimulatorError> {
        let event = self.device.set_pressure(line, pressure);
        debug!("{} set-pressure {}", line.valve(), pressure);
        self.emit_event(&event)?;
        Ok(Dispatch::Done)
    }

    fn lifecycle(&mut self, state: SimulatorState) -> Result<Dispatch, SimulatorError> {
        self.set_simulator_state(state);
        Ok(Dispatch::Done)
    }

    fn move_group(
        &mut self,
        group: GroupId,
        direction: Direction,
        sequence_id: i64,
    ) -> Result<Dispatch, SimulatorError> {
        let Motion { request, events } = match group {
            GroupId::Covers => self.device.covers.request(direction, sequence_id),
            GroupId::Vents => self.device.vents.request(direction, sequence_id),
        };

        let (run_id, wait, superseded) = match request {
            TransitionRequest::NoOp => {
                debug!("{} already moving or settled towards {:?}", group, direction);
                return Ok(Dispatch::Done);
            }
            TransitionRequest::Start {
                run_id,
                wait,
                superseded,
            } => (run_id, wait, superseded),
        };

        if let Some(old) = superseded {
            info!(
                "{} {:?} of command {} superseded by command {}",
                group, old.direction, old.sequence_id, sequence_id
            );
            self.send_response(Ack::Success, old.sequence_id);
        }

        info!("{} {:?} started, settles in {:?}", group, direction, wait);
        if let Err(e) = self.emit_all(&events) {
            self.rollback_group(group, run_id);
            return Err(e);
        }

        Ok(Dispatch::Pending {
            group,
            run_id,
            wait,
        })
    }

    /// Put a group back where it was after its run could not be reported.
    fn rollback_group(&mut self, group: GroupId, run_id: u64) {
        let undone = match group {
            GroupId::Covers => self.device.covers.rollback(run_id),
            GroupId::Vents => self.device.vents.rollback(run_id),
        };
        let Some((undone, events)) = undone else {
            return;
        };

        warn!(
            "{} {:?} of command {} rolled back",
            group, undone.direction, undone.sequence_id
        );
        if let Err(e) = self.emit_all(&events) {
            error!("Could not report {} after rollback: {}", group, e);
        }
    }

    /// Give the task waiting out `run_id` to its group so it can be aborted.
    pub fn attach_transition(&mut self, group: GroupId, run_id: u64, task: JoinHandle<()>) {
        match group {
            GroupId::Covers => self.device.covers.timer_mut().attach(run_id, task),
            GroupId::Vents => self.device.vents.timer_mut().attach(run_id, task),
        }
    }

    /// Settle a timed transition and answer the command that started it.
    /// Returns `false` for a run that was cancelled in the meantime.
    pub fn complete_transition(&mut self, group: GroupId, run_id: u64) -> bool {
        let settled = match group {
            GroupId::Covers => self.device.covers.complete(run_id),
            GroupId::Vents => self.device.vents.complete(run_id),
        };
        let Some((finished, events)) = settled else {
            debug!("Ignoring completion of cancelled {} run {}", group, run_id);
            return false;
        };

        info!("{} {:?} settled", group, finished.direction);
        match self.emit_all(&events) {
            Ok(()) => self.send_response(Ack::Success, finished.sequence_id),
            Err(e) => {
                error!("Command {} failed while settling: {}", finished.sequence_id, e);
                self.stats.commands_failed += 1;
                self.send_response(Ack::Fail, finished.sequence_id);
            }
        }
        true
    }

    /// Sample and send one round of telemetry. Returns how many samples
    /// were sent.
    pub fn update_telemetry(&mut self) -> Result<usize, SimulatorError> {
        if !self.simulator_state.is_active() {
            return Ok(0);
        }
        let Some(sink) = self.tel_sink.as_ref() else {
            return Ok(0);
        };

        let mut sent = 0;
        for sample in telemetry::sample(&self.device) {
            let message = self.codec.encode_telemetry(&sample)?;
            if sink.send(message).is_err() {
                debug!("Telemetry receiver gone");
                break;
            }
            sent += 1;
        }
        self.stats.telemetry_emitted += sent as u64;
        Ok(sent)
    }

    fn emit_all(&mut self, events: &EventList) -> Result<(), SimulatorError> {
        events.iter().try_for_each(|event| self.emit_event(event))
    }

    fn emit_event(&mut self, event: &Event) -> Result<(), SimulatorError> {
        let message = self.codec.encode_event(event)?;
        debug!("Event {}", message);
        self.send(message);
        self.stats.events_emitted += 1;
        Ok(())
    }

    fn reject(&mut self, sequence_id: i64) {
        self.stats.commands_rejected += 1;
        self.send_response(Ack::Noack, sequence_id);
    }

    fn send_response(&mut self, ack: Ack, sequence_id: i64) {
        match self.codec.encode_response(&CommandResponse::new(ack, sequence_id)) {
            Ok(message) => self.send(message),
            Err(e) => error!("Could not encode {:?} for {}: {}", ack, sequence_id, e),
        }
    }

    fn send(&self, message: Value) {
        if let Some(sink) = self.evt_sink.as_ref() {
            if sink.send(message).is_err() {
                debug!("Command client receiver gone");
            }
        }
    }
}

/// Shared, lockable simulator. Cloning yields another handle to the same
/// simulator.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    inner: Arc<Mutex<PneumaticsSimulator>>,
}

impl SimulatorHandle {
    pub fn new(simulator: PneumaticsSimulator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(simulator)),
        }
    }

    pub fn from_config(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        Ok(Self::new(PneumaticsSimulator::new(config)?))
    }

    pub async fn lock(&self) -> MutexGuard<'_, PneumaticsSimulator> {
        self.inner.lock().await
    }

    pub async fn connect_command_client(&self, sink: MessageSink) -> Result<(), SimulatorError> {
        self.inner.lock().await.connect_command_client(sink)
    }

    pub async fn disconnect_command_client(&self) {
        self.inner.lock().await.disconnect_command_client();
    }

    /// Attach a telemetry client and (re)start the sampling loop.
    pub async fn connect_telemetry_client(&self, sink: MessageSink) {
        let mut simulator = self.inner.lock().await;
        simulator.connect_telemetry_client(sink);
        let interval = simulator.telemetry_interval();
        let task = telemetry::spawn_telemetry_loop(self.clone(), interval);
        simulator.set_telemetry_task(task);
    }

    pub async fn disconnect_telemetry_client(&self) {
        self.inner.lock().await.disconnect_telemetry_client();
    }

    /// Process one inbound command line, spawning the timer of a timed
    /// transition if the handler started one.
    pub async fn handle_payload(&self, line: &str) {
        let mut simulator = self.inner.lock().await;
        if let Some(Dispatch::Pending {
            group,
            run_id,
            wait,
        }) = simulator.handle_line(line)
        {
            // Spawned under the lock, so the task cannot settle before its
            // handle is attached.
            let handle = self.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                handle.inner.lock().await.complete_transition(group, run_id);
            });
            simulator.attach_transition(group, run_id, task);
        }
    }

    pub async fn stats(&self) -> SimulatorStats {
        self.inner.lock().await.stats()
    }

    pub async fn simulator_state(&self) -> SimulatorState {
        self.inner.lock().await.simulator_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn simulator() -> PneumaticsSimulator {
        PneumaticsSimulator::new(SimulatorConfig::default()).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = SimulatorConfig::default();
        config.device.cell_load = 0.0;
        assert!(matches!(
            PneumaticsSimulator::new(config),
            Err(SimulatorError::Config(_))
        ));
    }

    #[test]
    fn test_connect_reports_every_event_once() {
        let mut sim = simulator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sim.connect_command_client(tx).unwrap();

        let mut ids = Vec::new();
        while let Ok(message) = rx.try_recv() {
            ids.push(message["id"].as_str().unwrap().to_owned());
        }
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids.len(), Event::NAMES.len());
        assert_eq!(sorted.len(), Event::NAMES.len());
        assert_eq!(ids[0], "m1SetPressure");
        assert_eq!(ids[1], "m2SetPressure");
        assert_eq!(ids[2], "eStop");
        assert_eq!(sim.stats().events_emitted, 13);
    }

    #[test]
    fn test_lifecycle_commands() {
        let mut sim = simulator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sim.connect_command_client(tx).unwrap();
        while rx.try_recv().is_ok() {}

        assert_eq!(sim.simulator_state(), SimulatorState::Standby);
        assert!(sim
            .handle_line(r#"{"id":"cmd_start","sequence_id":1,"value":true}"#)
            .is_none());
        assert_eq!(sim.simulator_state(), SimulatorState::Disabled);
        sim.handle_line(r#"{"id":"cmd_enable","sequence_id":2,"value":true}"#);
        assert_eq!(sim.simulator_state(), SimulatorState::Enabled);
        sim.handle_line(r#"{"id":"cmd_exitControl","sequence_id":3,"value":true}"#);
        assert_eq!(sim.simulator_state(), SimulatorState::Offline);

        let acks: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m["id"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(acks, ["ack", "success", "ack", "success", "ack", "success"]);
    }

    #[test]
    fn test_telemetry_gated_by_state_and_client() {
        let mut sim = simulator();
        assert_eq!(sim.update_telemetry().unwrap(), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        sim.connect_telemetry_client(tx);
        assert_eq!(sim.update_telemetry().unwrap(), 4);
        assert_eq!(rx.try_recv().unwrap()["id"], "m1AirPressure");

        sim.set_simulator_state(SimulatorState::Fault);
        assert_eq!(sim.update_telemetry().unwrap(), 0);
    }
}
