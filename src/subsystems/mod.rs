pub mod actuator;
pub mod covers;
pub mod valves;
pub mod vents;

pub use actuator::{
    ActuatorTimer, Direction, OpenCloseState, PendingTransition, TransitionRequest,
};
pub use covers::MirrorCovers;
pub use valves::{AirLine, AirValves, Valve};
pub use vents::CellVents;

use core::fmt;
use core::time::Duration;

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;
use crate::protocol::{Event, PowerStatus};

/// Most events a single state change can produce (the vents emit three).
pub const MAX_TRANSITION_EVENTS: usize = 4;

pub type EventList = Vec<Event, MAX_TRANSITION_EVENTS>;

/// Push into a fixed-size event list. The capacity covers every group, so an
/// overflow is a programming error caught in debug builds.
pub(crate) fn push_event(events: &mut EventList, event: Event) {
    let pushed = events.push(event);
    debug_assert!(pushed.is_ok(), "event list capacity exceeded");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupId {
    Covers,
    Vents,
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Covers => f.write_str("m1 covers"),
            GroupId::Vents => f.write_str("cell vents"),
        }
    }
}

/// Outcome of asking an actuator group to move.
#[derive(Debug)]
pub struct Motion {
    pub request: TransitionRequest,
    /// In-motion events, empty for a no-op request.
    pub events: EventList,
}

/// A timed open/close group whose limit switches drive its reported state.
pub trait ActuatorGroup {
    fn timer(&self) -> &ActuatorTimer;
    fn timer_mut(&mut self) -> &mut ActuatorTimer;

    /// Latch a limit switch pair and return the events describing it.
    fn set_limit_switches(&mut self, closed: bool, opened: bool) -> EventList;

    fn request(&mut self, direction: Direction, sequence_id: i64) -> Motion {
        let request = self.timer_mut().request(direction, sequence_id);
        let events = match request {
            TransitionRequest::NoOp => EventList::new(),
            TransitionRequest::Start { .. } => self.set_limit_switches(false, false),
        };
        Motion { request, events }
    }

    /// Settle run `run_id` and return its settled events, or `None` if the
    /// run was cancelled.
    fn complete(&mut self, run_id: u64) -> Option<(PendingTransition, EventList)> {
        let finished = self.timer_mut().complete(run_id)?;
        let (closed, opened) = finished.direction.settled_switches();
        let events = self.set_limit_switches(closed, opened);
        Some((finished, events))
    }

    /// Undo run `run_id` after its in-motion report failed. Returns the events
    /// re-describing where the group is now.
    fn rollback(&mut self, run_id: u64) -> Option<(PendingTransition, EventList)> {
        let undone = self.timer_mut().rollback(run_id)?;
        let (closed, opened) = self.timer().state().limit_switches();
        Some((undone, self.set_limit_switches(closed, opened)))
    }

    /// Back to CLOSED with the closed switch latched, cancelling any run.
    fn initialize(&mut self) -> (Option<PendingTransition>, EventList) {
        let cancelled = self.timer_mut().reset();
        (cancelled, self.set_limit_switches(true, false))
    }
}

/// Negative or non-finite times are rejected when the configuration is
/// validated; anything that slips through waits zero seconds.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// Everything the pneumatics controller reports.
#[derive(Debug)]
pub struct DeviceState {
    pub valves: AirValves,
    pub covers: MirrorCovers,
    pub vents: CellVents,
    pub m1_set_pressure: f64,
    pub m2_set_pressure: f64,
    pub main_pressure: f64,
    pub cell_load: f64,
    pub power: PowerStatus,
    pub e_stop: bool,
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            valves: AirValves::default(),
            covers: MirrorCovers::new(Duration::ZERO, Duration::ZERO),
            vents: CellVents::new(Duration::ZERO, Duration::ZERO),
            m1_set_pressure: 0.0,
            m2_set_pressure: 0.0,
            main_pressure: 0.0,
            cell_load: 0.0,
            power: PowerStatus::default(),
            e_stop: false,
        }
    }

    /// Apply device tuning. Returns the set-pressure events.
    pub fn configure(&mut self, config: &DeviceConfig) -> EventList {
        self.covers.timer_mut().set_times(
            seconds(config.m1_covers_close_time),
            seconds(config.m1_covers_open_time),
        );
        self.vents.timer_mut().set_times(
            seconds(config.cell_vents_close_time),
            seconds(config.cell_vents_open_time),
        );
        self.main_pressure = config.main_pressure;
        self.cell_load = config.cell_load;
        self.m1_set_pressure = config.m1_pressure;
        self.m2_set_pressure = config.m2_pressure;

        let mut events = EventList::new();
        push_event(
            &mut events,
            Event::M1SetPressure {
                pressure: self.m1_set_pressure,
            },
        );
        push_event(
            &mut events,
            Event::M2SetPressure {
                pressure: self.m2_set_pressure,
            },
        );
        events
    }

    /// Set an air line's pressure and report it.
    pub fn set_pressure(&mut self, line: AirLine, pressure: f64) -> Event {
        match line {
            AirLine::M1 => {
                self.m1_set_pressure = pressure;
                Event::M1SetPressure { pressure }
            }
            AirLine::M2 => {
                self.m2_set_pressure = pressure;
                Event::M2SetPressure { pressure }
            }
        }
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}
