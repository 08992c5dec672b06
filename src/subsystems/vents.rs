use core::time::Duration;

use super::{push_event, ActuatorGroup, ActuatorTimer, EventList};
use crate::protocol::{CellVentState, Event, M1VentsLimitSwitches, VentsPosition};

/// M1 cell vents.
#[derive(Debug)]
pub struct CellVents {
    timer: ActuatorTimer,
    switches: M1VentsLimitSwitches,
    position: VentsPosition,
    state: CellVentState,
}

impl CellVents {
    pub fn new(close_time: Duration, open_time: Duration) -> Self {
        Self {
            timer: ActuatorTimer::new(close_time, open_time),
            switches: M1VentsLimitSwitches {
                vents_closed_active: true,
                vents_opened_active: false,
            },
            position: VentsPosition::Closed,
            state: CellVentState::Closed,
        }
    }

    pub fn switches(&self) -> M1VentsLimitSwitches {
        self.switches
    }

    pub fn position(&self) -> VentsPosition {
        self.position
    }

    pub fn state(&self) -> CellVentState {
        self.state
    }
}

impl ActuatorGroup for CellVents {
    fn timer(&self) -> &ActuatorTimer {
        &self.timer
    }

    fn timer_mut(&mut self) -> &mut ActuatorTimer {
        &mut self.timer
    }

    fn set_limit_switches(&mut self, closed: bool, opened: bool) -> EventList {
        self.switches = M1VentsLimitSwitches {
            vents_closed_active: closed,
            vents_opened_active: opened,
        };
        // The opened switch wins when both are active.
        (self.position, self.state) = match (closed, opened) {
            (_, true) => (VentsPosition::Opened, CellVentState::Opened),
            (true, false) => (VentsPosition::Closed, CellVentState::Closed),
            (false, false) => (VentsPosition::PartiallyOpened, CellVentState::InMotion),
        };

        let mut events = EventList::new();
        push_event(&mut events, Event::CellVentsState { state: self.state });
        push_event(
            &mut events,
            Event::M1VentsPosition {
                position: self.position,
            },
        );
        push_event(&mut events, Event::M1VentsLimitSwitches(self.switches));
        events
    }
}
