use core::time::Duration;

use super::{push_event, ActuatorGroup, ActuatorTimer, EventList};
use crate::protocol::{Event, M1CoverLimitSwitches, MirrorCoverState};

/// The four M1 mirror cover petals, driven together.
#[derive(Debug)]
pub struct MirrorCovers {
    timer: ActuatorTimer,
    switches: M1CoverLimitSwitches,
    state: MirrorCoverState,
}

impl MirrorCovers {
    pub fn new(close_time: Duration, open_time: Duration) -> Self {
        Self {
            timer: ActuatorTimer::new(close_time, open_time),
            switches: M1CoverLimitSwitches::uniform(true, false),
            state: MirrorCoverState::Closed,
        }
    }

    pub fn switches(&self) -> M1CoverLimitSwitches {
        self.switches
    }

    pub fn state(&self) -> MirrorCoverState {
        self.state
    }
}

impl ActuatorGroup for MirrorCovers {
    fn timer(&self) -> &ActuatorTimer {
        &self.timer
    }

    fn timer_mut(&mut self) -> &mut ActuatorTimer {
        &mut self.timer
    }

    fn set_limit_switches(&mut self, closed: bool, opened: bool) -> EventList {
        self.switches = M1CoverLimitSwitches::uniform(closed, opened);
        self.state = match (closed, opened) {
            (true, true) => MirrorCoverState::Invalid,
            (false, true) => MirrorCoverState::Opened,
            (true, false) => MirrorCoverState::Closed,
            (false, false) => MirrorCoverState::InMotion,
        };

        let mut events = EventList::new();
        push_event(&mut events, Event::M1CoverLimitSwitches(self.switches));
        push_event(&mut events, Event::M1CoverState { state: self.state });
        events
    }
}
