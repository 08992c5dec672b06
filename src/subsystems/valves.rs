use core::fmt;

use crate::protocol::{AirValveState, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Valve {
    Instrument,
    M1,
    M2,
    /// Master air supply.
    Main,
}

impl fmt::Display for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Valve::Instrument => "instrument",
            Valve::M1 => "m1",
            Valve::M2 => "m2",
            Valve::Main => "main",
        };
        f.write_str(name)
    }
}

/// Mirror air lines with a settable pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirLine {
    M1,
    M2,
}

impl AirLine {
    pub fn valve(self) -> Valve {
        match self {
            AirLine::M1 => Valve::M1,
            AirLine::M2 => Valve::M2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AirValves {
    pub instrument: AirValveState,
    pub m1: AirValveState,
    pub m2: AirValveState,
    pub main: AirValveState,
}

impl Default for AirValves {
    fn default() -> Self {
        Self {
            instrument: AirValveState::Closed,
            m1: AirValveState::Closed,
            m2: AirValveState::Closed,
            main: AirValveState::Closed,
        }
    }
}

impl AirValves {
    pub fn get(&self, valve: Valve) -> AirValveState {
        match valve {
            Valve::Instrument => self.instrument,
            Valve::M1 => self.m1,
            Valve::M2 => self.m2,
            Valve::Main => self.main,
        }
    }

    /// Move one valve and report its state, changed or not.
    pub fn set(&mut self, valve: Valve, state: AirValveState) -> Event {
        let slot = match valve {
            Valve::Instrument => &mut self.instrument,
            Valve::M1 => &mut self.m1,
            Valve::M2 => &mut self.m2,
            Valve::Main => &mut self.main,
        };
        *slot = state;
        Self::event(valve, state)
    }

    /// An air line carries pressure only with its own valve and the master
    /// supply open.
    pub fn line_open(&self, line: AirLine) -> bool {
        self.main == AirValveState::Opened && self.get(line.valve()) == AirValveState::Opened
    }

    fn event(valve: Valve, state: AirValveState) -> Event {
        match valve {
            Valve::Instrument => Event::InstrumentState { state },
            Valve::M1 => Event::M1State { state },
            Valve::M2 => Event::M2State { state },
            Valve::Main => Event::MainValveState { state },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_even_when_unchanged() {
        let mut valves = AirValves::default();
        let opened = Event::M1State {
            state: AirValveState::Opened,
        };

        assert_eq!(valves.set(Valve::M1, AirValveState::Opened), opened);
        assert_eq!(valves.set(Valve::M1, AirValveState::Opened), opened);
        assert_eq!(valves.get(Valve::M1), AirValveState::Opened);
    }

    #[test]
    fn test_line_needs_master_supply() {
        let mut valves = AirValves::default();
        valves.set(Valve::M1, AirValveState::Opened);
        assert!(!valves.line_open(AirLine::M1));

        valves.set(Valve::Main, AirValveState::Opened);
        assert!(valves.line_open(AirLine::M1));
        assert!(!valves.line_open(AirLine::M2));
    }
}
