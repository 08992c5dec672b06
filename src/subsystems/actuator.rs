use core::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Position of a timed open/close actuator group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenCloseState {
    Closed,
    Closing,
    Opening,
    Open,
}

impl OpenCloseState {
    /// Limit switch pair `(closed, opened)` reported in this state.
    pub fn limit_switches(self) -> (bool, bool) {
        match self {
            OpenCloseState::Closed => (true, false),
            OpenCloseState::Open => (false, true),
            OpenCloseState::Closing | OpenCloseState::Opening => (false, false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Close,
    Open,
}

impl Direction {
    pub fn moving_state(self) -> OpenCloseState {
        match self {
            Direction::Close => OpenCloseState::Closing,
            Direction::Open => OpenCloseState::Opening,
        }
    }

    pub fn settled_state(self) -> OpenCloseState {
        match self {
            Direction::Close => OpenCloseState::Closed,
            Direction::Open => OpenCloseState::Open,
        }
    }

    /// Limit switch pair `(closed, opened)` once the move has finished.
    pub fn settled_switches(self) -> (bool, bool) {
        self.settled_state().limit_switches()
    }
}

/// A transition that has been started and not yet settled.
#[derive(Debug)]
pub struct PendingTransition {
    pub run_id: u64,
    pub direction: Direction,
    /// Command that started the run; it is owed a terminal response.
    pub sequence_id: i64,
    /// Where the group was when the run started.
    origin: OpenCloseState,
    handle: Option<JoinHandle<()>>,
}

impl PendingTransition {
    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug)]
pub enum TransitionRequest {
    /// Already settled in, or already moving towards, the requested end.
    NoOp,
    Start {
        run_id: u64,
        wait: Duration,
        /// Opposite-direction run cancelled to make way for this one.
        superseded: Option<PendingTransition>,
    },
}

/// Cancellable timed transition between CLOSED and OPEN.
///
/// The timer itself never sleeps: the owner spawns the wait and reports back
/// with [`ActuatorTimer::complete`]. Each run carries an id so that a
/// completion from a cancelled run is recognised and discarded.
#[derive(Debug)]
pub struct ActuatorTimer {
    state: OpenCloseState,
    close_time: Duration,
    open_time: Duration,
    next_run_id: u64,
    pending: Option<PendingTransition>,
}

impl ActuatorTimer {
    pub fn new(close_time: Duration, open_time: Duration) -> Self {
        Self {
            state: OpenCloseState::Closed,
            close_time,
            open_time,
            next_run_id: 1,
            pending: None,
        }
    }

    pub fn state(&self) -> OpenCloseState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingTransition> {
        self.pending.as_ref()
    }

    pub fn set_times(&mut self, close_time: Duration, open_time: Duration) {
        self.close_time = close_time;
        self.open_time = open_time;
    }

    pub fn transition_time(&self, direction: Direction) -> Duration {
        match direction {
            Direction::Close => self.close_time,
            Direction::Open => self.open_time,
        }
    }

    pub fn request(&mut self, direction: Direction, sequence_id: i64) -> TransitionRequest {
        if self.state == direction.settled_state() || self.state == direction.moving_state() {
            return TransitionRequest::NoOp;
        }

        let origin = self.state;
        let superseded = self.cancel();

        let run_id = self.next_run_id;
        self.next_run_id += 1;
        self.state = direction.moving_state();
        self.pending = Some(PendingTransition {
            run_id,
            direction,
            sequence_id,
            origin,
            handle: None,
        });

        TransitionRequest::Start {
            run_id,
            wait: self.transition_time(direction),
            superseded,
        }
    }

    /// Hand over the task waiting out `run_id`. A handle for a run that is no
    /// longer pending is aborted straight away.
    pub fn attach(&mut self, run_id: u64, handle: JoinHandle<()>) {
        match self.pending.as_mut() {
            Some(pending) if pending.run_id == run_id => pending.handle = Some(handle),
            _ => handle.abort(),
        }
    }

    /// Settle the run `run_id`. Returns `None` when that run was cancelled or
    /// superseded in the meantime.
    pub fn complete(&mut self, run_id: u64) -> Option<PendingTransition> {
        if self.pending.as_ref().map(|p| p.run_id) != Some(run_id) {
            return None;
        }
        let mut finished = self.pending.take()?;
        finished.handle = None;
        self.state = finished.direction.settled_state();
        Some(finished)
    }

    /// Abort the in-flight run, if any. The group stays where it was: the
    /// next request or re-initialization decides what happens to it.
    pub fn cancel(&mut self) -> Option<PendingTransition> {
        let mut pending = self.pending.take()?;
        pending.abort();
        Some(pending)
    }

    /// Undo run `run_id` because it could not be started. The group returns
    /// to the end it rested at, or, if the run had interrupted another one,
    /// to the end that earlier run set out from.
    pub fn rollback(&mut self, run_id: u64) -> Option<PendingTransition> {
        if self.pending.as_ref().map(|p| p.run_id) != Some(run_id) {
            return None;
        }
        let mut undone = self.pending.take()?;
        undone.abort();
        self.state = match undone.origin {
            OpenCloseState::Opening => OpenCloseState::Closed,
            OpenCloseState::Closing => OpenCloseState::Open,
            settled => settled,
        };
        Some(undone)
    }

    /// Drop any in-flight run and return to CLOSED.
    pub fn reset(&mut self) -> Option<PendingTransition> {
        let cancelled = self.cancel();
        self.state = OpenCloseState::Closed;
        cancelled
    }
}
