/// Enforces gapless, strictly increasing command sequence ids on one
/// connection.
///
/// The first command after a reset is accepted whatever its id and seeds the
/// counter. After that only `last + 1` is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceValidator {
    last_accepted: Option<i64>,
}

impl SequenceValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_accepted(&self) -> Option<i64> {
        self.last_accepted
    }

    /// The id the validator expects next, if it has been seeded.
    pub fn expected(&self) -> Option<i64> {
        self.last_accepted.and_then(|last| last.checked_add(1))
    }

    /// Would `sequence_id` be accepted? Does not mutate.
    pub fn is_next(&self, sequence_id: i64) -> bool {
        match self.last_accepted {
            None => true,
            Some(_) => self.expected() == Some(sequence_id),
        }
    }

    /// Accept `sequence_id` if it is next in line. A rejected id leaves the
    /// counter untouched.
    pub fn validate(&mut self, sequence_id: i64) -> bool {
        if !self.is_next(sequence_id) {
            return false;
        }
        self.last_accepted = Some(sequence_id);
        true
    }

    /// Forget the counter; the next command seeds it again.
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}
