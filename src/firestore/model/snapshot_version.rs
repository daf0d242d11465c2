use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or of the whole remote state, as reported by the
/// backend. [`SnapshotVersion::NONE`] means "never seen".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub const NONE: SnapshotVersion = SnapshotVersion(Timestamp {
        seconds: 0,
        nanos: 0,
    });

    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::from_micros(micros))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({}, {})", self.0.seconds, self.0.nanos)
    }
}
