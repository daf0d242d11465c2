use crate::firestore::core::Target;
use crate::firestore::model::{SnapshotVersion, TargetId};

pub type ListenSequenceNumber = i64;

/// Sequence number of targets that never take part in garbage collection.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Why the client is tracking a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryPurpose {
    /// A user-initiated listen.
    Listen,
    /// Re-listen after the server's existence filter disagreed with the
    /// cached result count.
    ExistenceFilterMismatch,
    /// A single-document listen confirming whether a limbo document exists.
    LimboResolution,
}

/// Cached bookkeeping for a target the client tracks with the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    target: Target,
    target_id: TargetId,
    purpose: QueryPurpose,
    sequence_number: ListenSequenceNumber,
    snapshot_version: SnapshotVersion,
    last_limbo_free_snapshot_version: SnapshotVersion,
    resume_token: Vec<u8>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: QueryPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::NONE,
            last_limbo_free_snapshot_version: SnapshotVersion::NONE,
            resume_token: Vec::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn purpose(&self) -> QueryPurpose {
        self.purpose
    }

    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    /// Version at which the view for this target last had no limbo documents;
    /// results up to that version can be reused when the target is
    /// re-executed.
    pub fn last_limbo_free_snapshot_version(&self) -> SnapshotVersion {
        self.last_limbo_free_snapshot_version
    }

    pub fn resume_token(&self) -> &[u8] {
        &self.resume_token
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: QueryPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
