use crate::firestore::model::TargetId;
use crate::util::hard_assert;

const RESERVED_BITS: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorKind {
    TargetCache = 0,
    SyncEngine = 1,
}

/// Hands out target ids from one of two interleaved streams: even ids for
/// listen targets allocated through the target cache, odd ids for limbo
/// resolution targets allocated by the sync engine.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    kind: GeneratorKind,
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids strictly greater than `after`.
    pub fn for_target_cache(after: TargetId) -> Self {
        let mut generator = Self::new(GeneratorKind::TargetCache, after);
        generator.next_id();
        generator
    }

    /// Odd ids starting at 1.
    pub fn for_sync_engine() -> Self {
        Self::new(GeneratorKind::SyncEngine, 1)
    }

    fn new(kind: GeneratorKind, seed: TargetId) -> Self {
        let generator_id = kind as i32;
        hard_assert(
            generator_id & RESERVED_BITS == generator_id,
            format!("generator id {generator_id} uses reserved bits"),
        );
        let mut generator = Self { kind, next_id: 0 };
        generator.seek(seed);
        generator
    }

    fn seek(&mut self, target_id: TargetId) {
        let generator_id = self.kind as i32;
        let mut next = (target_id & !RESERVED_BITS) | generator_id;
        if next < target_id {
            next += 1 << RESERVED_BITS;
        }
        self.next_id = next;
    }

    pub fn next_id(&mut self) -> TargetId {
        let next = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        next
    }
}
