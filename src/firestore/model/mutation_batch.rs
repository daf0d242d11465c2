use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    Document, DocumentKey, FieldMask, Mutation, MutationResult, SnapshotVersion, Timestamp,
};
use crate::util::hard_assert;

pub type BatchId = i32;

/// Marker for "no batch"; batch ids handed out by a queue start at 1.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A document together with the fields changed by the mutations applied to it
/// so far (`None` means the whole document was rewritten).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: Document, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}

/// Mutations written atomically by one user operation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    base_mutations: Vec<Mutation>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        hard_assert(!mutations.is_empty(), "cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn base_mutations(&self) -> &[Mutation] {
        &self.base_mutations
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies the acknowledged results of this batch to the cached remote
    /// version of `document`.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        let results = result.mutation_results();
        hard_assert(
            results.len() == self.mutations.len(),
            format!(
                "mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                results.len()
            ),
        );
        for (mutation, mutation_result) in self.mutations.iter().zip(results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Applies base mutations and then user mutations for `document`'s key.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every affected document in `documents` and returns
    /// the resulting overlay per key.
    ///
    /// Keys in `without_remote_version` are squashed as whole-document writes.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mask = self.apply_to_local_view(
                &mut overlayed.document,
                overlayed.mutated_fields.clone(),
            );
            let mask = if without_remote_version.contains(&key) {
                None
            } else {
                mask
            };
            if let Some(overlay) = Mutation::calculate_overlay_mutation(&overlayed.document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::NONE);
            }
        }
        overlays
    }
}

/// The backend's acknowledgement of a whole batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    batch: MutationBatch,
    commit_version: SnapshotVersion,
    mutation_results: Vec<MutationResult>,
    stream_token: Vec<u8>,
    doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Self {
        hard_assert(
            batch.mutations().len() == mutation_results.len(),
            format!(
                "mutations sent {} must equal results received {}",
                batch.mutations().len(),
                mutation_results.len()
            ),
        );
        let doc_versions = batch
            .mutations()
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }

    pub fn batch(&self) -> &MutationBatch {
        &self.batch
    }

    pub fn commit_version(&self) -> SnapshotVersion {
        self.commit_version
    }

    pub fn mutation_results(&self) -> &[MutationResult] {
        &self.mutation_results
    }

    pub fn stream_token(&self) -> &[u8] {
        &self.stream_token
    }

    pub fn doc_versions(&self) -> &BTreeMap<DocumentKey, SnapshotVersion> {
        &self.doc_versions
    }
}
