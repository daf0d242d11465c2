use crate::firestore::model::FieldPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// A client-side index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldIndex {
    index_id: i32,
    collection_group: String,
    segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub const UNKNOWN_ID: i32 = -1;

    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: Self::UNKNOWN_ID,
            collection_group: collection_group.into(),
            segments,
        }
    }

    pub fn with_index_id(mut self, index_id: i32) -> Self {
        self.index_id = index_id;
        self
    }

    pub fn index_id(&self) -> i32 {
        self.index_id
    }

    pub fn collection_group(&self) -> &str {
        &self.collection_group
    }

    pub fn segments(&self) -> &[IndexSegment] {
        &self.segments
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
    }
}
