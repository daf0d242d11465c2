use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::BasePath;

/// A slash-separated path to a collection or document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl BasePath for ResourcePath {
    fn segments(&self) -> &[String] {
        &self.segments
    }

    fn from_owned_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }
}

impl ResourcePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_offset(segments: Vec<String>, offset: usize) -> Self {
        Self::from_owned_segments(segments).pop_first_n(offset)
    }

    /// Parses `a/b/c`. Leading and trailing slashes are tolerated, empty
    /// interior segments are not.
    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.split('/').any(str::is_empty) {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain // in them."
            )));
        }
        Ok(Self::from_segments(trimmed.split('/')))
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut extended = self.segments.clone();
        extended.extend(segments.into_iter().map(Into::into));
        Self { segments: extended }
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        left.compare_segments(right)
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_segments(other)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}
