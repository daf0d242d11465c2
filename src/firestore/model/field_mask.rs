use std::collections::BTreeSet;

use crate::firestore::model::{BasePath, FieldPath};

/// A set of field paths touched by a patch. A path covers every path below it.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FieldMask {
    mask: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(mask: BTreeSet<FieldPath>) -> Self {
        Self { mask }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_paths<I: IntoIterator<Item = FieldPath>>(paths: I) -> Self {
        Self::new(paths.into_iter().collect())
    }

    pub fn mask(&self) -> &BTreeSet<FieldPath> {
        &self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.mask.iter().any(|candidate| candidate.is_prefix_of(path))
    }

    pub fn union(&self, paths: impl IntoIterator<Item = FieldPath>) -> FieldMask {
        let mut mask = self.mask.clone();
        mask.extend(paths);
        FieldMask::new(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::from_paths([FieldPath::from_dot_separated("a.b").unwrap()]);
        assert!(mask.covers(&FieldPath::from_dot_separated("a.b.c").unwrap()));
        assert!(!mask.covers(&FieldPath::from_dot_separated("a").unwrap()));
    }
}
