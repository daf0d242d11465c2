use std::cmp::Ordering;

/// Segment-list operations shared by [`ResourcePath`](super::ResourcePath)
/// and [`FieldPath`](super::FieldPath).
///
/// Implementors only provide access to their segments and a constructor from
/// an owned segment list; everything else derives from those two.
pub trait BasePath: Sized + Clone {
    fn segments(&self) -> &[String];

    fn from_owned_segments(segments: Vec<String>) -> Self;

    fn len(&self) -> usize {
        self.segments().len()
    }

    fn is_empty(&self) -> bool {
        self.segments().is_empty()
    }

    fn get(&self, index: usize) -> Option<&str> {
        self.segments().get(index).map(String::as_str)
    }

    fn first_segment(&self) -> Option<&str> {
        self.get(0)
    }

    fn last_segment(&self) -> Option<&str> {
        self.segments().last().map(String::as_str)
    }

    /// Returns a new path with `segment` appended.
    fn append_segment(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments().to_vec();
        segments.push(segment.into());
        Self::from_owned_segments(segments)
    }

    /// Returns a new path with every segment of `other` appended.
    fn append(&self, other: &Self) -> Self {
        let mut segments = self.segments().to_vec();
        segments.extend(other.segments().iter().cloned());
        Self::from_owned_segments(segments)
    }

    fn pop_first_n(&self, count: usize) -> Self {
        let segments = self.segments();
        if count >= segments.len() {
            return Self::from_owned_segments(Vec::new());
        }
        Self::from_owned_segments(segments[count..].to_vec())
    }

    fn pop_first(&self) -> Self {
        self.pop_first_n(1)
    }

    fn without_last(&self) -> Self {
        let segments = self.segments();
        let keep = segments.len().saturating_sub(1);
        Self::from_owned_segments(segments[..keep].to_vec())
    }

    fn is_prefix_of(&self, other: &Self) -> bool {
        let mine = self.segments();
        let theirs = other.segments();
        mine.len() <= theirs.len() && mine.iter().zip(theirs).all(|(l, r)| l == r)
    }

    /// True when `other` is exactly one segment longer and starts with `self`.
    fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    fn compare_segments(&self, other: &Self) -> Ordering {
        for (left, right) in self.segments().iter().zip(other.segments()) {
            match left.cmp(right) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.len().cmp(&other.len())
    }
}
