use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::BasePath;

const KEY_FIELD_NAME: &str = "__name__";

/// A dot-separated path to a (possibly nested) field inside a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl BasePath for FieldPath {
    fn segments(&self) -> &[String] {
        &self.segments
    }

    fn from_owned_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument("FieldPath must contain at least one segment"));
        }
        if segments.iter().any(String::is_empty) {
            return Err(invalid_argument("FieldPath segments must not be empty"));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    /// The root path, addressing a whole document's data.
    pub fn empty_path() -> Self {
        Self::default()
    }

    /// The special `__name__` field that orders and filters by document key.
    pub fn key_path() -> Self {
        Self {
            segments: vec![KEY_FIELD_NAME.to_string()],
        }
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == KEY_FIELD_NAME
    }

    /// Dot-joined form with non-identifier segments quoted in backticks.
    pub fn canonical_string(&self) -> String {
        self.segments
            .iter()
            .map(|segment| quote_segment(segment))
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn is_valid_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn quote_segment(segment: &str) -> String {
    if is_valid_identifier(segment) {
        return segment.to_string();
    }
    let escaped = segment.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_segments(other)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// Trait that converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self)
    }
}

impl IntoFieldPath for &FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for &str {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        if self == KEY_FIELD_NAME {
            return Ok(FieldPath::key_path());
        }
        FieldPath::from_dot_separated(self)
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        self.as_str().into_field_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("foo.bar").unwrap();
        assert_eq!(field.segments(), &["foo", "bar"]);
        assert_eq!(field.last_segment(), Some("bar"));
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(FieldPath::from_dot_separated("").is_err());
        assert!(FieldPath::from_dot_separated("a..b").is_err());
    }

    #[test]
    fn canonical_string_quotes_non_identifiers() {
        let field = FieldPath::new(["a", "b c", "`x`"]).unwrap();
        assert_eq!(field.canonical_string(), "a.`b c`.`\\`x\\``");
        assert_eq!(FieldPath::new(["_ok1"]).unwrap().canonical_string(), "_ok1");
        assert_eq!(FieldPath::new(["1a"]).unwrap().canonical_string(), "`1a`");
    }

    #[test]
    fn key_path_is_recognised() {
        assert!("__name__".into_field_path().unwrap().is_key_field());
        assert!(!FieldPath::new(["a", "__name__"]).unwrap().is_key_field());
    }

    #[test]
    fn orders_segment_wise() {
        let a = FieldPath::from_dot_separated("a").unwrap();
        let ab = FieldPath::from_dot_separated("a.b").unwrap();
        let b = FieldPath::from_dot_separated("b").unwrap();
        assert!(a < ab);
        assert!(ab < b);
        assert!(a.is_prefix_of(&ab));
    }
}
