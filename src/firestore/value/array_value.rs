use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Membership using value equality (NaN matches NaN, 1 does not match 1.0).
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == needle)
    }

    /// Appends every element of `additions` not already present.
    pub fn union(&self, additions: &[FirestoreValue]) -> ArrayValue {
        let mut values = self.values.clone();
        for element in additions {
            if !values.iter().any(|candidate| candidate == element) {
                values.push(element.clone());
            }
        }
        ArrayValue::new(values)
    }

    /// Drops every element equal to one of `removals`.
    pub fn remove_all(&self, removals: &[FirestoreValue]) -> ArrayValue {
        ArrayValue::new(
            self.values
                .iter()
                .filter(|candidate| !removals.contains(candidate))
                .cloned()
                .collect(),
        )
    }
}
