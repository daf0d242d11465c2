use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{values, FirestoreValue};
use crate::util::hard_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array_contains",
            Operator::ArrayContainsAny => "array_contains_any",
            Operator::In => "in",
            Operator::NotIn => "not_in",
        }
    }

    pub fn parse(op: &str) -> FirestoreResult<Self> {
        match op {
            "<" => Ok(Operator::LessThan),
            "<=" => Ok(Operator::LessThanOrEqual),
            "==" => Ok(Operator::Equal),
            "!=" => Ok(Operator::NotEqual),
            ">" => Ok(Operator::GreaterThan),
            ">=" => Ok(Operator::GreaterThanOrEqual),
            "array-contains" | "array_contains" => Ok(Operator::ArrayContains),
            "array-contains-any" | "array_contains_any" => Ok(Operator::ArrayContainsAny),
            "in" => Ok(Operator::In),
            "not-in" | "not_in" => Ok(Operator::NotIn),
            other => Err(invalid_argument(format!("unknown filter operator '{other}'"))),
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn takes_array_operand(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn | Operator::ArrayContainsAny)
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `field op value` predicate.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: Operator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array_operand() {
            match value.as_array() {
                Some(array) if !array.is_empty() => {}
                _ => {
                    return Err(invalid_argument(format!(
                        "a non-empty array is required for '{op}' filters"
                    )))
                }
            }
        }
        if field.is_key_field() {
            Self::validate_key_operand(op, &value)?;
        }
        Ok(Self { field, op, value })
    }

    fn validate_key_operand(op: Operator, value: &FirestoreValue) -> FirestoreResult<()> {
        let is_key = |value: &FirestoreValue| {
            value
                .as_reference()
                .is_some_and(|name| DocumentKey::from_name(name).is_ok())
        };
        let valid = match op {
            Operator::ArrayContains | Operator::ArrayContainsAny => false,
            Operator::In | Operator::NotIn => value
                .as_array()
                .is_some_and(|array| array.values().iter().all(is_key)),
            _ => is_key(value),
        };
        if valid {
            Ok(())
        } else {
            Err(invalid_argument(format!(
                "invalid document key operand for '{op}' filter on __name__"
            )))
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            values::canonical_id(&self.value)
        )
    }

    pub fn matches(&self, document: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        let Some(other) = document.field(&self.field) else {
            return false;
        };
        match self.op {
            Operator::ArrayContains => other
                .as_array()
                .is_some_and(|array| array.contains(&self.value)),
            Operator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => {
                    array.values().iter().any(|element| needles.contains(element))
                }
                _ => false,
            },
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(other)),
            // Null fields never satisfy `!=` or `not-in`.
            Operator::NotIn => {
                !other.is_null()
                    && self.value.as_array().is_some_and(|candidates| {
                        !candidates.contains(&FirestoreValue::null()) && !candidates.contains(other)
                    })
            }
            // Types need not match for inequality.
            Operator::NotEqual => {
                !other.is_null() && self.op.matches_comparison(values::compare(other, &self.value))
            }
            _ => {
                other.type_order() == self.value.type_order()
                    && self.op.matches_comparison(values::compare(other, &self.value))
            }
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        let parse = |value: &FirestoreValue| {
            value
                .as_reference()
                .and_then(|name| DocumentKey::from_name(name).ok())
        };
        match self.op {
            Operator::In | Operator::NotIn => {
                let found = self
                    .value
                    .as_array()
                    .is_some_and(|array| array.values().iter().filter_map(parse).any(|k| &k == key));
                (self.op == Operator::In) == found
            }
            _ => parse(&self.value)
                .is_some_and(|operand| self.op.matches_comparison(key.cmp(&operand))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    filters: Vec<Filter>,
    op: CompositeOperator,
}

impl CompositeFilter {
    pub fn new(filters: Vec<Filter>, op: CompositeOperator) -> Self {
        Self { filters, op }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    pub fn is_conjunction(&self) -> bool {
        self.op == CompositeOperator::And
    }

    pub fn is_disjunction(&self) -> bool {
        self.op == CompositeOperator::Or
    }

    /// True when every child is a field filter.
    pub fn is_flat(&self) -> bool {
        self.filters
            .iter()
            .all(|filter| matches!(filter, Filter::Field(_)))
    }

    pub fn is_flat_conjunction(&self) -> bool {
        self.is_flat() && self.is_conjunction()
    }

    fn with_added_filters(&self, added: impl IntoIterator<Item = Filter>) -> CompositeFilter {
        let mut filters = self.filters.clone();
        filters.extend(added);
        CompositeFilter::new(filters, self.op)
    }
}

/// A boolean expression over field predicates.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl From<FieldFilter> for Filter {
    fn from(filter: FieldFilter) -> Self {
        Filter::Field(filter)
    }
}

impl From<CompositeFilter> for Filter {
    fn from(filter: CompositeFilter) -> Self {
        Filter::Composite(filter)
    }
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(filters, CompositeOperator::And))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(filters, CompositeOperator::Or))
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) if composite.is_conjunction() => {
                composite.filters.iter().all(|filter| filter.matches(document))
            }
            Filter::Composite(composite) => {
                composite.filters.iter().any(|filter| filter.matches(document))
            }
        }
    }

    /// Every field filter in the tree, left to right.
    pub fn flattened_filters(&self) -> Vec<&FieldFilter> {
        let mut out = Vec::new();
        self.collect_field_filters(&mut out);
        out
    }

    fn collect_field_filters<'a>(&'a self, out: &mut Vec<&'a FieldFilter>) {
        match self {
            Filter::Field(filter) => out.push(filter),
            Filter::Composite(composite) => {
                for filter in &composite.filters {
                    filter.collect_field_filters(out);
                }
            }
        }
    }

    pub fn first_inequality_field(&self) -> Option<&FieldPath> {
        self.flattened_filters()
            .into_iter()
            .find(|filter| filter.is_inequality())
            .map(FieldFilter::field)
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) if composite.is_flat_conjunction() => composite
                .filters
                .iter()
                .map(Filter::canonical_id)
                .collect(),
            Filter::Composite(composite) => {
                let children: Vec<String> =
                    composite.filters.iter().map(Filter::canonical_id).collect();
                let op = if composite.is_conjunction() { "and" } else { "or" };
                format!("{op}({})", children.join(","))
            }
        }
    }

    fn is_single_field_filter(&self) -> bool {
        matches!(self, Filter::Field(_))
    }

    fn is_flat_conjunction(&self) -> bool {
        matches!(self, Filter::Composite(composite) if composite.is_flat_conjunction())
    }

    fn is_disjunction_of_flat_terms(&self) -> bool {
        match self {
            Filter::Composite(composite) => {
                composite.is_disjunction()
                    && composite.filters.iter().all(|filter| {
                        filter.is_single_field_filter() || filter.is_flat_conjunction()
                    })
            }
            Filter::Field(_) => false,
        }
    }

    /// Whether the filter is an OR of flat ANDs (or a flat AND, or an atom).
    pub fn is_disjunctive_normal_form(&self) -> bool {
        self.is_single_field_filter()
            || self.is_flat_conjunction()
            || self.is_disjunction_of_flat_terms()
    }

    /// Flattens nested composites that share an operator and unwraps
    /// single-child composites.
    pub fn apply_associativity(&self) -> Filter {
        let Filter::Composite(composite) = self else {
            return self.clone();
        };
        if composite.filters.len() == 1 {
            return composite.filters[0].apply_associativity();
        }
        if composite.is_flat() {
            return self.clone();
        }

        let mut flattened = Vec::new();
        for child in composite.filters.iter().map(Filter::apply_associativity) {
            match child {
                Filter::Composite(inner) if inner.op == composite.op => {
                    flattened.extend(inner.filters)
                }
                other => flattened.push(other),
            }
        }
        if flattened.len() == 1 {
            return flattened.remove(0);
        }
        Filter::Composite(CompositeFilter::new(flattened, composite.op))
    }

    /// Conjunction of `self` and `other`, distributing AND over OR.
    pub fn apply_distribution(&self, other: &Filter) -> Filter {
        let result = match (self, other) {
            (Filter::Field(_), Filter::Field(_)) => Filter::and(vec![self.clone(), other.clone()]),
            (Filter::Field(field), Filter::Composite(composite))
            | (Filter::Composite(composite), Filter::Field(field)) => {
                distribute_field(field, composite)
            }
            (Filter::Composite(left), Filter::Composite(right)) => {
                distribute_composites(left, right)
            }
        };
        result.apply_associativity()
    }

    /// Disjunctive normal form of the filter. Idempotent.
    pub fn compute_dnf(&self) -> Filter {
        let Filter::Composite(composite) = self else {
            return self.clone();
        };
        if composite.filters.len() == 1 {
            return composite.filters[0].compute_dnf();
        }

        let children = composite.filters.iter().map(Filter::compute_dnf).collect();
        let normalized =
            Filter::Composite(CompositeFilter::new(children, composite.op)).apply_associativity();
        if normalized.is_disjunctive_normal_form() {
            return normalized;
        }

        let Filter::Composite(conjunction) = &normalized else {
            return normalized;
        };
        hard_assert(
            conjunction.is_conjunction(),
            "a disjunction of filters in DNF is itself in DNF",
        );
        hard_assert(
            conjunction.filters.len() > 1,
            "single-filter composite filters are already in DNF",
        );
        let mut terms = conjunction.filters.iter();
        let mut running = terms.next().cloned().unwrap_or_else(|| normalized.clone());
        for term in terms {
            running = running.apply_distribution(term);
        }
        running
    }

    /// Rewrites every `in` filter as an OR of equalities.
    pub fn compute_in_expansion(&self) -> Filter {
        match self {
            Filter::Field(filter) if filter.op == Operator::In => {
                let expanded = filter
                    .value
                    .as_array()
                    .map(|array| {
                        array
                            .values()
                            .iter()
                            .map(|value| {
                                Filter::Field(FieldFilter {
                                    field: filter.field.clone(),
                                    op: Operator::Equal,
                                    value: value.clone(),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Filter::or(expanded)
            }
            Filter::Field(_) => self.clone(),
            Filter::Composite(composite) => Filter::Composite(CompositeFilter::new(
                composite
                    .filters
                    .iter()
                    .map(Filter::compute_in_expansion)
                    .collect(),
                composite.op,
            )),
        }
    }

    /// The OR-terms of the DNF of this filter after `in` expansion. Each term is
    /// a field filter or a flat conjunction servable by one index scan.
    pub fn dnf_terms(&self) -> Vec<Filter> {
        if let Filter::Composite(composite) = self {
            if composite.filters.is_empty() {
                return Vec::new();
            }
        }
        let result = self.compute_in_expansion().compute_dnf();
        hard_assert(
            result.is_disjunctive_normal_form(),
            "compute_dnf did not produce disjunctive normal form",
        );
        if result.is_single_field_filter() || result.is_flat_conjunction() {
            return vec![result];
        }
        match result {
            Filter::Composite(composite) => composite.filters,
            field => vec![field],
        }
    }
}

fn distribute_field(field: &FieldFilter, composite: &CompositeFilter) -> Filter {
    // A & (B & C) => (B & C & A)
    if composite.is_conjunction() {
        return Filter::Composite(composite.with_added_filters([Filter::Field(field.clone())]));
    }
    // A & (B | C) => (A & B) | (A & C)
    let field = Filter::Field(field.clone());
    Filter::or(
        composite
            .filters
            .iter()
            .map(|child| field.apply_distribution(child))
            .collect(),
    )
}

fn distribute_composites(left: &CompositeFilter, right: &CompositeFilter) -> Filter {
    hard_assert(
        !left.filters.is_empty() && !right.filters.is_empty(),
        "found an empty composite filter",
    );
    // (A & B) & (C & D) => (A & B & C & D)
    if left.is_conjunction() && right.is_conjunction() {
        return Filter::Composite(left.with_added_filters(right.filters.iter().cloned()));
    }
    // (A | B) & (C & D) => (A & C & D) | (B & C & D)
    let (disjunction, other) = if left.is_disjunction() {
        (left, right)
    } else {
        (right, left)
    };
    let other = Filter::Composite(other.clone());
    Filter::or(
        disjunction
            .filters
            .iter()
            .map(|child| child.apply_distribution(&other))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn filter(field: &str, op: &str, value: FirestoreValue) -> Filter {
        Filter::Field(
            FieldFilter::new(
                FieldPath::from_dot_separated(field).unwrap(),
                Operator::parse(op).unwrap(),
                value,
            )
            .unwrap(),
        )
    }

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    fn doc(entries: &[(&str, FirestoreValue)]) -> Document {
        let fields: BTreeMap<String, FirestoreValue> = entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Document::new_found(
            DocumentKey::from_string("coll/doc").unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(fields),
        )
    }

    #[test]
    fn distributes_and_over_or() {
        let a = filter("a", "==", int(1));
        let b = filter("b", "==", int(2));
        let c = filter("c", "==", int(3));
        let input = Filter::and(vec![a.clone(), Filter::or(vec![b.clone(), c.clone()])]);
        let expected = Filter::or(vec![
            Filter::and(vec![a.clone(), b]),
            Filter::and(vec![a, c]),
        ]);
        assert_eq!(input.compute_dnf(), expected);
    }

    #[test]
    fn dnf_is_idempotent() {
        let a = filter("a", "==", int(1));
        let b = filter("b", "==", int(2));
        let c = filter("c", "==", int(3));
        let d = filter("d", "==", int(4));
        let input = Filter::and(vec![
            Filter::or(vec![a, b]),
            Filter::or(vec![c, Filter::and(vec![d])]),
        ]);
        let dnf = input.compute_dnf();
        assert!(dnf.is_disjunctive_normal_form());
        assert_eq!(dnf.compute_dnf(), dnf);
        match &dnf {
            Filter::Composite(composite) => assert_eq!(composite.filters().len(), 4),
            other => panic!("unexpected dnf {other:?}"),
        }
    }

    #[test]
    fn associativity_flattens_nested_composites() {
        let a = filter("a", "==", int(1));
        let b = filter("b", "==", int(2));
        let c = filter("c", "==", int(3));
        let nested = Filter::and(vec![Filter::and(vec![a.clone(), b.clone()]), c.clone()]);
        assert_eq!(nested.apply_associativity(), Filter::and(vec![a.clone(), b, c]));
        assert_eq!(Filter::or(vec![Filter::or(vec![a.clone()])]).apply_associativity(), a);
    }

    #[test]
    fn in_filters_expand_into_dnf_terms() {
        let input = Filter::and(vec![
            filter("a", "in", FirestoreValue::from_array(vec![int(1), int(2)])),
            filter("b", "==", int(3)),
        ]);
        let terms = input.dnf_terms();
        assert_eq!(terms.len(), 2);
        assert!(terms.iter().all(|term| term.is_flat_conjunction()));
    }

    #[test]
    fn array_operators_require_non_empty_arrays() {
        let field = FieldPath::from_dot_separated("a").unwrap();
        assert!(FieldFilter::new(field.clone(), Operator::In, FirestoreValue::from_array(vec![])).is_err());
        assert!(FieldFilter::new(field, Operator::NotIn, int(1)).is_err());
    }

    #[test]
    fn equality_matches_nan_only_against_nan() {
        let nan = filter("a", "==", FirestoreValue::from_double(f64::NAN));
        assert!(nan.matches(&doc(&[("a", FirestoreValue::from_double(f64::NAN))])));
        assert!(!nan.matches(&doc(&[("a", FirestoreValue::from_double(1.0))])));
        let not_nan = filter("a", "!=", FirestoreValue::from_double(f64::NAN));
        assert!(not_nan.matches(&doc(&[("a", int(1))])));
        assert!(!not_nan.matches(&doc(&[])));
    }

    #[test]
    fn not_in_with_null_never_matches() {
        let with_null = filter(
            "a",
            "not-in",
            FirestoreValue::from_array(vec![FirestoreValue::null(), int(1)]),
        );
        assert!(!with_null.matches(&doc(&[("a", int(2))])));
        let plain = filter("a", "not-in", FirestoreValue::from_array(vec![int(1)]));
        assert!(plain.matches(&doc(&[("a", int(2))])));
        assert!(!plain.matches(&doc(&[])));
    }

    #[test]
    fn not_equal_and_not_in_skip_null_fields() {
        let null_field = doc(&[("a", FirestoreValue::null())]);
        assert!(!filter("a", "!=", int(1)).matches(&null_field));
        assert!(!filter("a", "!=", FirestoreValue::from_string("x")).matches(&null_field));
        assert!(!filter("a", "not-in", FirestoreValue::from_array(vec![int(1)])).matches(&null_field));

        // A null operand still excludes nothing but nulls.
        assert!(filter("a", "!=", FirestoreValue::null()).matches(&doc(&[("a", int(1))])));
        assert!(!filter("a", "!=", FirestoreValue::null()).matches(&null_field));
        assert!(filter("a", "==", FirestoreValue::null()).matches(&null_field));
    }

    #[test]
    fn comparisons_require_matching_type_order() {
        let less = filter("a", "<", int(5));
        assert!(less.matches(&doc(&[("a", FirestoreValue::from_double(2.5))])));
        assert!(!less.matches(&doc(&[("a", FirestoreValue::from_string("x"))])));
    }

    #[test]
    fn canonical_ids_distinguish_structure() {
        let a = filter("a", "==", int(1));
        let b = filter("b", ">", int(2));
        assert_eq!(Filter::and(vec![a.clone(), b.clone()]).canonical_id(), "a==1b>2");
        assert_eq!(Filter::or(vec![a, b]).canonical_id(), "or(a==1,b>2)");
    }
}
