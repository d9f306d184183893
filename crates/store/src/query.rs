use std::cmp::Ordering;

use serde_json::Value;

use crate::document::Document;

/// A filter expression over documents.
///
/// Drivers evaluate (or translate) filters; comparisons against an array
/// field match when any element matches, so set-membership tests like
/// "recipients contains me" are plain `Eq` filters.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Field equals value (or the array field contains it).
    Eq(String, Value),
    /// Negation of `Eq`.
    Ne(String, Value),
    /// Field value (or any array element) is one of the given values.
    In(String, Vec<Value>),
    /// Negation of `In`.
    Nin(String, Vec<Value>),
    /// Field is strictly less than value.
    Lt(String, Value),
    /// Field is less than or equal to value.
    Lte(String, Value),
    /// Field is strictly greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Gte(String, Value),
    /// Field is present and non-null (or absent/null when `false`).
    Exists(String, bool),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Shorthand for an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// Whether `document` satisfies this filter.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::Eq(field, value) => field_matches(document.get(field), value),
            Self::Ne(field, value) => !field_matches(document.get(field), value),
            Self::In(field, values) => values
                .iter()
                .any(|value| field_matches(document.get(field), value)),
            Self::Nin(field, values) => !values
                .iter()
                .any(|value| field_matches(document.get(field), value)),
            Self::Lt(field, value) => compare(document.get(field), value)
                .is_some_and(|ordering| ordering == Ordering::Less),
            Self::Lte(field, value) => compare(document.get(field), value)
                .is_some_and(|ordering| ordering != Ordering::Greater),
            Self::Gt(field, value) => compare(document.get(field), value)
                .is_some_and(|ordering| ordering == Ordering::Greater),
            Self::Gte(field, value) => compare(document.get(field), value)
                .is_some_and(|ordering| ordering != Ordering::Less),
            Self::Exists(field, expected) => {
                let present = document.get(field).is_some_and(|value| !value.is_null());
                present == *expected
            }
            Self::And(filters) => filters.iter().all(|filter| filter.matches(document)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(document)),
        }
    }
}

fn field_matches(field: Option<&Value>, value: &Value) -> bool {
    match field {
        Some(Value::Array(elements)) if !value.is_array() => elements.contains(value),
        Some(field) => field == value,
        None => value.is_null(),
    }
}

fn compare(field: Option<&Value>, value: &Value) -> Option<Ordering> {
    compare_values(field?, value)
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A single mutation applied to a document.
#[derive(Clone, Debug, PartialEq)]
enum UpdateOp {
    Set(String, Value),
    Unset(String),
    AddToSet(String, Value),
}

/// An ordered list of mutations applied atomically by the driver.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `field` to `value`.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(field.into(), value.into()));
        self
    }

    /// Removes `field`.
    #[must_use]
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Unset(field.into()));
        self
    }

    /// Appends `value` to the array at `field` unless already present.
    ///
    /// A missing field becomes a one-element array. Duplicate adds are
    /// no-ops, so the operation is idempotent under races.
    #[must_use]
    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::AddToSet(field.into(), value.into()));
        self
    }

    /// Applies the mutations in order. Returns whether anything changed.
    pub fn apply(&self, document: &mut Document) -> bool {
        let mut changed = false;
        for op in &self.ops {
            match op {
                UpdateOp::Set(field, value) => {
                    if document.get(field) != Some(value) {
                        document.insert(field.clone(), value.clone());
                        changed = true;
                    }
                }
                UpdateOp::Unset(field) => {
                    changed |= document.remove(field).is_some();
                }
                UpdateOp::AddToSet(field, value) => match document.get(field) {
                    Some(Value::Array(elements)) if elements.contains(value) => {}
                    Some(Value::Array(elements)) => {
                        let mut elements = elements.clone();
                        elements.push(value.clone());
                        document.insert(field.clone(), Value::Array(elements));
                        changed = true;
                    }
                    _ => {
                        document.insert(field.clone(), Value::Array(vec![value.clone()]));
                        changed = true;
                    }
                },
            }
        }
        changed
    }

    /// Whether the update contains no mutations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Order {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// An ordered list of sort keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sort {
    keys: Vec<(String, Order)>,
}

impl Sort {
    /// Creates an empty (stable insertion-order) sort.
    #[must_use]
    pub fn unsorted() -> Self {
        Self::default()
    }

    /// Creates a sort on a single key.
    #[must_use]
    pub fn by(field: impl Into<String>, order: Order) -> Self {
        Self {
            keys: vec![(field.into(), order)],
        }
    }

    /// Adds a tie-breaking sort key.
    #[must_use]
    pub fn then(mut self, field: impl Into<String>, order: Order) -> Self {
        self.keys.push((field.into(), order));
        self
    }

    /// Compares two documents under this sort. Incomparable values rank
    /// equal so the surrounding stable sort keeps insertion order.
    #[must_use]
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, order) in &self.keys {
            let ordering = match (a.get(field), b.get(field)) {
                (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ordering = match order {
                Order::Asc => ordering,
                Order::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}
