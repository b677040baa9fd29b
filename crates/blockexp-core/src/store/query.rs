use std::cmp::Ordering;
use std::mem::discriminant;

use bitcoin::{BlockHash, Txid};
use time::OffsetDateTime;

use crate::types::{BlockHeight, WalletId};

/// A scalar as seen by indexes, filters and sorts.
///
/// Values of different kinds never compare as ordered by a filter: a range
/// condition on an integer field does not match a missing (`Null`) field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl IndexValue {
    fn same_kind(&self, other: &Self) -> bool {
        discriminant(self) == discriminant(other)
    }
}

impl From<bool> for IndexValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for IndexValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for IndexValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for IndexValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for IndexValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for IndexValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&String> for IndexValue {
    fn from(v: &String) -> Self {
        Self::Str(v.clone())
    }
}

impl From<BlockHash> for IndexValue {
    fn from(v: BlockHash) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Txid> for IndexValue {
    fn from(v: Txid) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<BlockHeight> for IndexValue {
    fn from(v: BlockHeight) -> Self {
        Self::Int(v.as_i64())
    }
}

impl From<WalletId> for IndexValue {
    fn from(v: WalletId) -> Self {
        Self::from(v.0)
    }
}

/// Datetimes index as unix nanoseconds so sub-second order is kept.
impl From<OffsetDateTime> for IndexValue {
    fn from(v: OffsetDateTime) -> Self {
        Self::Int(i64::try_from(v.unix_timestamp_nanos()).unwrap_or(i64::MAX))
    }
}

impl<T: Into<IndexValue>> From<Option<T>> for IndexValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(IndexValue),
    Ne(IndexValue),
    Gt(IndexValue),
    Gte(IndexValue),
    Lt(IndexValue),
    Lte(IndexValue),
    In(Vec<IndexValue>),
}

impl Condition {
    /// Array fields match when any element matches, except `Ne`, which
    /// requires that no element equals the operand.
    fn matches(&self, values: &[IndexValue]) -> bool {
        let null = [IndexValue::Null];
        let values = if values.is_empty() { &null[..] } else { values };
        match self {
            Self::Eq(v) => values.contains(v),
            Self::Ne(v) => !values.contains(v),
            Self::In(list) => values.iter().any(|value| list.contains(value)),
            Self::Gt(v) => ordered(values, v, |o| o == Ordering::Greater),
            Self::Gte(v) => ordered(values, v, |o| o != Ordering::Less),
            Self::Lt(v) => ordered(values, v, |o| o == Ordering::Less),
            Self::Lte(v) => ordered(values, v, |o| o != Ordering::Greater),
        }
    }

    /// Whether `value` could satisfy this condition; used for index scans.
    pub(super) fn admits(&self, value: &IndexValue) -> bool {
        self.matches(std::slice::from_ref(value))
    }

    /// Equality operands, when an index lookup can enumerate them.
    pub(super) fn point_values(&self) -> Option<Vec<IndexValue>> {
        match self {
            Self::Eq(v) => Some(vec![v.clone()]),
            Self::In(list) => Some(list.clone()),
            _ => None,
        }
    }

    /// Whether an ordered index scan can serve this condition.
    pub(super) fn is_range(&self) -> bool {
        matches!(self, Self::Gt(_) | Self::Gte(_) | Self::Lt(_) | Self::Lte(_))
    }
}

fn ordered(values: &[IndexValue], operand: &IndexValue, pred: impl Fn(Ordering) -> bool) -> bool {
    values
        .iter()
        .any(|value| value.same_kind(operand) && pred(value.cmp(operand)))
}

/// A conjunction of per-field conditions.
///
/// Field names are the camelCase names of the serialized documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, condition: Condition) -> Self {
        self.clauses.push((field.to_owned(), condition));
        self
    }

    pub fn eq(self, field: &str, value: impl Into<IndexValue>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn ne(self, field: &str, value: impl Into<IndexValue>) -> Self {
        self.with(field, Condition::Ne(value.into()))
    }

    pub fn gt(self, field: &str, value: impl Into<IndexValue>) -> Self {
        self.with(field, Condition::Gt(value.into()))
    }

    pub fn gte(self, field: &str, value: impl Into<IndexValue>) -> Self {
        self.with(field, Condition::Gte(value.into()))
    }

    pub fn lt(self, field: &str, value: impl Into<IndexValue>) -> Self {
        self.with(field, Condition::Lt(value.into()))
    }

    pub fn lte(self, field: &str, value: impl Into<IndexValue>) -> Self {
        self.with(field, Condition::Lte(value.into()))
    }

    pub fn any_of<T: Into<IndexValue>>(self, field: &str, values: impl IntoIterator<Item = T>) -> Self {
        self.with(
            field,
            Condition::In(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn clauses(&self) -> &[(String, Condition)] {
        &self.clauses
    }

    /// Evaluate against a field accessor.
    pub fn matches_with(&self, field: impl Fn(&str) -> Vec<IndexValue>) -> bool {
        self.clauses
            .iter()
            .all(|(name, condition)| condition.matches(&field(name)))
    }
}
