use super::query::IndexValue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

impl Direction {
    /// `1` ascending, `-1` descending, as query strings spell it.
    pub fn from_sign(sign: i32) -> Self {
        if sign < 0 {
            Self::Descending
        } else {
            Self::Ascending
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

/// Pagination and ordering of a streamed query.
///
/// Built per call; every builder method consumes and returns the value, so a
/// shared base set of options is never mutated by a later caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingFindOptions {
    paging: Option<String>,
    since: Option<IndexValue>,
    sort: Vec<(String, Direction)>,
    direction: Direction,
    limit: Option<usize>,
}

impl StreamingFindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field used for `since`-style continuation.
    pub fn paging(mut self, field: &str) -> Self {
        self.paging = Some(field.to_owned());
        self
    }

    /// Continue after this value of the paging field.
    pub fn since(mut self, value: impl Into<IndexValue>) -> Self {
        self.since = Some(value.into());
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Zero means unbounded.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    /// Append a sort key.
    pub fn sort(mut self, field: &str, direction: Direction) -> Self {
        self.sort.push((field.to_owned(), direction));
        self
    }

    /// A copy of these options with `field` as the leading sort key.
    pub fn with_sort(&self, field: &str, direction: Direction) -> Self {
        let mut copy = self.clone();
        copy.sort.insert(0, (field.to_owned(), direction));
        copy
    }

    pub fn paging_field(&self) -> Option<&str> {
        self.paging.as_deref()
    }

    pub fn since_value(&self) -> Option<&IndexValue> {
        self.since.as_ref()
    }

    pub fn get_direction(&self) -> Direction {
        self.direction
    }

    pub fn get_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Explicit sort keys, or the paging field in `direction` when none
    /// were given.
    pub fn effective_sort(&self) -> Vec<(String, Direction)> {
        if !self.sort.is_empty() {
            return self.sort.clone();
        }
        self.paging
            .iter()
            .map(|field| (field.clone(), self.direction))
            .collect()
    }
}
