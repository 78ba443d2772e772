/// The outcome of a latest-version resolution.
///
/// A contradiction is an ordinary answer: it means the view sees several
/// equally recent versions and nothing in the view ranks one above the others.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Latest<V> {
    Absent,
    Single(V),
    /// Two or more tied versions, sorted by stamp nid.
    Contradiction(Vec<V>),
}

impl<V> Latest<V> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Latest::Absent)
    }

    pub fn is_present(&self) -> bool {
        !self.is_absent()
    }

    pub fn is_contradiction(&self) -> bool {
        matches!(self, Latest::Contradiction(_))
    }

    pub fn single(&self) -> Option<&V> {
        match self {
            Latest::Single(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_single(self) -> Option<V> {
        match self {
            Latest::Single(value) => Some(value),
            _ => None,
        }
    }

    /// Every version in the result: none, one, or the tied set.
    pub fn versions(&self) -> &[V] {
        match self {
            Latest::Absent => &[],
            Latest::Single(value) => std::slice::from_ref(value),
            Latest::Contradiction(values) => values,
        }
    }

    pub fn map<U, F>(self, mut f: F) -> Latest<U>
    where
        F: FnMut(V) -> U,
    {
        match self {
            Latest::Absent => Latest::Absent,
            Latest::Single(value) => Latest::Single(f(value)),
            Latest::Contradiction(values) => {
                Latest::Contradiction(values.into_iter().map(f).collect())
            }
        }
    }
}

impl<V> Default for Latest<V> {
    fn default() -> Self {
        Latest::Absent
    }
}

impl<V> From<Vec<V>> for Latest<V> {
    /// Empty is absent, one element is single, more is a contradiction.
    fn from(mut values: Vec<V>) -> Self {
        match values.len() {
            0 => Latest::Absent,
            1 => values.pop().map_or(Latest::Absent, Latest::Single),
            _ => Latest::Contradiction(values),
        }
    }
}
