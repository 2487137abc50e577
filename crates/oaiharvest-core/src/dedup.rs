use std::collections::BTreeSet;

/// Deduplication key: ordered by identifier, then by metadata prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdPrefix {
    pub identifier: String,
    pub prefix: String,
}

impl IdPrefix {
    pub fn new(identifier: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            prefix: prefix.into(),
        }
    }
}

/// Records already seen during one provider's run of one action sequence.
#[derive(Debug, Clone, Default)]
pub struct DedupStore {
    seen: BTreeSet<IdPrefix>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the pair is already present.
    pub fn insert_if_absent(&mut self, key: IdPrefix) -> bool {
        self.seen.insert(key)
    }

    pub fn contains(&self, key: &IdPrefix) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Entries in (identifier, prefix) order.
    pub fn iter(&self) -> impl Iterator<Item = &IdPrefix> {
        self.seen.iter()
    }
}
