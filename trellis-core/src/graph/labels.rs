use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(labels: &[&str]) -> Self {
        labels.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        self.0.insert(label.into())
    }

    pub fn remove(&mut self, label: &str) -> bool {
        self.0.remove(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_subset_of(&self, other: &LabelSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_disjoint(&self, other: &LabelSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    pub fn union(&self, other: &LabelSet) -> LabelSet {
        LabelSet(self.0.union(&other.0).cloned().collect())
    }

    pub fn intersection(&self, other: &LabelSet) -> LabelSet {
        LabelSet(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn difference(&self, other: &LabelSet) -> LabelSet {
        LabelSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn extend(&mut self, other: &LabelSet) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn first(&self) -> Option<&str> {
        self.0.iter().next().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        LabelSet(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().cloned().collect::<Vec<_>>().join(":");
        write!(f, "{joined}")
    }
}
