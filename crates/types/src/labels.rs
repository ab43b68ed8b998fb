//! Master label set: the fixed, ordered classes an aggregator predicts over.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ClassId, Result, TypesError};

/// Ordered sequence of unique class labels.
///
/// Column `i` of every probability matrix produced against this set holds the
/// probability of `labels[i]`. The set is immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ClassId>", into = "Vec<ClassId>")]
pub struct LabelSet {
    labels: Vec<ClassId>,
    index: HashMap<ClassId, usize>,
}

impl LabelSet {
    /// Build a label set preserving the given order.
    ///
    /// # Errors
    /// Returns [`TypesError::DuplicateLabel`] if a label repeats.
    pub fn new(labels: Vec<ClassId>) -> Result<Self> {
        let mut index = HashMap::with_capacity(labels.len());
        for (i, &label) in labels.iter().enumerate() {
            if index.insert(label, i).is_some() {
                return Err(TypesError::DuplicateLabel(label));
            }
        }
        Ok(Self { labels, index })
    }

    /// Sorted unique labels observed in a target vector.
    pub fn from_targets(targets: &[ClassId]) -> Self {
        let mut labels = targets.to_vec();
        labels.sort_unstable();
        labels.dedup();
        let index = labels.iter().enumerate().map(|(i, &l)| (l, i)).collect();
        Self { labels, index }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Label at column `i`.
    pub fn get(&self, i: usize) -> Option<ClassId> {
        self.labels.get(i).copied()
    }

    /// Column position of `label`.
    #[inline]
    pub fn index_of(&self, label: ClassId) -> Option<usize> {
        self.index.get(&label).copied()
    }

    pub fn contains(&self, label: ClassId) -> bool {
        self.index.contains_key(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.labels.iter().copied()
    }

    pub fn as_slice(&self) -> &[ClassId] {
        &self.labels
    }

    /// Labels of `subset` that are not part of this set, in `subset` order.
    pub fn missing_from(&self, subset: &[ClassId]) -> Vec<ClassId> {
        subset
            .iter()
            .copied()
            .filter(|l| !self.contains(*l))
            .collect()
    }
}

impl TryFrom<Vec<ClassId>> for LabelSet {
    type Error = TypesError;

    fn try_from(labels: Vec<ClassId>) -> Result<Self> {
        Self::new(labels)
    }
}

impl From<LabelSet> for Vec<ClassId> {
    fn from(set: LabelSet) -> Self {
        set.labels
    }
}
