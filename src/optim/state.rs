//! # Optimizer State
//!
//! Per-parameter bookkeeping keyed by storage identity. The record type `S`
//! belongs to the concrete algorithm (momentum buffer, moment estimates, ...);
//! this map only manages where records live and how they are found.

use std::collections::hash_map::{Entry, HashMap};

use crate::tensor::TensorId;

/// Identity-keyed map from parameter to algorithm state.
///
/// Entries are never reclaimed when a parameter goes away; they are simply
/// orphaned until the optimizer itself is dropped.
#[derive(Debug, Clone)]
pub struct OptimizerState<S> {
    entries: HashMap<TensorId, S>,
}

impl<S> Default for OptimizerState<S> {
    fn default() -> Self {
        OptimizerState {
            entries: HashMap::new(),
        }
    }
}

impl<S> OptimizerState<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TensorId) -> Option<&S> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: TensorId) -> Option<&mut S> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Inserts or replaces the record for `id`, returning the old one.
    pub fn insert(&mut self, id: TensorId, state: S) -> Option<S> {
        self.entries.insert(id, state)
    }

    pub fn remove(&mut self, id: TensorId) -> Option<S> {
        self.entries.remove(&id)
    }

    /// Returns the record for `id`, creating it with `init` on first use.
    pub fn get_or_insert_with<F>(&mut self, id: TensorId, init: F) -> &mut S
    where
        F: FnOnce() -> S,
    {
        self.entries.entry(id).or_insert_with(init)
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with) for initializers
    /// that can fail. Nothing is inserted on error.
    pub fn try_get_or_insert_with<F, E>(&mut self, id: TensorId, init: F) -> Result<&mut S, E>
    where
        F: FnOnce() -> Result<S, E>,
    {
        match self.entries.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(init()?)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TensorId, &S)> + '_ {
        self.entries.iter().map(|(id, state)| (*id, state))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
