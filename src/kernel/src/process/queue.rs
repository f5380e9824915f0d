//! Ordered context queue used by schedulers

use std::collections::VecDeque;

use crate::error::{KernelError, Result};
use crate::process::ContextId;

#[derive(Debug, Default, Clone)]
pub struct ContextQueue {
    entries: VecDeque<ContextId>,
}

impl ContextQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_front(&mut self, id: ContextId) {
        self.entries.push_front(id);
    }

    pub fn append(&mut self, id: ContextId) {
        self.entries.push_back(id);
    }

    pub fn remove(&mut self, id: ContextId) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|c| *c == id)
            .ok_or(KernelError::DoesNotExist)?;
        self.entries.remove(pos);
        Ok(())
    }

    pub fn head(&self) -> Option<ContextId> {
        self.entries.front().copied()
    }

    /// Move the head to the back
    pub fn rotate(&mut self) {
        if let Some(id) = self.entries.pop_front() {
            self.entries.push_back(id);
        }
    }

    pub fn find<P>(&self, mut pred: P) -> Option<ContextId>
    where
        P: FnMut(ContextId) -> bool,
    {
        self.entries.iter().copied().find(|c| pred(*c))
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.entries.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
