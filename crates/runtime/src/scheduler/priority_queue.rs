//! Priority queue used for task admission

use std::collections::{BinaryHeap, HashSet};

use crate::types::TaskId;

/// Max-heap keyed by task id, so pending entries can be cancelled.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: BinaryHeap<T>,
    ids: HashSet<TaskId>,
}

impl<T> PriorityQueue<T>
where
    T: Ord + HasTaskId,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            ids: HashSet::new(),
        }
    }

    /// Add an item to the queue
    pub fn push(&mut self, item: T) {
        self.ids.insert(item.task_id());
        self.heap.push(item);
    }

    /// Remove and return the highest priority item
    pub fn pop(&mut self) -> Option<T> {
        let item = self.heap.pop()?;
        self.ids.remove(&item.task_id());
        Some(item)
    }

    /// Remove a specific item by task ID
    pub fn remove(&mut self, task_id: &TaskId) -> Option<T> {
        if !self.ids.remove(task_id) {
            return None;
        }

        let mut removed = None;
        let remaining: Vec<T> = self
            .heap
            .drain()
            .filter_map(|item| {
                if removed.is_none() && &item.task_id() == task_id {
                    removed = Some(item);
                    None
                } else {
                    Some(item)
                }
            })
            .collect();
        self.heap = remaining.into_iter().collect();

        removed
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.ids.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for PriorityQueue<T>
where
    T: Ord + HasTaskId,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for items that carry a task ID
pub trait HasTaskId {
    fn task_id(&self) -> TaskId;
}
