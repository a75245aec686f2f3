use std::collections::{HashSet, VecDeque};

pub const DEFAULT_SEEN_CAPACITY: usize = 500;

/// Bounded set of recently processed event ids; the oldest id is evicted first.
#[derive(Debug, Clone)]
pub struct RecentlySeen {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl Default for RecentlySeen {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SEEN_CAPACITY)
    }
}

impl RecentlySeen {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Records `id`; returns false when it was already seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
