// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Which vats currently hold a live worker.
//!
//! Least-recently-used order with a soft capacity: a vat that is busy when
//! it is chosen for eviction stays online until a later pass.

use std::collections::VecDeque;
use vatlog_kernel::types::VatId;

pub struct OnlineSet {
    capacity: usize,
    // front = least recently used
    order: VecDeque<VatId>,
}

impl OnlineSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
        }
    }

    /// Mark `vat` most recently used.
    pub fn touch(&mut self, vat: &VatId) {
        if let Some(idx) = self.order.iter().position(|v| v == vat) {
            self.order.remove(idx);
        }
        self.order.push_back(vat.clone());
    }

    /// Vats to evict to get back under capacity, least recent first.
    /// Never includes `keep`.
    pub fn overflow(&self, keep: &VatId) -> Vec<VatId> {
        let excess = self.order.len().saturating_sub(self.capacity);
        self.order.iter().filter(|v| *v != keep).take(excess).cloned().collect()
    }

    pub fn remove(&mut self, vat: &VatId) {
        self.order.retain(|v| v != vat);
    }

    pub fn contains(&self, vat: &VatId) -> bool {
        self.order.contains(vat)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
