//! Proxy transaction history

use parking_lot::RwLock;
use std::collections::VecDeque;

use crate::http::HttpTransaction;

/// Bounded in-memory list of captured transactions, oldest first
pub struct ProxyHistory {
    /// All history entries
    entries: RwLock<VecDeque<HttpTransaction>>,

    /// Maximum number of entries to keep
    max_entries: usize,
}

impl ProxyHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a newly captured transaction
    pub fn add(&self, transaction: HttpTransaction) {
        let mut entries = self.entries.write();
        entries.push_back(transaction);

        // Trim if over limit
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Replace the stored copy of a transaction once it completes.
    /// Returns false if it has already been evicted.
    pub fn update(&self, transaction: &HttpTransaction) -> bool {
        let mut entries = self.entries.write();
        match entries.iter_mut().rev().find(|e| e.id == transaction.id) {
            Some(entry) => {
                *entry = transaction.clone();
                true
            }
            None => false,
        }
    }

    /// Get entry by ID
    pub fn get(&self, id: &str) -> Option<HttpTransaction> {
        self.entries.read().iter().find(|e| e.id == id).cloned()
    }

    /// Get all entries
    pub fn all(&self) -> Vec<HttpTransaction> {
        self.entries.read().iter().cloned().collect()
    }

    /// Search entries by URL
    pub fn search(&self, query: &str) -> Vec<HttpTransaction> {
        let query = query.to_lowercase();
        self.entries
            .read()
            .iter()
            .filter(|e| e.request.url.to_lowercase().contains(&query))
            .cloned()
            .collect()
    }

    /// Clear all history
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ProxyHistory {
    fn default() -> Self {
        Self::new(10000)
    }
}
