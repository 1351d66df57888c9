//! Provider frequency accounting.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::metrics::TOP_PROVIDER;

/// Concurrent provider -> hit-count map. `add` is called for every new
/// provider result emitted in a find response; a periodic task exports
/// the top entries as a gauge.
pub struct ProviderCounter {
    cardinality: usize,
    providers: DashMap<String, AtomicI64>,
}

impl ProviderCounter {
    pub fn new(cardinality: usize) -> Self {
        Self {
            cardinality,
            providers: DashMap::new(),
        }
    }

    pub fn add(&self, provider: &str) {
        if provider.is_empty() {
            return;
        }
        match self.providers.get(provider) {
            Some(count) => {
                count.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.providers
                    .entry(provider.to_string())
                    .or_insert_with(|| AtomicI64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The top-N `(provider, count)` pairs, highest first.
    pub fn top(&self) -> Vec<(String, i64)> {
        let mut pairs: Vec<(String, i64)> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1));
        pairs.truncate(self.cardinality);
        pairs
    }

    /// Export the current top entries to the top-provider gauge.
    pub fn report(&self) {
        for (provider, count) in self.top() {
            TOP_PROVIDER.with_label_values(&[&provider]).set(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counts_and_ranks_providers() {
        let counter = ProviderCounter::new(2);
        for _ in 0..3 {
            counter.add("alpha");
        }
        counter.add("beta");
        counter.add("beta");
        counter.add("gamma");

        let top = counter.top();
        assert_eq!(top, vec![("alpha".to_string(), 3), ("beta".to_string(), 2)]);
    }

    #[test]
    fn empty_ids_are_ignored() {
        let counter = ProviderCounter::new(10);
        counter.add("");
        assert!(counter.top().is_empty());
    }

    #[test]
    fn concurrent_adds_do_not_lose_counts() {
        let counter = Arc::new(ProviderCounter::new(10));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.add("busy");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.top(), vec![("busy".to_string(), 8000)]);
    }
}
