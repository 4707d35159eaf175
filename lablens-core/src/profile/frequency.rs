use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyEntry {
    pub value: String,
    pub count: u64,
}

/// Counts occurrences of string values; ties rank by value so output is stable.
#[derive(Debug, Default)]
pub struct FrequencyCounter {
    map: HashMap<String, u64>,
    total: u64,
}

impl FrequencyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, val: &str) {
        self.add_n(val, 1);
    }

    pub fn add_n(&mut self, val: &str, n: u64) {
        match self.map.get_mut(val) {
            Some(c) => *c += n,
            None => {
                self.map.insert(val.to_owned(), n);
            }
        }
        self.total += n;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn distinct(&self) -> usize {
        self.map.len()
    }

    /// every value, most frequent first
    pub fn ranked(self) -> Vec<FrequencyEntry> {
        let mut entries: Vec<FrequencyEntry> =
            self.map.into_iter().map(|(value, count)| FrequencyEntry { value, count }).collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        entries
    }

    pub fn top_n(self, n: usize) -> Vec<FrequencyEntry> {
        let mut ranked = self.ranked();
        ranked.truncate(n);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_by_count_then_value() {
        let mut f = FrequencyCounter::new();
        for v in ["b", "a", "c", "b", "a", "d"] {
            f.add(v);
        }
        f.add_n("d", 2);
        assert_eq!(f.total(), 8);
        assert_eq!(f.distinct(), 4);
        let top: Vec<(String, u64)> = f.top_n(3).into_iter().map(|e| (e.value, e.count)).collect();
        assert_eq!(top, vec![("d".into(), 3), ("a".into(), 2), ("b".into(), 2)]);
    }
}
