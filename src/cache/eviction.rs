//! Eviction Strategy Module
//!
//! Chooses which keys leave the cache when it grows past capacity.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;

// == Eviction Strategy ==
/// Ranking policy applied when the store exceeds `max_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently used: ascending `last_accessed`
    #[default]
    Lru,
    /// Least frequently used: ascending `(access_count, last_accessed)`
    Lfu,
    /// First in, first out: ascending `created_at`
    Fifo,
}

impl EvictionStrategy {
    // == Select Eviction Candidates ==
    /// Returns the lowest-ranked keys that must go for `entries` to fit in
    /// `max_size`. Returns an empty list when no eviction is needed.
    ///
    /// `protected` names a key that must survive, normally the key that was
    /// just written. It is skipped during ranking so a fresh entry is never
    /// evicted by the call that stored it.
    pub fn select_eviction_candidates<V>(
        &self,
        entries: &HashMap<String, CacheEntry<V>>,
        max_size: usize,
        protected: Option<&str>,
    ) -> Vec<String> {
        if entries.len() <= max_size {
            return Vec::new();
        }
        let evict_count = entries.len() - max_size;

        let mut ranked: Vec<(&String, (u64, u64, u64))> = entries
            .iter()
            .filter(|(key, _)| Some(key.as_str()) != protected)
            .map(|(key, entry)| (key, self.rank(entry)))
            .collect();
        ranked.sort_unstable_by_key(|(_, rank)| *rank);

        ranked
            .into_iter()
            .take(evict_count)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn rank<V>(&self, entry: &CacheEntry<V>) -> (u64, u64, u64) {
        match self {
            Self::Lru => (entry.last_accessed, entry.accessed_seq, 0),
            Self::Lfu => (entry.access_count, entry.last_accessed, entry.accessed_seq),
            Self::Fifo => (entry.created_at, entry.created_seq, 0),
        }
    }

    /// Lowercase name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
        }
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "fifo" => Ok(Self::Fifo),
            other => Err(format!("unknown eviction strategy '{other}'")),
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn entry(created_at: u64, last_accessed: u64, access_count: u64, seq: u64) -> CacheEntry<()> {
        let mut entry = CacheEntry::new((), None, created_at).with_sequence(seq);
        entry.last_accessed = last_accessed;
        entry.access_count = access_count;
        entry
    }

    fn table(rows: &[(&str, CacheEntry<()>)]) -> HashMap<String, CacheEntry<()>> {
        rows.iter()
            .map(|(key, entry)| (key.to_string(), entry.clone()))
            .collect()
    }

    #[test]
    fn test_no_eviction_within_capacity() {
        let entries = table(&[("a", entry(1, 1, 1, 1)), ("b", entry(2, 2, 1, 2))]);
        assert!(EvictionStrategy::Lru
            .select_eviction_candidates(&entries, 2, None)
            .is_empty());
    }

    #[test]
    fn test_lru_picks_oldest_access() {
        let entries = table(&[
            ("a", entry(1, 50, 1, 1)),
            ("b", entry(2, 20, 1, 2)),
            ("c", entry(3, 30, 1, 3)),
        ]);
        let evicted = EvictionStrategy::Lru.select_eviction_candidates(&entries, 1, None);
        assert_eq!(evicted, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_lfu_breaks_ties_by_recency() {
        let entries = table(&[
            ("a", entry(1, 10, 4, 1)),
            ("b", entry(2, 20, 1, 2)),
            ("c", entry(3, 5, 1, 3)),
        ]);
        let evicted = EvictionStrategy::Lfu.select_eviction_candidates(&entries, 2, None);
        assert_eq!(evicted, vec!["c".to_string()]);
    }

    #[test]
    fn test_fifo_ignores_access_pattern() {
        let entries = table(&[
            ("first", entry(1, 100, 9, 1)),
            ("second", entry(2, 2, 1, 2)),
        ]);
        let evicted = EvictionStrategy::Fifo.select_eviction_candidates(&entries, 1, None);
        assert_eq!(evicted, vec!["first".to_string()]);
    }

    #[test]
    fn test_sequence_breaks_same_millisecond_ties() {
        let entries = table(&[
            ("late", entry(7, 7, 1, 9)),
            ("early", entry(7, 7, 1, 3)),
        ]);
        for strategy in [EvictionStrategy::Lru, EvictionStrategy::Lfu, EvictionStrategy::Fifo] {
            let evicted = strategy.select_eviction_candidates(&entries, 1, None);
            assert_eq!(evicted, vec!["early".to_string()], "{strategy}");
        }
    }

    #[test]
    fn test_protected_key_survives() {
        let entries = table(&[
            ("hot", entry(1, 1, 10, 1)),
            ("new", entry(2, 2, 1, 2)),
        ]);
        let evicted =
            EvictionStrategy::Lfu.select_eviction_candidates(&entries, 1, Some("new"));
        assert_eq!(evicted, vec!["hot".to_string()]);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("LRU".parse::<EvictionStrategy>(), Ok(EvictionStrategy::Lru));
        assert_eq!(" lfu ".parse::<EvictionStrategy>(), Ok(EvictionStrategy::Lfu));
        assert_eq!("fifo".parse::<EvictionStrategy>(), Ok(EvictionStrategy::Fifo));
        assert!("random".parse::<EvictionStrategy>().is_err());
    }
}
