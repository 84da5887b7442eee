use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// Win/pnl aggregates for the query's hour of day and day of week.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeProfile {
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub hour_samples: usize,
    pub hour_win_rate: f64,
    pub hour_avg_pnl: f64,
    pub day_samples: usize,
    pub day_win_rate: f64,
}

impl TimeProfile {
    pub fn neutral(hour_of_day: u32, day_of_week: u32) -> Self {
        Self {
            hour_of_day,
            day_of_week,
            hour_samples: 0,
            hour_win_rate: 0.5,
            hour_avg_pnl: 0.0,
            day_samples: 0,
            day_win_rate: 0.5,
        }
    }
}

type Key = (String, u32);

#[derive(Debug, Clone)]
struct Entry {
    epoch_hour: i64,
    profile: TimeProfile,
}

/// Bounded `(instrument, hour-of-day)` cache. The oldest inserted key is
/// evicted first; an entry only answers queries from the epoch hour it was
/// computed in.
#[derive(Debug)]
pub struct TimeProfileCache {
    capacity: usize,
    entries: HashMap<Key, Entry>,
    order: VecDeque<Key>,
    hits: u64,
    misses: u64,
}

impl TimeProfileCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: HashMap::new(), order: VecDeque::new(), hits: 0, misses: 0 }
    }

    pub fn get(&mut self, instrument: &str, hour_of_day: u32, epoch_hour: i64) -> Option<TimeProfile> {
        let key = (instrument.to_string(), hour_of_day);
        match self.entries.get(&key) {
            Some(e) if e.epoch_hour == epoch_hour => {
                self.hits += 1;
                Some(e.profile.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, instrument: &str, epoch_hour: i64, profile: TimeProfile) {
        let key = (instrument.to_string(), profile.hour_of_day);
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, Entry { epoch_hour, profile });
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_reused_only_within_epoch_hour() {
        let mut cache = TimeProfileCache::new(4);
        cache.insert("MGC", 100, TimeProfile::neutral(9, 1));
        assert!(cache.get("MGC", 9, 100).is_some());
        assert!(cache.get("MGC", 9, 101).is_none());
        assert!(cache.get("ES", 9, 100).is_none());
        assert_eq!((cache.hits(), cache.misses()), (1, 2));
    }

    #[test]
    fn test_oldest_inserted_evicted() {
        let mut cache = TimeProfileCache::new(2);
        cache.insert("A", 1, TimeProfile::neutral(1, 0));
        cache.insert("B", 1, TimeProfile::neutral(1, 0));
        // Re-inserting A makes B the oldest.
        cache.insert("A", 2, TimeProfile::neutral(1, 0));
        cache.insert("C", 1, TimeProfile::neutral(1, 0));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("B", 1, 1).is_none());
        assert!(cache.get("A", 1, 2).is_some());
        assert!(cache.get("C", 1, 1).is_some());
    }
}
