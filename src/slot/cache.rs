// src/slot/cache.rs

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 正则命中缓存的 key：(pub, profile, displayVersion, partner, 原始 slot)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegexCacheKey {
    pub pub_id: i32,
    pub profile_id: i32,
    pub display_version: i32,
    pub partner_id: i32,
    pub slot: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexSlotEntry {
    pub slot_name: String,
    pub matched_pattern: String,
}

/// 进程级正则命中缓存。只增不删，写入一次后不再修改
#[derive(Debug, Default)]
pub struct RegexSlotCache {
    entries: DashMap<RegexCacheKey, RegexSlotEntry>,
    compilations: AtomicUsize,
}

impl RegexSlotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RegexCacheKey) -> Option<RegexSlotEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// 已存在的条目不会被覆盖
    pub fn insert(&self, key: RegexCacheKey, entry: RegexSlotEntry) {
        self.entries.entry(key).or_insert(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn record_compilation(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    /// 累计编译的正则数量
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(slot: &str) -> RegexCacheKey {
        RegexCacheKey { pub_id: 1, profile_id: 2, display_version: 3, partner_id: 4, slot: slot.to_string() }
    }

    #[test]
    fn entries_are_write_once() {
        let cache = RegexSlotCache::new();
        cache.insert(key("a"), RegexSlotEntry { slot_name: "a".into(), matched_pattern: "first".into() });
        cache.insert(key("a"), RegexSlotEntry { slot_name: "a".into(), matched_pattern: "second".into() });
        assert_eq!(cache.get(&key("a")).unwrap().matched_pattern, "first");
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("b")).is_none());
    }
}
