//! 带有效期的 LRU 缓存
//!
//! 目录查询与安装统计共用。条目超过有效期后视为未命中并被移除。

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

/// 缓存统计信息
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// 命中次数
    pub hits: u64,
    /// 未命中次数（含过期）
    pub misses: u64,
    /// 当前条目数量
    pub size: usize,
    /// 容量
    pub capacity: usize,
    /// 命中率（百分比）
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// 带有效期的 LRU 缓存
pub struct TtlCache<K: Hash + Eq, V: Clone> {
    cache: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    /// 创建缓存，容量至少为 1
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let size = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(size)),
            ttl,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, Entry<V>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 获取未过期的条目
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.lock();
        let expired = match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// 写入条目
    pub fn put(&self, key: K, value: V) {
        self.lock().put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// 失效指定条目
    pub fn invalidate(&self, key: &K) {
        self.lock().pop(key);
    }

    /// 失效满足条件的所有条目
    pub fn invalidate_where<F>(&self, predicate: F)
    where
        F: Fn(&K) -> bool,
        K: Clone,
    {
        let mut cache = self.lock();
        let keys: Vec<K> = cache
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }

    /// 清空缓存
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 获取统计信息
    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            size,
            capacity: self.capacity,
            hit_rate: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache: TtlCache<String, u32> = TtlCache::new(4, Duration::from_secs(60));
        cache.put("a".to_string(), 1);

        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_expiry() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(4, Duration::from_millis(0));
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.put(1, 1);
        cache.put(2, 2);
        cache.get(&1);
        cache.put(3, 3);

        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn test_invalidate_where() {
        let cache: TtlCache<String, u32> = TtlCache::new(8, Duration::from_secs(60));
        cache.put("auth:1".to_string(), 1);
        cache.put("auth:2".to_string(), 2);
        cache.put("db:1".to_string(), 3);

        cache.invalidate_where(|k| k.starts_with("auth:"));

        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
