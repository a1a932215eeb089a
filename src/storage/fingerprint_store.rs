use crate::error::StorageError;
use crate::fingerprint::Fingerprint;
use anyhow::Context;
use bloomfilter::Bloom;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug)]
pub struct FingerprintStoreConfig {
    pub path: PathBuf,
    pub shard_count: usize,
    pub expected_items: usize,
    pub false_positive_rate: f64,
    pub hot_entries_per_shard: usize,
    pub cache_capacity_bytes: u64,
    pub flush_every_ms: Option<u64>,
}

impl Default for FingerprintStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./.veristate/fingerprints"),
            shard_count: 64,
            expected_items: 10_000_000,
            false_positive_rate: 0.01,
            hot_entries_per_shard: 100_000,
            cache_capacity_bytes: 256 * 1024 * 1024,
            flush_every_ms: Some(10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FingerprintStats {
    pub checks: u64,
    pub duplicates: u64,
    pub inserts: u64,
    pub disk_lookups: u64,
    pub shard_count: usize,
}

#[derive(Default)]
struct FingerprintStatsAtomic {
    checks: AtomicU64,
    duplicates: AtomicU64,
    inserts: AtomicU64,
    disk_lookups: AtomicU64,
}

/// One lockable slice of the fingerprint space.
///
/// `hot` is an exact cache of recently-touched fingerprints; the Bloom
/// filter guards the sled tree so cold misses usually skip the disk lookup.
/// Exactness lives in the tree alone, so clearing the hot cache on overflow
/// never affects membership answers.
struct Shard {
    hot: Mutex<HashSet<u64>>,
    bloom: Mutex<Bloom<u64>>,
    tree: sled::Tree,
}

/// Concurrent, memory-bounded set of fingerprints already seen: the single
/// source of truth for "is this state new".
///
/// `insert_if_absent` is linearizable per fingerprint: exactly one caller
/// observes "absent" for any given fingerprint, no matter how many race.
/// The linearization point is the sled insert, which is atomic per key.
pub struct FingerprintStore {
    db: sled::Db,
    shards: Vec<Shard>,
    shard_mask: usize,
    hot_entries_per_shard: usize,
    stats: FingerprintStatsAtomic,
}

impl FingerprintStore {
    pub fn open(config: FingerprintStoreConfig) -> Result<Self, StorageError> {
        let shard_count = config.shard_count.max(1).next_power_of_two();
        std::fs::create_dir_all(&config.path)
            .with_context(|| format!("failed to create {}", config.path.display()))
            .map_err(StorageError::Fingerprints)?;

        let mut db_config = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity_bytes)
            .mode(sled::Mode::HighThroughput);
        if let Some(ms) = config.flush_every_ms {
            db_config = db_config.flush_every_ms(Some(ms));
        }
        let db = db_config
            .open()
            .context("failed to open fingerprint db")
            .map_err(StorageError::Fingerprints)?;

        let expected_per_shard = (config.expected_items / shard_count).max(10_000);
        let mut shards = Vec::with_capacity(shard_count);
        for idx in 0..shard_count {
            let tree = db
                .open_tree(format!("fp-shard-{idx:04}"))
                .context("failed to open fingerprint shard")
                .map_err(StorageError::Fingerprints)?;
            let bloom =
                Bloom::new_for_fp_rate(expected_per_shard, config.false_positive_rate.max(0.0001))
                    .map_err(|err| StorageError::Fingerprints(anyhow::anyhow!(err.to_string())))?;
            shards.push(Shard {
                hot: Mutex::new(HashSet::with_capacity(
                    config.hot_entries_per_shard.min(expected_per_shard),
                )),
                bloom: Mutex::new(bloom),
                tree,
            });
        }

        Ok(Self {
            db,
            shards,
            shard_mask: shard_count - 1,
            hot_entries_per_shard: config.hot_entries_per_shard.max(1_000),
            stats: FingerprintStatsAtomic::default(),
        })
    }

    #[inline]
    fn shard_for(&self, fp: Fingerprint) -> &Shard {
        &self.shards[(fp.raw() as usize) & self.shard_mask]
    }

    #[inline]
    fn touch_hot(&self, shard: &Shard, fp: u64) {
        let mut hot = shard.hot.lock();
        hot.insert(fp);
        if hot.len() > self.hot_entries_per_shard {
            hot.clear();
        }
    }

    /// Returns true iff `fp` was not already present. Once any caller has
    /// been told "absent" for a fingerprint, every later call from any
    /// thread sees "present".
    pub fn insert_if_absent(&self, fp: Fingerprint) -> Result<bool, StorageError> {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        let shard = self.shard_for(fp);
        let raw = fp.raw();

        {
            let hot = shard.hot.lock();
            if hot.contains(&raw) {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
        }

        let key = fp.to_be_bytes();
        let bloom_positive = shard.bloom.lock().check(&raw);
        if bloom_positive {
            self.stats.disk_lookups.fetch_add(1, Ordering::Relaxed);
            let present = shard
                .tree
                .contains_key(key)
                .context("fingerprint lookup failed")
                .map_err(StorageError::Fingerprints)?;
            if present {
                self.touch_hot(shard, raw);
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
        }

        let previous = shard
            .tree
            .insert(key, &[1u8])
            .context("fingerprint insert failed")
            .map_err(StorageError::Fingerprints)?;
        if previous.is_some() {
            self.touch_hot(shard, raw);
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        shard.bloom.lock().set(&raw);
        self.touch_hot(shard, raw);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Batched `insert_if_absent`: `fresh[i]` is set true iff `fps[i]` was
    /// newly inserted. Items are grouped by shard so each shard's locks are
    /// taken once per batch rather than once per fingerprint.
    pub fn insert_if_absent_batch(
        &self,
        fps: &[Fingerprint],
        fresh: &mut Vec<bool>,
    ) -> Result<(), StorageError> {
        fresh.clear();
        fresh.resize(fps.len(), false);
        if fps.is_empty() {
            return Ok(());
        }

        let mut by_shard: Vec<(usize, usize, u64)> = fps
            .iter()
            .enumerate()
            .map(|(index, fp)| ((fp.raw() as usize) & self.shard_mask, index, fp.raw()))
            .collect();
        by_shard.sort_unstable_by_key(|(shard, _, _)| *shard);

        let mut checks = 0u64;
        let mut duplicates = 0u64;
        let mut inserts = 0u64;
        let mut disk_lookups = 0u64;

        let mut cursor = 0usize;
        while cursor < by_shard.len() {
            let shard_idx = by_shard[cursor].0;
            let mut end = cursor + 1;
            while end < by_shard.len() && by_shard[end].0 == shard_idx {
                end += 1;
            }
            let shard = &self.shards[shard_idx];

            let mut unresolved: Vec<(usize, u64)> = Vec::new();
            {
                let hot = shard.hot.lock();
                for &(_, index, raw) in &by_shard[cursor..end] {
                    checks += 1;
                    if hot.contains(&raw) {
                        duplicates += 1;
                    } else {
                        unresolved.push((index, raw));
                    }
                }
            }

            if !unresolved.is_empty() {
                let bloom_hits: Vec<bool> = {
                    let bloom = shard.bloom.lock();
                    unresolved.iter().map(|(_, raw)| bloom.check(raw)).collect()
                };

                let mut hot_adds = Vec::with_capacity(unresolved.len());
                let mut bloom_adds = Vec::new();
                for ((index, raw), bloom_positive) in unresolved.into_iter().zip(bloom_hits) {
                    let key = raw.to_be_bytes();
                    let mut present = false;
                    if bloom_positive {
                        disk_lookups += 1;
                        present = shard
                            .tree
                            .contains_key(key)
                            .context("fingerprint lookup failed")
                            .map_err(StorageError::Fingerprints)?;
                    }
                    if !present {
                        let previous = shard
                            .tree
                            .insert(key, &[1u8])
                            .context("fingerprint insert failed")
                            .map_err(StorageError::Fingerprints)?;
                        present = previous.is_some();
                    }
                    if present {
                        duplicates += 1;
                    } else {
                        inserts += 1;
                        fresh[index] = true;
                        bloom_adds.push(raw);
                    }
                    hot_adds.push(raw);
                }

                if !bloom_adds.is_empty() {
                    let mut bloom = shard.bloom.lock();
                    for raw in bloom_adds {
                        bloom.set(&raw);
                    }
                }
                {
                    let mut hot = shard.hot.lock();
                    hot.extend(hot_adds);
                    if hot.len() > self.hot_entries_per_shard {
                        hot.clear();
                    }
                }
            }

            cursor = end;
        }

        self.stats.checks.fetch_add(checks, Ordering::Relaxed);
        self.stats
            .duplicates
            .fetch_add(duplicates, Ordering::Relaxed);
        self.stats.inserts.fetch_add(inserts, Ordering::Relaxed);
        self.stats
            .disk_lookups
            .fetch_add(disk_lookups, Ordering::Relaxed);
        Ok(())
    }

    pub fn distinct(&self) -> u64 {
        self.stats.inserts.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FingerprintStats {
        FingerprintStats {
            checks: self.stats.checks.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            disk_lookups: self.stats.disk_lookups.load(Ordering::Relaxed),
            shard_count: self.shards.len(),
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .context("failed to flush fingerprint db")
            .map_err(StorageError::Fingerprints)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FingerprintStore, FingerprintStoreConfig};
    use crate::fingerprint::Fingerprint;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(prefix: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("veristate-{prefix}-{nanos}-{}", std::process::id()))
    }

    fn small_store(path: &std::path::Path) -> FingerprintStore {
        FingerprintStore::open(FingerprintStoreConfig {
            path: path.to_path_buf(),
            shard_count: 4,
            expected_items: 10_000,
            false_positive_rate: 0.01,
            hot_entries_per_shard: 64,
            cache_capacity_bytes: 8 * 1024 * 1024,
            flush_every_ms: Some(500),
        })
        .expect("store should open")
    }

    #[test]
    fn absent_then_present() {
        let path = temp_path("fp-basic");
        let store = small_store(&path);

        assert!(store.insert_if_absent(Fingerprint(11)).unwrap());
        assert!(!store.insert_if_absent(Fingerprint(11)).unwrap());
        assert!(store.insert_if_absent(Fingerprint(12)).unwrap());

        let stats = store.stats();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.checks, 3);

        drop(store);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn batch_flags_fresh_entries_only() {
        let path = temp_path("fp-batch");
        let store = small_store(&path);

        let fps: Vec<Fingerprint> = [21u64, 22, 21, 23].into_iter().map(Fingerprint).collect();
        let mut fresh = Vec::new();
        store.insert_if_absent_batch(&fps, &mut fresh).unwrap();
        assert_eq!(fresh, vec![true, true, false, true]);

        let again: Vec<Fingerprint> = [21u64, 22, 23, 24].into_iter().map(Fingerprint).collect();
        store.insert_if_absent_batch(&again, &mut fresh).unwrap();
        assert_eq!(fresh, vec![false, false, false, true]);

        drop(store);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn exactly_one_winner_per_fingerprint_under_contention() {
        let path = temp_path("fp-race");
        let store = Arc::new(small_store(&path));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut wins = 0u64;
                for raw in 0..2_000u64 {
                    if store.insert_if_absent(Fingerprint(raw)).unwrap() {
                        wins += 1;
                    }
                }
                wins
            }));
        }
        let total_wins: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_wins, 2_000);
        assert_eq!(store.distinct(), 2_000);

        drop(store);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn membership_survives_reopen() {
        let path = temp_path("fp-reopen");
        {
            let store = small_store(&path);
            assert!(store.insert_if_absent(Fingerprint(77)).unwrap());
            store.flush().unwrap();
        }
        let store = small_store(&path);
        assert!(!store.insert_if_absent(Fingerprint(77)).unwrap());
        drop(store);
        let _ = std::fs::remove_dir_all(path);
    }
}
