use crate::error::StorageError;
use crate::fingerprint::Fingerprint;
use anyhow::Context;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-fingerprint bookkeeping, created exactly once when the fingerprint is
/// first observed. `predecessor` links form the chains counterexample traces
/// are rebuilt from; `labels` records tableau-node membership for liveness
/// and may be extended after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub predecessor: Option<Fingerprint>,
    pub labels: Vec<u32>,
}

/// Labels pack (property index, tableau node) into one u32 so a single
/// record serves every configured temporal property.
#[inline]
pub fn pack_label(property: u16, node: u16) -> u32 {
    ((property as u32) << 16) | node as u32
}

#[inline]
pub fn unpack_label(label: u32) -> (u16, u16) {
    ((label >> 16) as u16, (label & 0xffff) as u16)
}

#[derive(Clone, Debug)]
pub struct GraphStoreConfig {
    pub path: PathBuf,
    /// Successor edges are only kept when liveness properties are configured.
    pub track_edges: bool,
    pub cache_capacity_bytes: u64,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./.veristate/graph"),
            track_edges: false,
            cache_capacity_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Persistent, append-once mapping from fingerprint to `StateRecord`.
///
/// Each fingerprint's record is written exactly once, so concurrent writers
/// never contend on the same key. Concurrent readers must tolerate a record
/// not existing yet: that fingerprint simply has not been explored.
pub struct StateGraphStore {
    db: sled::Db,
    records: sled::Tree,
    /// In-memory successor index, mirrored to the `edges` tree so a resumed
    /// run still sees the transitions of states expanded before the restart.
    edges: Option<DashMap<u64, Vec<u64>>>,
    edge_tree: sled::Tree,
    record_count: AtomicU64,
}

impl StateGraphStore {
    pub fn open(config: GraphStoreConfig) -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity_bytes)
            .mode(sled::Mode::HighThroughput)
            .open()
            .with_context(|| format!("failed to open graph store at {}", config.path.display()))
            .map_err(StorageError::Graph)?;
        let records = db
            .open_tree("records")
            .context("failed to open record tree")
            .map_err(StorageError::Graph)?;
        let edge_tree = db
            .open_tree("edges")
            .context("failed to open edge tree")
            .map_err(StorageError::Graph)?;
        let existing = records.len() as u64;

        let edges = if config.track_edges {
            let map = DashMap::new();
            for item in edge_tree.iter() {
                let (key, value) = item
                    .context("edge scan failed")
                    .map_err(StorageError::Graph)?;
                let from = u64::from_be_bytes(
                    key.as_ref()
                        .try_into()
                        .context("corrupt edge key")
                        .map_err(StorageError::Graph)?,
                );
                let out: Vec<u64> = bincode::deserialize(&value)
                    .context("corrupt edge list")
                    .map_err(StorageError::Graph)?;
                map.insert(from, out);
            }
            Some(map)
        } else {
            None
        };

        Ok(Self {
            db,
            records,
            edges,
            edge_tree,
            record_count: AtomicU64::new(existing),
        })
    }

    /// Write the record for a fingerprint observed for the first time.
    ///
    /// Returns false (without modifying the stored record) if a record
    /// already exists, which can happen when the caller deduplicates through
    /// the fingerprint set and a resume replays the same discovery.
    pub fn insert_record(
        &self,
        fp: Fingerprint,
        record: &StateRecord,
    ) -> Result<bool, StorageError> {
        let bytes = bincode::serialize(record)
            .context("failed to serialize state record")
            .map_err(StorageError::Graph)?;
        let swap = self
            .records
            .compare_and_swap(fp.to_be_bytes(), None as Option<&[u8]>, Some(bytes))
            .context("record write failed")
            .map_err(StorageError::Graph)?;
        let inserted = swap.is_ok();
        if inserted {
            self.record_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(inserted)
    }

    pub fn record(&self, fp: Fingerprint) -> Result<Option<StateRecord>, StorageError> {
        let raw = self
            .records
            .get(fp.to_be_bytes())
            .context("record read failed")
            .map_err(StorageError::Graph)?;
        match raw {
            None => Ok(None),
            Some(bytes) => bincode::deserialize(&bytes)
                .context("corrupt state record")
                .map_err(StorageError::Graph)
                .map(Some),
        }
    }

    /// Extend a record's tableau labels. The record must already exist.
    pub fn extend_labels(
        &self,
        fp: Fingerprint,
        extra: &[u32],
    ) -> Result<(), StorageError> {
        if extra.is_empty() {
            return Ok(());
        }
        self.records
            .fetch_and_update(fp.to_be_bytes(), |old| {
                let mut record: StateRecord = match old {
                    Some(bytes) => bincode::deserialize(bytes).ok()?,
                    None => return None,
                };
                for label in extra {
                    if !record.labels.contains(label) {
                        record.labels.push(*label);
                    }
                }
                bincode::serialize(&record).ok()
            })
            .context("label update failed")
            .map_err(StorageError::Graph)?;
        Ok(())
    }

    /// Record the full successor set of an expanded state. Called exactly
    /// once per fingerprint, by the worker that expanded it.
    pub fn record_edges(
        &self,
        from: Fingerprint,
        successors: &[Fingerprint],
    ) -> Result<(), StorageError> {
        let Some(edges) = &self.edges else {
            return Ok(());
        };
        let mut seen = HashSet::with_capacity(successors.len());
        let out: Vec<u64> = successors
            .iter()
            .map(|fp| fp.raw())
            .filter(|raw| seen.insert(*raw))
            .collect();
        let bytes = bincode::serialize(&out)
            .context("failed to serialize edge list")
            .map_err(StorageError::Graph)?;
        self.edge_tree
            .insert(from.to_be_bytes(), bytes)
            .context("edge write failed")
            .map_err(StorageError::Graph)?;
        edges.insert(from.raw(), out);
        Ok(())
    }

    pub fn successors(&self, fp: Fingerprint) -> Vec<Fingerprint> {
        match &self.edges {
            Some(edges) => edges
                .get(&fp.raw())
                .map(|out| out.iter().map(|raw| Fingerprint(*raw)).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn tracks_edges(&self) -> bool {
        self.edges.is_some()
    }

    /// Walk predecessor links back to an initial state (record with no
    /// predecessor) and return the chain in forward order, ending at `fp`.
    pub fn chain_to_initial(&self, fp: Fingerprint) -> Result<Vec<Fingerprint>, StorageError> {
        let mut chain = vec![fp];
        let mut seen = HashSet::from([fp.raw()]);
        let mut cursor = fp;
        while let Some(record) = self.record(cursor)? {
            match record.predecessor {
                Some(prev) => {
                    // A cycle here would mean a corrupted record chain.
                    if !seen.insert(prev.raw()) {
                        return Err(StorageError::Graph(anyhow::anyhow!(
                            "predecessor chain of {cursor} revisits {prev}"
                        )));
                    }
                    chain.push(prev);
                    cursor = prev;
                }
                None => {
                    chain.reverse();
                    return Ok(chain);
                }
            }
        }
        Err(StorageError::Graph(anyhow::anyhow!(
            "predecessor chain of {fp} reaches unrecorded state {cursor}"
        )))
    }

    pub fn len(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .context("failed to flush graph store")
            .map_err(StorageError::Graph)?;
        Ok(())
    }
}
