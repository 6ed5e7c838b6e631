//! Key-value persistence for fake-ip mappings.
//!
//! Each pool writes into its own bucket. A mapping is mirrored as
//! `domain -> ip` and `ip -> domain`, both stored as strings.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use parking_lot::RwLock;
use tracing::{debug, info};

type Buckets = HashMap<String, HashMap<String, String>>;

pub trait FakeIpStore: Send + Sync {
    fn get(&self, bucket: &str, key: &str) -> Option<String>;
    fn put(&self, bucket: &str, entries: &[(&str, &str)]);
    fn delete(&self, bucket: &str, keys: &[&str]);
    fn iter(&self, bucket: &str) -> Vec<(String, String)>;

    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<Buckets>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn get_in(buckets: &Buckets, bucket: &str, key: &str) -> Option<String> {
    buckets.get(bucket).and_then(|b| b.get(key)).cloned()
}

fn put_in(buckets: &mut Buckets, bucket: &str, entries: &[(&str, &str)]) {
    let b = buckets.entry(bucket.to_string()).or_default();
    for (k, v) in entries {
        b.insert((*k).to_string(), (*v).to_string());
    }
}

fn delete_in(buckets: &mut Buckets, bucket: &str, keys: &[&str]) -> bool {
    let Some(b) = buckets.get_mut(bucket) else {
        return false;
    };
    let mut removed = false;
    for k in keys {
        removed |= b.remove(*k).is_some();
    }
    removed
}

fn iter_in(buckets: &Buckets, bucket: &str) -> Vec<(String, String)> {
    buckets
        .get(bucket)
        .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

impl FakeIpStore for MemoryStore {
    fn get(&self, bucket: &str, key: &str) -> Option<String> {
        get_in(&self.buckets.read(), bucket, key)
    }

    fn put(&self, bucket: &str, entries: &[(&str, &str)]) {
        put_in(&mut self.buckets.write(), bucket, entries);
    }

    fn delete(&self, bucket: &str, keys: &[&str]) {
        delete_in(&mut self.buckets.write(), bucket, keys);
    }

    fn iter(&self, bucket: &str) -> Vec<(String, String)> {
        iter_in(&self.buckets.read(), bucket)
    }
}

/// JSON file store. Mutations stay in memory until [`FakeIpStore::flush`],
/// which replaces the file atomically.
pub struct FileStore {
    path: PathBuf,
    buckets: RwLock<Buckets>,
    dirty: AtomicBool,
}

impl FileStore {
    /// Opens `path`, starting empty when the file is missing.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let buckets: Buckets = match fs::read(path) {
            Ok(raw) if raw.is_empty() => Buckets::new(),
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parse fake-ip cache {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Buckets::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read fake-ip cache {}", path.display()));
            }
        };
        info!(target = "fakeip", path = %path.display(),
            entries = buckets.values().map(HashMap::len).sum::<usize>(), "fake-ip cache loaded");
        Ok(Self {
            path: path.to_path_buf(),
            buckets: RwLock::new(buckets),
            dirty: AtomicBool::new(false),
        })
    }
}

impl FakeIpStore for FileStore {
    fn get(&self, bucket: &str, key: &str) -> Option<String> {
        get_in(&self.buckets.read(), bucket, key)
    }

    fn put(&self, bucket: &str, entries: &[(&str, &str)]) {
        put_in(&mut self.buckets.write(), bucket, entries);
        self.dirty.store(true, Ordering::Release);
    }

    fn delete(&self, bucket: &str, keys: &[&str]) {
        if delete_in(&mut self.buckets.write(), bucket, keys) {
            self.dirty.store(true, Ordering::Release);
        }
    }

    fn iter(&self, bucket: &str) -> Vec<(String, String)> {
        iter_in(&self.buckets.read(), bucket)
    }

    fn flush(&self) -> anyhow::Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let raw = serde_json::to_vec(&*self.buckets.read())?;
        let tmp = self.path.with_extension("tmp");
        let written = fs::write(&tmp, &raw)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .with_context(|| format!("write fake-ip cache {}", self.path.display()));
        if written.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        written?;
        debug!(target = "fakeip", path = %self.path.display(), bytes = raw.len(), "fake-ip cache flushed");
        Ok(())
    }
}
