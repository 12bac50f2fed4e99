use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ecoindex_types::{PendingRecord, RepositoryRecord};

use crate::error::WriteError;

/// Persistence seam for the batch writer.
#[async_trait]
pub trait RepoStore: Send + Sync + 'static {
    /// Lower-cased `owner/repo` keys already stored for `ecosystem`.
    async fn existing_keys(&self, ecosystem: &str) -> Result<HashSet<String>, WriteError>;

    /// Applies the whole batch in one transaction or not at all.
    async fn upsert_batch(&self, batch: &[PendingRecord]) -> Result<(), WriteError>;

    /// Detaches repositories under `min_stars` from `ecosystem` and deletes
    /// the ones left without any ecosystem. Returns detached rows.
    async fn prune_below_stars(&self, ecosystem: &str, min_stars: i64) -> Result<u64, WriteError>;
}

/// One repository's listing in one ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership<'a> {
    pub github_id: i64,
    pub ecosystem: &'a str,
    pub category: &'a str,
    pub listed_as: Option<&'a str>,
}

/// A batch with one record per repository id and every ecosystem listing
/// the batch carried for it.
#[derive(Debug)]
pub struct MergedBatch<'a> {
    pub records: Vec<&'a PendingRecord>,
    pub memberships: Vec<Membership<'a>>,
}

/// Keeps the last occurrence of each repository id, in first-seen order.
/// Memberships are merged instead: each `(id, ecosystem)` pair survives
/// with its latest category and source key.
pub fn merge_batch(batch: &[PendingRecord]) -> MergedBatch<'_> {
    let mut latest: HashMap<i64, usize> = HashMap::with_capacity(batch.len());
    let mut listings: HashMap<(i64, &str), &PendingRecord> = HashMap::with_capacity(batch.len());
    for (index, pending) in batch.iter().enumerate() {
        let id = pending.record.github_id;
        latest.insert(id, index);
        listings.insert((id, pending.ecosystem.as_str()), pending);
    }

    let mut seen = HashSet::with_capacity(latest.len());
    let mut records = Vec::with_capacity(latest.len());
    let mut memberships = Vec::with_capacity(listings.len());
    for pending in batch {
        let id = pending.record.github_id;
        if seen.insert(id) {
            records.push(&batch[latest[&id]]);
        }
        if let Some(listing) = listings.remove(&(id, pending.ecosystem.as_str())) {
            memberships.push(Membership {
                github_id: id,
                ecosystem: &listing.ecosystem,
                category: &listing.category,
                listed_as: listing.listed_as.as_deref(),
            });
        }
    }
    MergedBatch {
        records,
        memberships,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRepository {
    pub record: RepositoryRecord,
    /// Ecosystem to category.
    pub ecosystems: BTreeMap<String, String>,
    /// Ecosystem to the key the source listed the repository under, when
    /// that differs from its current name.
    pub aliases: BTreeMap<String, String>,
    pub writes: u32,
}

#[derive(Default)]
struct MemoryInner {
    rows: HashMap<i64, StoredRepository>,
    fail_on_key: Option<String>,
    fail_next: u32,
    upsert_calls: usize,
}

/// In-process store with the same conflict rules as the Postgres schema.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch containing `key` fails until cleared.
    pub fn fail_on_key(&self, key: &str) {
        self.lock().fail_on_key = Some(key.to_ascii_lowercase());
    }

    pub fn clear_failure(&self) {
        let mut inner = self.lock();
        inner.fail_on_key = None;
        inner.fail_next = 0;
    }

    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn get(&self, key: &str) -> Option<StoredRepository> {
        let key = key.to_ascii_lowercase();
        self.lock()
            .rows
            .values()
            .find(|row| row.record.key() == key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn upsert_calls(&self) -> usize {
        self.lock().upsert_calls
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply(rows: &mut HashMap<i64, StoredRepository>, pending: &PendingRecord) {
    let incoming = &pending.record;
    let row = rows
        .entry(incoming.github_id)
        .or_insert_with(|| StoredRepository {
            record: RepositoryRecord {
                contributors: Some(Vec::new()),
                languages: Some(Default::default()),
                ..incoming.clone()
            },
            ecosystems: BTreeMap::new(),
            aliases: BTreeMap::new(),
            writes: 0,
        });

    let created_at = row.record.created_at.or(incoming.created_at);
    let contributors = incoming
        .contributors
        .clone()
        .or_else(|| row.record.contributors.take());
    let languages = incoming.languages.clone().or_else(|| row.record.languages.take());
    row.record = RepositoryRecord {
        created_at,
        contributors,
        languages,
        ..incoming.clone()
    };
    row.writes += 1;
}

#[async_trait]
impl RepoStore for MemoryStore {
    async fn existing_keys(&self, ecosystem: &str) -> Result<HashSet<String>, WriteError> {
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|row| row.ecosystems.contains_key(ecosystem))
            .flat_map(|row| std::iter::once(row.record.key()).chain(row.aliases.get(ecosystem).cloned()))
            .collect())
    }

    async fn upsert_batch(&self, batch: &[PendingRecord]) -> Result<(), WriteError> {
        let mut inner = self.lock();
        inner.upsert_calls += 1;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(WriteError::Unavailable("injected batch failure".to_string()));
        }

        let merged = merge_batch(batch);
        let mut staged = inner.rows.clone();
        for pending in &merged.records {
            if inner.fail_on_key.as_deref() == Some(pending.key().as_str()) {
                return Err(WriteError::Unavailable(format!(
                    "injected failure writing {}",
                    pending.record.full_name
                )));
            }
            apply(&mut staged, pending);
        }
        for membership in &merged.memberships {
            if let Some(row) = staged.get_mut(&membership.github_id) {
                row.ecosystems
                    .insert(membership.ecosystem.to_string(), membership.category.to_string());
                match membership.listed_as {
                    Some(alias) => row.aliases.insert(membership.ecosystem.to_string(), alias.to_string()),
                    None => row.aliases.remove(membership.ecosystem),
                };
            }
        }
        inner.rows = staged;
        Ok(())
    }

    async fn prune_below_stars(&self, ecosystem: &str, min_stars: i64) -> Result<u64, WriteError> {
        let mut inner = self.lock();
        let mut detached = 0u64;
        for row in inner.rows.values_mut() {
            if row.record.stars < min_stars && row.ecosystems.remove(ecosystem).is_some() {
                row.aliases.remove(ecosystem);
                detached += 1;
            }
        }
        inner.rows.retain(|_, row| !row.ecosystems.is_empty());
        Ok(detached)
    }
}
