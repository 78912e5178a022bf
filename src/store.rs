//! Narrow interface to the physical object store.
//!
//! The engine needs point-in-time metadata snapshots for a set of tokens,
//! single-object reads, an atomic merge for incoming migration data, and the
//! list of tokens the store holds data for.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::Result;
use crate::types::{ObjectId, ObjectMeta, ObjectRecord, Token};

/// Point-in-time metadata for a set of tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataSnapshot {
    /// Store change sequence at the moment the snapshot was taken.
    pub mark: u64,
    /// Objects per requested token (tokens without objects map to empty lists).
    pub objects: BTreeMap<Token, Vec<ObjectMeta>>,
}

impl MetadataSnapshot {
    /// Objects of one token.
    pub fn objects(&self, token: Token) -> &[ObjectMeta] {
        self.objects.get(&token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The same snapshot limited to `tokens`.
    pub fn restrict(&self, tokens: &BTreeSet<Token>) -> MetadataSnapshot {
        MetadataSnapshot {
            mark: self.mark,
            objects: tokens
                .iter()
                .map(|t| (*t, self.objects(*t).to_vec()))
                .collect(),
        }
    }

    /// Objects changed after `mark`, per token.
    pub fn changed_since(&self, mark: u64) -> BTreeMap<Token, Vec<ObjectMeta>> {
        self.objects
            .iter()
            .map(|(t, metas)| (*t, metas.iter().filter(|m| m.seq > mark).copied().collect()))
            .collect()
    }

    /// Total object count.
    pub fn len(&self) -> usize {
        self.objects.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a merge did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Object store operations used by executors and clients.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Snapshot metadata for `tokens`.
    async fn snapshot(&self, tokens: &BTreeSet<Token>) -> Result<MetadataSnapshot>;

    /// Read a single object with its payload.
    async fn read_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>>;

    /// Atomically merge an incoming copy using [`ObjectRecord::merge`].
    async fn merge_object(&self, record: ObjectRecord) -> Result<MergeOutcome>;

    /// Tokens the store currently holds data for.
    fn owned_tokens(&self) -> BTreeSet<Token>;
}

#[derive(Debug, Default)]
struct StoreInner {
    objects: HashMap<ObjectId, (ObjectRecord, u64)>,
    owned: BTreeSet<Token>,
    seq: u64,
}

/// In-memory object store (for testing and embedding).
#[derive(Debug)]
pub struct InMemoryObjectStore {
    token_bits: u32,
    inner: Mutex<StoreInner>,
}

impl InMemoryObjectStore {
    /// Create an empty store for a table of `2^token_bits` tokens.
    pub fn new(token_bits: u32) -> Self {
        Self {
            token_bits,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Unconditionally write an object, as the live write path does.
    pub fn put(&self, record: ObjectRecord) {
        let token = record.id.token(self.token_bits);
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner.owned.insert(token);
        inner.objects.insert(record.id, (record, seq));
    }

    /// Declare ownership of tokens that hold no objects yet.
    pub fn claim_tokens(&self, tokens: impl IntoIterator<Item = Token>) {
        self.inner.lock().owned.extend(tokens);
    }

    /// Read without going through the async trait.
    pub fn get(&self, id: &ObjectId) -> Option<ObjectRecord> {
        self.inner.lock().objects.get(id).map(|(r, _)| r.clone())
    }

    /// All stored records, ordered by id.
    pub fn records(&self) -> Vec<ObjectRecord> {
        let mut records: Vec<_> = self
            .inner
            .lock()
            .objects
            .values()
            .map(|(r, _)| r.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current change sequence.
    pub fn mark(&self) -> u64 {
        self.inner.lock().seq
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn snapshot(&self, tokens: &BTreeSet<Token>) -> Result<MetadataSnapshot> {
        let inner = self.inner.lock();
        let mut objects: BTreeMap<Token, Vec<ObjectMeta>> =
            tokens.iter().map(|t| (*t, Vec::new())).collect();

        for (record, seq) in inner.objects.values() {
            let token = record.id.token(self.token_bits);
            if let Some(metas) = objects.get_mut(&token) {
                metas.push(ObjectMeta {
                    id: record.id,
                    refcount: record.refcount,
                    mod_ts: record.mod_ts,
                    seq: *seq,
                });
            }
        }
        for metas in objects.values_mut() {
            metas.sort_by_key(|m| m.id);
        }

        Ok(MetadataSnapshot {
            mark: inner.seq,
            objects,
        })
    }

    async fn read_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>> {
        Ok(self.get(id))
    }

    async fn merge_object(&self, record: ObjectRecord) -> Result<MergeOutcome> {
        let token = record.id.token(self.token_bits);
        let mut inner = self.inner.lock();
        let existing = inner.objects.get(&record.id).map(|(r, _)| r);
        let outcome = match (existing.is_some(), ObjectRecord::merge(existing, &record)) {
            (_, None) => return Ok(MergeOutcome::Unchanged),
            (true, Some(merged)) => (MergeOutcome::Updated, merged),
            (false, Some(merged)) => (MergeOutcome::Inserted, merged),
        };

        inner.seq += 1;
        let seq = inner.seq;
        inner.owned.insert(token);
        inner.objects.insert(record.id, (outcome.1, seq));
        Ok(outcome.0)
    }

    fn owned_tokens(&self) -> BTreeSet<Token> {
        self.inner.lock().owned.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u64, refcount: u32, mod_ts: u64) -> ObjectRecord {
        ObjectRecord::new(ObjectId::from_u64(n), refcount, mod_ts, format!("v{}", mod_ts))
    }

    #[tokio::test]
    async fn test_snapshot_marks_and_changes() {
        let store = InMemoryObjectStore::new(4);
        let a = record(1, 1, 10);
        let token = a.id.token(4);
        store.put(a.clone());

        let tokens: BTreeSet<_> = [token].into_iter().collect();
        let first = store.snapshot(&tokens).await.unwrap();
        assert_eq!(first.objects(token).len(), 1);

        store.put(ObjectRecord::new(a.id, 2, 20, "v20"));
        let second = store.snapshot(&tokens).await.unwrap();
        assert!(second.mark > first.mark);

        let changed = second.changed_since(first.mark);
        assert_eq!(changed[&token].len(), 1);
        assert_eq!(changed[&token][0].refcount, 2);
        assert!(second.changed_since(second.mark)[&token].is_empty());
    }

    #[tokio::test]
    async fn test_merge_outcomes() {
        let store = InMemoryObjectStore::new(4);
        let r = record(5, 1, 100);

        assert_eq!(store.merge_object(r.clone()).await.unwrap(), MergeOutcome::Inserted);
        assert_eq!(store.merge_object(r.clone()).await.unwrap(), MergeOutcome::Unchanged);

        let older = record(5, 1, 50);
        assert_eq!(store.merge_object(older).await.unwrap(), MergeOutcome::Unchanged);
        assert_eq!(store.get(&r.id).unwrap().mod_ts, 100);

        let newer = record(5, 3, 150);
        assert_eq!(store.merge_object(newer).await.unwrap(), MergeOutcome::Updated);
        assert_eq!(store.get(&r.id).unwrap().refcount, 3);
        assert!(store.owned_tokens().contains(&r.id.token(4)));
    }

    #[tokio::test]
    async fn test_restrict() {
        let store = InMemoryObjectStore::new(2);
        for n in 0..16 {
            store.put(record(n, 1, n + 1));
        }
        let all: BTreeSet<_> = (0..4).map(Token).collect();
        let snap = store.snapshot(&all).await.unwrap();
        assert_eq!(snap.len(), 16);

        let one: BTreeSet<_> = [Token(0)].into_iter().collect();
        let restricted = snap.restrict(&one);
        assert_eq!(restricted.objects.len(), 1);
        assert_eq!(restricted.mark, snap.mark);
    }
}
