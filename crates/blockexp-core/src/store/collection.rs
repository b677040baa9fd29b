//! Typed document collection with a primary key and secondary indexes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::fs::File;
use std::hash::Hash;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{CoreError, StoreError};

use super::options::{Direction, StreamingFindOptions};
use super::query::{Filter, IndexValue};

/// A persisted document type.
pub trait Document: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync;

    /// Collection suffix, as in `{chain}:{network}:{NAME}`.
    const NAME: &'static str;

    fn key(&self) -> Self::Key;

    /// Values of a camelCase field; one per element for array fields, none
    /// when the field is absent or null.
    fn field(&self, name: &str) -> Vec<IndexValue>;

    /// Secondary indexes declared by `create_indexes`.
    fn indexes() -> Vec<IndexSpec>;

    /// Value this document took from the collection's id sequence, if any.
    fn sequence(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<&'static str>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn on(fields: &[&'static str]) -> Self {
        Self {
            name: fields.join("_"),
            fields: fields.to_vec(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// In-place modification applied by update and upsert operations.
pub type Update<D> = Arc<dyn Fn(&mut D) + Send + Sync>;

pub fn update<D>(f: impl Fn(&mut D) + Send + Sync + 'static) -> Update<D> {
    Arc::new(f)
}

pub enum WriteOp<D: Document> {
    InsertOne(D),
    /// Insert `insert` if no document has its key, otherwise apply `update`
    /// to the existing document.
    UpsertOne { insert: D, update: Update<D> },
    /// Apply `update` to the document with `key`; a missing key is a no-op.
    UpdateOne { key: D::Key, update: Update<D> },
    UpdateMany { filter: Filter, update: Update<D> },
    DeleteMany { filter: Filter },
}

impl<D: Document> Clone for WriteOp<D> {
    fn clone(&self) -> Self {
        match self {
            Self::InsertOne(doc) => Self::InsertOne(doc.clone()),
            Self::UpsertOne { insert, update } => Self::UpsertOne {
                insert: insert.clone(),
                update: update.clone(),
            },
            Self::UpdateOne { key, update } => Self::UpdateOne {
                key: key.clone(),
                update: update.clone(),
            },
            Self::UpdateMany { filter, update } => Self::UpdateMany {
                filter: filter.clone(),
                update: update.clone(),
            },
            Self::DeleteMany { filter } => Self::DeleteMany {
                filter: filter.clone(),
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub upserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

pub type DocumentStream<D> = BoxStream<'static, D>;

type DocId = u64;

// ==============================================================================
// Index Maintenance
// ==============================================================================

struct Index {
    spec: IndexSpec,
    entries: BTreeMap<Vec<IndexValue>, BTreeSet<DocId>>,
}

impl Index {
    /// One key per combination of field values; absent fields index as null.
    fn keys<D: Document>(&self, doc: &D) -> Vec<Vec<IndexValue>> {
        let mut keys: Vec<Vec<IndexValue>> = vec![Vec::new()];
        for field in &self.spec.fields {
            let mut values = doc.field(field);
            if values.is_empty() {
                values.push(IndexValue::Null);
            }
            values.sort();
            values.dedup();
            keys = keys
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |value| {
                        let mut key = prefix.clone();
                        key.push(value.clone());
                        key
                    })
                })
                .collect();
        }
        keys
    }

    fn conflicts(&self, key: &[IndexValue], id: DocId) -> bool {
        self.spec.unique
            && self
                .entries
                .get(key)
                .is_some_and(|ids| ids.iter().any(|other| *other != id))
    }

    fn add(&mut self, keys: Vec<Vec<IndexValue>>, id: DocId) {
        for key in keys {
            self.entries.entry(key).or_default().insert(id);
        }
    }

    fn remove(&mut self, keys: Vec<Vec<IndexValue>>, id: DocId) {
        for key in keys {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

struct Inner<D: Document> {
    docs: BTreeMap<DocId, D>,
    primary: HashMap<D::Key, DocId>,
    indexes: Vec<Index>,
    next_doc: DocId,
}

impl<D: Document> Inner<D> {
    fn new() -> Self {
        Self {
            docs: BTreeMap::new(),
            primary: HashMap::new(),
            indexes: Vec::new(),
            next_doc: 0,
        }
    }

    fn check_unique(&self, doc: &D, id: DocId, collection: &str) -> Result<(), StoreError> {
        let key = doc.key();
        if self.primary.get(&key).is_some_and(|existing| *existing != id) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_owned(),
                key: format!("{key:?}"),
            });
        }
        for index in self.indexes.iter().filter(|index| index.spec.unique) {
            for key in index.keys(doc) {
                if index.conflicts(&key, id) {
                    return Err(StoreError::DuplicateKey {
                        collection: collection.to_owned(),
                        key: format!("{} {key:?}", index.spec.name),
                    });
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, doc: D, collection: &str) -> Result<DocId, StoreError> {
        let id = self.next_doc;
        self.check_unique(&doc, id, collection)?;
        self.next_doc += 1;
        self.primary.insert(doc.key(), id);
        for index in self.indexes.iter_mut() {
            let keys = index.keys(&doc);
            index.add(keys, id);
        }
        self.docs.insert(id, doc);
        Ok(id)
    }

    fn unlink(&mut self, id: DocId, doc: &D) {
        let key = doc.key();
        if self.primary.get(&key) == Some(&id) {
            self.primary.remove(&key);
        }
        for index in self.indexes.iter_mut() {
            let keys = index.keys(doc);
            index.remove(keys, id);
        }
    }

    fn remove(&mut self, id: DocId) -> Option<D> {
        let doc = self.docs.remove(&id)?;
        self.unlink(id, &doc);
        Some(doc)
    }

    /// Apply `update` to document `id`, keeping the original on a unique
    /// violation.
    fn apply_update(
        &mut self,
        id: DocId,
        update: &Update<D>,
        collection: &str,
    ) -> Result<bool, StoreError> {
        let Some(current) = self.docs.get(&id) else {
            return Ok(false);
        };
        let mut next = current.clone();
        update(&mut next);
        self.check_unique(&next, id, collection)?;

        if let Some(old) = self.docs.remove(&id) {
            self.unlink(id, &old);
        }
        self.primary.insert(next.key(), id);
        for index in self.indexes.iter_mut() {
            let keys = index.keys(&next);
            index.add(keys, id);
        }
        self.docs.insert(id, next);
        Ok(true)
    }

    fn single_field_index(&self, field: &str) -> Option<&Index> {
        self.indexes
            .iter()
            .find(|index| index.spec.fields.len() == 1 && index.spec.fields[0] == field)
    }

    /// Candidate ids for `filter`, narrowed through the first clause an
    /// index can serve.
    fn candidates(&self, filter: &Filter) -> Vec<DocId> {
        for (field, condition) in filter.clauses() {
            let Some(index) = self
                .indexes
                .iter()
                .find(|index| index.spec.fields.first() == Some(&field.as_str()))
            else {
                continue;
            };
            if let Some(points) = condition.point_values() {
                let mut ids = BTreeSet::new();
                for point in points {
                    for (key, set) in index.entries.range(vec![point.clone()]..) {
                        if key.first() != Some(&point) {
                            break;
                        }
                        ids.extend(set.iter().copied());
                    }
                }
                return ids.into_iter().collect();
            }
            if condition.is_range() {
                let ids: BTreeSet<DocId> = index
                    .entries
                    .iter()
                    .filter(|(key, _)| key.first().is_some_and(|value| condition.admits(value)))
                    .flat_map(|(_, set)| set.iter().copied())
                    .collect();
                return ids.into_iter().collect();
            }
        }
        self.docs.keys().copied().collect()
    }

    fn is_match(&self, id: DocId, filter: &Filter) -> bool {
        self.docs
            .get(&id)
            .is_some_and(|doc| filter.matches_with(|field| doc.field(field)))
    }

    fn matching(&self, filter: &Filter) -> Vec<DocId> {
        self.candidates(filter)
            .into_iter()
            .filter(|id| self.is_match(*id, filter))
            .collect()
    }

    fn query(&self, filter: &Filter, options: &StreamingFindOptions) -> Vec<D> {
        let mut filter = filter.clone();
        if let (Some(field), Some(since)) = (options.paging_field(), options.since_value()) {
            filter = match options.get_direction() {
                Direction::Ascending => filter.gt(field, since.clone()),
                Direction::Descending => filter.lt(field, since.clone()),
            };
        }
        let limit = options.get_limit().unwrap_or(usize::MAX);
        let sort = options.effective_sort();

        // Walk a single-field index in order when one matches the sort.
        if let [(field, direction)] = sort.as_slice() {
            if let Some(index) = self.single_field_index(field) {
                let entries: Box<dyn Iterator<Item = &BTreeSet<DocId>>> = match direction {
                    Direction::Ascending => Box::new(index.entries.values()),
                    Direction::Descending => Box::new(index.entries.values().rev()),
                };
                let mut seen = HashSet::new();
                return entries
                    .flat_map(|ids| ids.iter().copied())
                    .filter(|id| seen.insert(*id))
                    .filter(|id| self.is_match(*id, &filter))
                    .take(limit)
                    .filter_map(|id| self.docs.get(&id).cloned())
                    .collect();
            }
        }

        let mut ids = self.matching(&filter);
        if !sort.is_empty() {
            let mut keyed: Vec<(Vec<IndexValue>, DocId)> = ids
                .into_iter()
                .map(|id| {
                    let key = sort
                        .iter()
                        .map(|(field, _)| {
                            self.docs
                                .get(&id)
                                .and_then(|doc| doc.field(field).into_iter().next())
                                .unwrap_or(IndexValue::Null)
                        })
                        .collect();
                    (key, id)
                })
                .collect();
            keyed.sort_by(|(a, a_id), (b, b_id)| {
                for (i, (_, direction)) in sort.iter().enumerate() {
                    let ord = a[i].cmp(&b[i]);
                    let ord = match direction {
                        Direction::Ascending => ord,
                        Direction::Descending => ord.reverse(),
                    };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                a_id.cmp(b_id)
            });
            ids = keyed.into_iter().map(|(_, id)| id).collect();
        }
        ids.into_iter()
            .take(limit)
            .filter_map(|id| self.docs.get(&id).cloned())
            .collect()
    }

    fn apply(
        &mut self,
        op: &WriteOp<D>,
        collection: &str,
        result: &mut BulkWriteResult,
    ) -> Result<(), StoreError> {
        match op {
            WriteOp::InsertOne(doc) => {
                self.insert(doc.clone(), collection)?;
                result.inserted += 1;
            }
            WriteOp::UpsertOne { insert, update } => {
                match self.primary.get(&insert.key()).copied() {
                    Some(id) => {
                        self.apply_update(id, update, collection)?;
                        result.updated += 1;
                    }
                    None => {
                        self.insert(insert.clone(), collection)?;
                        result.upserted += 1;
                    }
                }
            }
            WriteOp::UpdateOne { key, update } => {
                if let Some(id) = self.primary.get(key).copied() {
                    if self.apply_update(id, update, collection)? {
                        result.updated += 1;
                    }
                }
            }
            WriteOp::UpdateMany { filter, update } => {
                for id in self.matching(filter) {
                    if self.apply_update(id, update, collection)? {
                        result.updated += 1;
                    }
                }
            }
            WriteOp::DeleteMany { filter } => {
                for id in self.matching(filter) {
                    if self.remove(id).is_some() {
                        result.deleted += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

// ==============================================================================
// Collection
// ==============================================================================

pub struct Collection<D: Document> {
    name: String,
    inner: RwLock<Inner<D>>,
    sequence: AtomicU64,
}

impl<D: Document> Collection<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build `spec` over existing documents. Re-declaring an index is a no-op.
    pub async fn create_index(&self, spec: IndexSpec) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        if inner.indexes.iter().any(|index| index.spec.name == spec.name) {
            return Ok(());
        }
        let mut index = Index {
            spec,
            entries: BTreeMap::new(),
        };
        for (id, doc) in &inner.docs {
            for key in index.keys(doc) {
                if index.conflicts(&key, *id) {
                    return Err(StoreError::DuplicateKey {
                        collection: self.name.clone(),
                        key: format!("{} {key:?}", index.spec.name),
                    }
                    .into());
                }
                index.entries.entry(key).or_default().insert(*id);
            }
        }
        debug!(collection = %self.name, index = %index.spec.name, "index created");
        inner.indexes.push(index);
        Ok(())
    }

    pub async fn index_names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.indexes.iter().map(|index| index.spec.name.clone()).collect()
    }

    /// Next value of this collection's id sequence, starting at 1.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ==========================================================================
    // Reads
    // ==========================================================================

    pub async fn get(&self, key: &D::Key) -> Result<Option<D>, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .primary
            .get(key)
            .and_then(|id| inner.docs.get(id))
            .cloned())
    }

    /// Number of stored documents, without scanning them.
    pub async fn len(&self) -> usize {
        self.inner.read().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// First match in insertion order.
    pub async fn fetch_one(&self, filter: &Filter) -> Result<Option<D>, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .matching(filter)
            .into_iter()
            .next()
            .and_then(|id| inner.docs.get(&id).cloned()))
    }

    pub async fn fetch_all(&self) -> Result<Vec<D>, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner.docs.values().cloned().collect())
    }

    pub async fn fetch_many(
        &self,
        filter: &Filter,
        options: &StreamingFindOptions,
    ) -> Result<Vec<D>, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner.query(filter, options))
    }

    pub async fn count(&self, filter: &Filter) -> Result<usize, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner.matching(filter).len())
    }

    /// Stream the documents matching `filter` under `options`.
    ///
    /// Results are taken as one consistent read; later writes do not affect
    /// an open stream.
    pub async fn streaming(
        &self,
        filter: &Filter,
        options: &StreamingFindOptions,
    ) -> Result<DocumentStream<D>, CoreError> {
        let docs = self.fetch_many(filter, options).await?;
        Ok(stream::iter(docs).boxed())
    }

    // ==========================================================================
    // Writes
    // ==========================================================================

    pub async fn insert_one(&self, doc: D) -> Result<(), CoreError> {
        self.bulk_write(vec![WriteOp::InsertOne(doc)]).await?;
        Ok(())
    }

    /// Returns `true` when a new document was inserted.
    pub async fn upsert_one(&self, insert: D, update: Update<D>) -> Result<bool, CoreError> {
        let result = self
            .bulk_write(vec![WriteOp::UpsertOne { insert, update }])
            .await?;
        Ok(result.upserted == 1)
    }

    /// Returns `true` when a document with `key` existed.
    pub async fn update_one(&self, key: D::Key, update: Update<D>) -> Result<bool, CoreError> {
        let result = self.bulk_write(vec![WriteOp::UpdateOne { key, update }]).await?;
        Ok(result.updated == 1)
    }

    pub async fn update_many(&self, filter: Filter, update: Update<D>) -> Result<usize, CoreError> {
        let result = self
            .bulk_write(vec![WriteOp::UpdateMany { filter, update }])
            .await?;
        Ok(result.updated)
    }

    pub async fn delete_many(&self, filter: Filter) -> Result<usize, CoreError> {
        let result = self.bulk_write(vec![WriteOp::DeleteMany { filter }]).await?;
        Ok(result.deleted)
    }

    /// Apply `ops` unordered.
    ///
    /// Operations that fail are retried one by one after the rest of the
    /// batch has been applied. A single remaining failure is returned as is;
    /// several are reported as [`StoreError::PartialBulkWrite`].
    pub async fn bulk_write(&self, ops: Vec<WriteOp<D>>) -> Result<BulkWriteResult, CoreError> {
        let mut result = BulkWriteResult::default();
        if ops.is_empty() {
            return Ok(result);
        }

        let mut inner = self.inner.write().await;
        let failed: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| inner.apply(op, &self.name, &mut result).err().map(|_| i))
            .collect();
        if failed.is_empty() {
            return Ok(result);
        }

        warn!(
            collection = %self.name,
            failed = failed.len(),
            total = ops.len(),
            "bulk write partially failed; retrying failed operations"
        );
        let mut errors = Vec::new();
        for i in failed {
            if let Err(err) = inner.apply(&ops[i], &self.name, &mut result) {
                error!(collection = %self.name, op = i, error = %err, "write operation failed");
                errors.push(err);
            }
        }
        match errors.len() {
            0 => Ok(result),
            1 => Err(errors.swap_remove(0).into()),
            failed => Err(StoreError::PartialBulkWrite {
                collection: self.name.clone(),
                failed,
                total: ops.len(),
            }
            .into()),
        }
    }

    // ==========================================================================
    // Snapshots
    // ==========================================================================

    /// Write every document as one JSON line, replacing `path` atomically.
    pub(crate) async fn save_jsonl(&self, path: &Path) -> Result<usize, CoreError> {
        let snapshot_err = |message: String| StoreError::Snapshot {
            path: path.to_path_buf(),
            message,
        };
        let inner = self.inner.read().await;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("jsonl.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for doc in inner.docs.values() {
            serde_json::to_writer(&mut writer, doc).map_err(|e| snapshot_err(e.to_string()))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp, path)?;
        Ok(inner.docs.len())
    }

    /// Load documents written by [`Self::save_jsonl`]; a missing file loads
    /// nothing.
    pub(crate) async fn load_jsonl(&self, path: &Path) -> Result<usize, CoreError> {
        if !path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut inner = self.inner.write().await;
        let mut loaded = 0;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: D = serde_json::from_str(&line).map_err(|e| StoreError::Snapshot {
                path: path.to_path_buf(),
                message: format!("line {}: {e}", line_no + 1),
            })?;
            inner.insert(doc, &self.name)?;
            loaded += 1;
        }
        let restored = inner
            .docs
            .values()
            .filter_map(D::sequence)
            .max()
            .unwrap_or(inner.docs.len() as u64);
        self.sequence.fetch_max(restored, Ordering::SeqCst);
        Ok(loaded)
    }
}
