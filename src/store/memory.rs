use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use super::{Collection, Document, DocumentStore, Filter, StoreError, lookup};
use crate::wal::{StoreOp, Wal};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        op: StoreOp,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        ops: Vec<StoreOp>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that arrive while a flush is pending are batched
/// into one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { op, response } => {
                let mut batch = vec![(op, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { op, response }) => batch.push((op, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(StoreOp, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (op, _) in &batch {
        if let Err(e) = wal.append_buffered(op) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so stale buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { ops, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &ops).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Collection state ─────────────────────────────────────

#[derive(Default)]
struct CollectionState {
    next_seq: u64,
    /// Insertion sequence → document. Iteration order is insertion order.
    docs: BTreeMap<u64, Document>,
    ids: HashMap<String, u64>,
    /// field → key → owning seq
    unique: HashMap<&'static str, HashMap<String, u64>>,
}

fn doc_id(doc: &Document) -> Result<String, StoreError> {
    match doc.get("_id") {
        Some(serde_json::Value::String(id)) => Ok(id.clone()),
        _ => Err(StoreError::Codec("document has no string _id".into())),
    }
}

fn index_key(doc: &Document, field: &str) -> Option<String> {
    match lookup(doc, field) {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

impl CollectionState {
    /// Check every unique index for `doc`, ignoring the entry owned by `own_seq`.
    fn check_unique(
        &self,
        collection: Collection,
        doc: &Document,
        own_seq: Option<u64>,
    ) -> Result<(), StoreError> {
        for (field, index) in &self.unique {
            if let Some(key) = index_key(doc, field)
                && let Some(&holder) = index.get(&key)
                && Some(holder) != own_seq
            {
                return Err(StoreError::DuplicateKey {
                    collection,
                    field: (*field).to_string(),
                    key,
                });
            }
        }
        Ok(())
    }

    fn index(&mut self, seq: u64, doc: &Document) {
        for (field, index) in self.unique.iter_mut() {
            if let Some(key) = index_key(doc, field) {
                index.insert(key, seq);
            }
        }
    }

    fn unindex(&mut self, seq: u64, doc: &Document) {
        for (field, index) in self.unique.iter_mut() {
            if let Some(key) = index_key(doc, field)
                && index.get(&key) == Some(&seq)
            {
                index.remove(&key);
            }
        }
    }

    fn apply_insert(&mut self, id: String, doc: Document) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index(seq, &doc);
        self.ids.insert(id, seq);
        self.docs.insert(seq, doc);
    }

    fn apply_replace(&mut self, seq: u64, doc: Document) {
        if let Some(old) = self.docs.remove(&seq) {
            self.unindex(seq, &old);
        }
        self.index(seq, &doc);
        self.docs.insert(seq, doc);
    }

    fn apply_remove(&mut self, id: &str) {
        if let Some(seq) = self.ids.remove(id)
            && let Some(old) = self.docs.remove(&seq)
        {
            self.unindex(seq, &old);
        }
    }

    fn first_match(&self, filter: &Filter) -> Option<(u64, &Document)> {
        self.docs
            .iter()
            .find(|(_, doc)| filter.matches(doc))
            .map(|(seq, doc)| (*seq, doc))
    }
}

/// In-process document store.
///
/// Each collection sits behind its own `RwLock`; unique indexes are checked and
/// updated under the same write guard as the mutation, so of two writers racing
/// for one key exactly one wins. With a WAL attached, every mutation is logged
/// through the group-commit writer before it is applied.
pub struct MemoryStore {
    collections: HashMap<Collection, RwLock<CollectionState>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl MemoryStore {
    /// Ephemeral store, nothing survives the process.
    pub fn new() -> Self {
        Self {
            collections: Collection::ALL
                .iter()
                .map(|c| (*c, RwLock::new(CollectionState::default())))
                .collect(),
            wal_tx: None,
        }
    }

    /// Durable store backed by the WAL at `path`, replaying it first.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let ops = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let mut store = Self::new();

        // Sole owner during replay: get_mut needs no locking.
        let replayed = ops.len();
        for op in ops {
            store.replay_op(op)?;
        }
        info!(path = %path.display(), replayed, "document store opened");

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        store.wal_tx = Some(wal_tx);
        Ok(store)
    }

    fn replay_op(&mut self, op: StoreOp) -> io::Result<()> {
        let invalid = |e: serde_json::Error| io::Error::new(io::ErrorKind::InvalidData, e);
        match op {
            StoreOp::Insert { collection, doc } => {
                let doc: Document = serde_json::from_str(&doc).map_err(invalid)?;
                let state = self.state_mut(collection);
                if let Ok(id) = doc_id(&doc)
                    && !state.ids.contains_key(&id)
                {
                    state.apply_insert(id, doc);
                }
            }
            StoreOp::Replace { collection, doc } => {
                let doc: Document = serde_json::from_str(&doc).map_err(invalid)?;
                let state = self.state_mut(collection);
                if let Ok(id) = doc_id(&doc)
                    && let Some(&seq) = state.ids.get(&id)
                {
                    state.apply_replace(seq, doc);
                }
            }
            StoreOp::Remove { collection, ids } => {
                let state = self.state_mut(collection);
                for id in &ids {
                    state.apply_remove(id);
                }
            }
        }
        Ok(())
    }

    fn state(&self, collection: Collection) -> &RwLock<CollectionState> {
        // Every variant is populated in `new`.
        &self.collections[&collection]
    }

    fn state_mut(&mut self, collection: Collection) -> &mut CollectionState {
        self.collections
            .entry(collection)
            .or_default()
            .get_mut()
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    async fn log(&self, op: StoreOp) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append { op, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Rewrite the WAL as one `Insert` per live document.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        // Hold every read guard while snapshotting so the snapshot is consistent
        // with the log position the writer is at when it receives the command.
        let mut guards = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            guards.push((collection, self.state(collection).read().await));
        }
        let mut ops = Vec::new();
        for (collection, state) in &guards {
            for doc in state.docs.values() {
                ops.push(StoreOp::Insert {
                    collection: *collection,
                    doc: doc.to_string(),
                });
            }
        }
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { ops, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        drop(guards);
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let state = self.state(collection).read().await;
        Ok(state
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect())
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let state = self.state(collection).read().await;
        Ok(state.first_match(filter).map(|(_, doc)| doc.clone()))
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<(), StoreError> {
        let id = doc_id(&doc)?;
        let mut state = self.state(collection).write().await;
        if state.ids.contains_key(&id) {
            return Err(StoreError::DuplicateKey {
                collection,
                field: "_id".into(),
                key: id,
            });
        }
        state.check_unique(collection, &doc, None)?;
        self.log(StoreOp::Insert {
            collection,
            doc: doc.to_string(),
        })
        .await?;
        debug!(%collection, %id, "insert");
        state.apply_insert(id, doc);
        Ok(())
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        doc: Document,
    ) -> Result<bool, StoreError> {
        let new_id = doc_id(&doc)?;
        let mut state = self.state(collection).write().await;
        let Some((seq, current)) = state.first_match(filter) else {
            return Ok(false);
        };
        if doc_id(current)? != new_id {
            return Err(StoreError::Codec(format!(
                "replacement for {collection} changes _id to {new_id}"
            )));
        }
        state.check_unique(collection, &doc, Some(seq))?;
        self.log(StoreOp::Replace {
            collection,
            doc: doc.to_string(),
        })
        .await?;
        debug!(%collection, id = %new_id, "replace");
        state.apply_replace(seq, doc);
        Ok(true)
    }

    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        let mut state = self.state(collection).write().await;
        let ids: Vec<String> = state
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .filter_map(|doc| doc_id(doc).ok())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.log(StoreOp::Remove {
            collection,
            ids: ids.clone(),
        })
        .await?;
        for id in &ids {
            state.apply_remove(id);
        }
        debug!(%collection, removed = ids.len(), "remove");
        Ok(ids.len() as u64)
    }

    async fn ensure_unique(&self, collection: Collection, field: &'static str) -> Result<(), StoreError> {
        let mut state = self.state(collection).write().await;
        if state.unique.contains_key(field) {
            return Ok(());
        }
        let mut index = HashMap::new();
        for (seq, doc) in &state.docs {
            if let Some(key) = index_key(doc, field)
                && index.insert(key.clone(), *seq).is_some()
            {
                return Err(StoreError::DuplicateKey {
                    collection,
                    field: field.to_string(),
                    key,
                });
            }
        }
        state.unique.insert(field, index);
        Ok(())
    }
}
