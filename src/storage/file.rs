//! Log structured file storage.
//!
//! Every change is appended to `nodes.log` as a checksummed record. A transaction buffers its
//! records in memory and writes them in one go at commit, terminated by a commit record.
//! Opening the storage replays the log and discards anything after the last valid commit
//! record, so a crash mid-commit leaves the previous state intact.
//!
//! ```text
//! record := header payload
//! header := checksum u32 | payload_len u32 | kind u8 | pad [u8; 7] | id i64
//! ```
//!
//! | kind   | id            | payload      |
//! |--------|---------------|--------------|
//! | node   | node id       | encoded node |
//! | free   | node id       | -            |
//! | root   | root id       | -            |
//! | commit | next node id  | -            |
//!
//! The checksum is the truncated xxh3 of everything after the checksum field. Node payloads are
//! `size u32 | is_leaf u8 | children i64 * (size + 1) | (key, value) * size`, with keys and values
//! encoded by their [Codec] implementation.

use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    hash::Hasher,
    io::{self, BufReader, Read},
    marker::PhantomData,
    mem::size_of,
    path::PathBuf,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{codec::Codec, NodeData, NodeId, StorageStrategy, NO_NODE};
use crate::{
    error::{io_invalid_data, io_other},
    options::StoredOptions,
    utils::{self, ByteSize, FileExt},
    Error, FileStorageOptions, HashMap, TreeLock,
};

const LOG_FILE_NAME: &str = "nodes.log";
const HEADER_SIZE: usize = size_of::<RecordHeader>();
const HEADER_BYTES_IGNORED_BY_CHECKSUM: usize = size_of::<u32>();

#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RecordHeader {
    checksum: u32,
    payload_len: u32,
    kind: u8,
    _pad: [u8; 7],
    id: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    Node = 1,
    Free = 2,
    Root = 3,
    Commit = 4,
}

impl RecordKind {
    fn from_u8(kind: u8) -> Option<Self> {
        Some(match kind {
            1 => Self::Node,
            2 => Self::Free,
            3 => Self::Root,
            4 => Self::Commit,
            _ => return None,
        })
    }
}

fn checksum(header: &RecordHeader, payload: &[u8]) -> u32 {
    let mut hasher = xxhash_rust::xxh3::Xxh3Default::new();
    hasher.write(&header.as_bytes()[HEADER_BYTES_IGNORED_BY_CHECKSUM..]);
    hasher.write(payload);
    hasher.finish() as u32
}

/// Location of a record, relative to the log file or to a transaction buffer.
#[derive(Debug, Copy, Clone)]
struct RecordPos {
    offset: u64,
    len: u32,
}

impl RecordPos {
    #[inline]
    fn payload<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        let start = self.offset as usize + HEADER_SIZE;
        &buf[start..start + self.len as usize]
    }
}

/// Turns the bytes after `buf[offset..offset + HEADER_SIZE]` into a record payload, filling
/// in the header.
fn finish_record(
    buf: &mut Vec<u8>,
    offset: usize,
    kind: RecordKind,
    id: NodeId,
) -> Result<RecordPos, Error> {
    let payload_len = buf.len() - offset - HEADER_SIZE;
    let Ok(len) = u32::try_from(payload_len) else {
        buf.truncate(offset);
        return Err(io_other!("Record for {id} is too large ({payload_len} bytes)"));
    };
    let mut header = RecordHeader {
        checksum: 0,
        payload_len: len,
        kind: kind as u8,
        _pad: [0; 7],
        id,
    };
    header.checksum = checksum(&header, &buf[offset + HEADER_SIZE..]);
    buf[offset..offset + HEADER_SIZE].copy_from_slice(header.as_bytes());
    Ok(RecordPos {
        offset: offset as u64,
        len,
    })
}

fn append_record(buf: &mut Vec<u8>, kind: RecordKind, id: NodeId) -> Result<RecordPos, Error> {
    let offset = buf.len();
    buf.resize(offset + HEADER_SIZE, 0);
    finish_record(buf, offset, kind, id)
}

fn verify_record(record: &[u8], id: NodeId) -> Result<(), Error> {
    let (header, payload) = RecordHeader::read_from_prefix(record)
        .map_err(|_| io_invalid_data!("Truncated record for node {id}"))?;
    if header.id != id || header.kind != RecordKind::Node as u8 {
        return Err(io_invalid_data!(
            "Record mismatch, expected node {id} found kind {} id {}",
            header.kind,
            header.id
        ));
    }
    if checksum(&header, payload) != header.checksum {
        return Err(io_invalid_data!("Checksum mismatch for node {id}"));
    }
    Ok(())
}

fn encode_node<K: Codec, V: Codec>(data: &NodeData<K, V>, buf: &mut Vec<u8>) {
    (data.size as u32).encode(buf);
    data.is_leaf().encode(buf);
    for child in data.children.iter().flatten() {
        child.encode(buf);
    }
    for (k, v) in &data.entries {
        k.encode(buf);
        v.encode(buf);
    }
}

fn decode_node<K: Codec, V: Codec>(
    mut input: &[u8],
    data: &mut NodeData<K, V>,
    max_node_size: usize,
    with_entries: bool,
) -> Result<(), Error> {
    data.clear();
    let size = u32::decode(&mut input)? as usize;
    if size > max_node_size {
        return Err(io_invalid_data!("Node size {size} exceeds {max_node_size}"));
    }
    data.size = size;
    if !bool::decode(&mut input)? {
        let mut children = Vec::with_capacity(size + 1);
        for _ in 0..=size {
            children.push(NodeId::decode(&mut input)?);
        }
        data.children = Some(children);
    }
    if with_entries {
        data.entries.reserve(size);
        for _ in 0..size {
            let key = K::decode(&mut input)?;
            let value = V::decode(&mut input)?;
            data.entries.push((key, value));
        }
        if !input.is_empty() {
            return Err(io_invalid_data!("{} trailing bytes in node", input.len()));
        }
    }
    Ok(())
}

/// A [StorageStrategy] backed by an append-only log file.
///
/// The storage directory holds the `OPTIONS` file, a `LOCK` file preventing concurrent use by
/// other handles and the `nodes.log` file. The log only grows (except by [StorageStrategy::clear]),
/// use [FileStorage::compact] to reclaim the space of superseded records.
pub struct FileStorage<K, V> {
    options: FileStorageOptions,
    lock: TreeLock,
    state: RwLock<LogState>,
    _lock_file: fslock::LockFile,
    _marker: PhantomData<fn() -> (K, V)>,
}

struct LogState {
    file: File,
    /// Committed log length
    end: u64,
    index: HashMap<NodeId, RecordPos>,
    root_id: NodeId,
    next_id: NodeId,
    free_ids: BTreeSet<NodeId>,
    txn: Option<LogTxn>,
}

#[derive(Default)]
struct LogTxn {
    buf: Vec<u8>,
    /// Positions within `buf`, `None` marks a freed node
    staged: HashMap<NodeId, Option<RecordPos>>,
    root_id: Option<NodeId>,
    cleared: bool,
    freed: Vec<NodeId>,
    // allocator rollback
    next_id: NodeId,
    taken_free_ids: Vec<NodeId>,
    free_ids_before_clear: Option<BTreeSet<NodeId>>,
}

impl LogTxn {
    fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.root_id.is_none() && !self.cleared
    }
}

impl LogState {
    fn txn_mut(&mut self) -> Result<&mut LogTxn, Error> {
        self.txn
            .as_mut()
            .ok_or_else(|| Error::illegal_state("Storage write outside of a transaction"))
    }

    fn rollback_allocator(&mut self, txn: LogTxn) {
        if let Some(free_ids) = txn.free_ids_before_clear {
            self.free_ids = free_ids;
        }
        self.free_ids.extend(txn.taken_free_ids);
        self.next_id = txn.next_id;
    }
}

impl<K, V> std::fmt::Debug for FileStorage<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("FileStorage")
            .field("path", &self.options.path)
            .field("log_size", &ByteSize(state.end))
            .field("nodes", &state.index.len())
            .field("root_id", &state.root_id)
            .finish()
    }
}

impl<K, V> FileStorage<K, V> {
    /// Opens the storage at the options path, creating it if needed.
    ///
    /// Fails with [Error::StorageLocked] if another handle holds the directory for longer than
    /// [FileStorageOptions::file_lock_timeout].
    pub fn open(options: FileStorageOptions) -> Result<Self, Error> {
        options.validate()?;
        fs::create_dir_all(&options.path)?;
        let mut lock_file = fslock::LockFile::open(&options.path.join("LOCK"))?;
        let start = Instant::now();
        while !lock_file.try_lock()? {
            if start.elapsed() < options.file_lock_timeout {
                std::thread::sleep(Duration::from_millis(100));
            } else {
                return Err(Error::StorageLocked);
            }
        }
        let stored = options.stored();
        match StoredOptions::read_from_folder(&options.path)? {
            Some(existing) => stored.validate_existing(&existing)?,
            None => {
                stored.write_to_folder(&options.path)?;
            }
        }
        let state = Self::recover(&options)?;
        debug!(
            "Opened {:?} log {} nodes {} root {}",
            options.path,
            ByteSize(state.end),
            state.index.len(),
            state.root_id
        );
        Ok(Self {
            options,
            lock: TreeLock::new(),
            state: RwLock::new(state),
            _lock_file: lock_file,
            _marker: PhantomData,
        })
    }

    fn log_path(&self) -> PathBuf {
        self.options.path.join(LOG_FILE_NAME)
    }

    fn open_log(path: &std::path::Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    /// Replays the log up to the last valid commit record.
    fn recover(options: &FileStorageOptions) -> Result<LogState, Error> {
        let path = options.path.join(LOG_FILE_NAME);
        let file = Self::open_log(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(&file);
        let mut state = LogState {
            file: file.try_clone()?,
            end: 0,
            index: Default::default(),
            root_id: NO_NODE,
            next_id: 0,
            free_ids: Default::default(),
            txn: None,
        };
        let mut pending = Vec::new();
        let mut payload = Vec::new();
        let mut offset = 0u64;
        let mut commits = 0u64;
        loop {
            let mut header = RecordHeader::default();
            match reader.read_exact(header.as_mut_bytes()) {
                Ok(()) => (),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let record_len = (HEADER_SIZE + header.payload_len as usize) as u64;
            if offset + record_len > file_len {
                break;
            }
            payload.resize(header.payload_len as usize, 0);
            reader.read_exact(&mut payload)?;
            if checksum(&header, &payload) != header.checksum {
                warn!("Checksum mismatch in {path:?} at offset {offset}");
                break;
            }
            let pos = RecordPos {
                offset,
                len: header.payload_len,
            };
            offset += record_len;
            match RecordKind::from_u8(header.kind) {
                Some(RecordKind::Commit) => {
                    for (kind, id, pos) in pending.drain(..) {
                        match kind {
                            RecordKind::Node => {
                                state.index.insert(id, pos);
                                state.free_ids.remove(&id);
                            }
                            RecordKind::Free => {
                                state.index.remove(&id);
                                state.free_ids.insert(id);
                            }
                            RecordKind::Root => state.root_id = id,
                            RecordKind::Commit => unreachable!(),
                        }
                    }
                    state.next_id = header.id;
                    state.end = offset;
                    commits += 1;
                }
                Some(kind) => pending.push((kind, header.id, pos)),
                None => {
                    warn!("Unknown record kind {} in {path:?}", header.kind);
                    break;
                }
            }
        }
        drop(reader);
        if state.end < file_len {
            warn!(
                "Discarding {} of uncommitted or corrupt records at the end of {path:?}",
                ByteSize(file_len - state.end)
            );
            file.set_len(state.end)?;
            if !options.disable_fsync {
                utils::sync_data(&file)?;
            }
        }
        trace!("Replayed {commits} commits from {path:?}");
        Ok(state)
    }

    /// Atomically replaces the log with `contents`.
    fn rewrite_log(&self, contents: &[u8]) -> Result<File, Error> {
        let path = self.log_path();
        let file = utils::atomic_file_write(&path, contents)?;
        // the new log is in place at this point, it must be used from now on
        if !self.options.disable_fsync {
            if let Err(e) = utils::sync_dir(&self.options.path) {
                error!("Failed to sync directory {:?}: {e}", self.options.path);
            }
        }
        Ok(file)
    }

    /// Bytes of committed log.
    pub fn log_size(&self) -> u64 {
        self.state.read().end
    }

    /// Rewrites the log keeping only the live records.
    ///
    /// Takes the [TreeLock] in exclusive mode, so it can be called while a tree is using the
    /// storage.
    pub fn compact(&self) -> Result<(), Error> {
        let _guard = self.lock.write()?;
        let mut state = self.state.write();
        if state.txn.is_some() {
            return Err(Error::illegal_state("Compaction during a transaction"));
        }
        let mut ids: Vec<NodeId> = state.index.keys().copied().collect();
        ids.sort_unstable();
        let mut buf = Vec::new();
        let mut index = HashMap::default();
        for id in ids {
            let pos = state.index[&id];
            let offset = buf.len();
            buf.resize(offset + HEADER_SIZE + pos.len as usize, 0);
            state.file.read_exact_at(&mut buf[offset..], pos.offset)?;
            verify_record(&buf[offset..], id)?;
            index.insert(
                id,
                RecordPos {
                    offset: offset as u64,
                    len: pos.len,
                },
            );
        }
        for &id in &state.free_ids {
            append_record(&mut buf, RecordKind::Free, id)?;
        }
        append_record(&mut buf, RecordKind::Root, state.root_id)?;
        append_record(&mut buf, RecordKind::Commit, state.next_id)?;

        let before = state.end;
        state.file = self.rewrite_log(&buf)?;
        state.index = index;
        state.end = buf.len() as u64;
        debug!(
            "Compacted {:?} from {} to {}",
            self.options.path,
            ByteSize(before),
            ByteSize(state.end)
        );
        Ok(())
    }

    /// Reads a node payload, staged writes of the current transaction first.
    fn with_payload<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&[u8]) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let state = self.state.read();
        if let Some(txn) = &state.txn {
            match txn.staged.get(&id) {
                Some(Some(pos)) => return f(pos.payload(&txn.buf)),
                Some(None) => return Err(io_invalid_data!("Node {id} not found")),
                None if txn.cleared => return Err(io_invalid_data!("Node {id} not found")),
                None => (),
            }
        }
        let pos = *state
            .index
            .get(&id)
            .ok_or_else(|| io_invalid_data!("Node {id} not found"))?;
        let mut record = vec![0u8; HEADER_SIZE + pos.len as usize];
        state.file.read_exact_at(&mut record, pos.offset)?;
        drop(state);
        if self.options.use_checksums {
            verify_record(&record, id)?;
        }
        f(&record[HEADER_SIZE..])
    }

    fn alloc(&self) -> Result<NodeId, Error> {
        let mut state = self.state.write();
        let LogState {
            txn,
            free_ids,
            next_id,
            ..
        } = &mut *state;
        let txn = txn
            .as_mut()
            .ok_or_else(|| Error::illegal_state("Storage write outside of a transaction"))?;
        if let Some(id) = free_ids.pop_first() {
            txn.taken_free_ids.push(id);
            return Ok(id);
        }
        *next_id += 1;
        Ok(*next_id - 1)
    }

    /// Terminates the transaction records with a commit record and writes them out.
    /// Returns the log offset of the first record.
    fn write_commit(
        &self,
        state: &mut LogState,
        txn: &LogTxn,
        buf: &mut Vec<u8>,
    ) -> Result<u64, Error> {
        if let Some(root_id) = txn.root_id {
            append_record(buf, RecordKind::Root, root_id)?;
        }
        append_record(buf, RecordKind::Commit, state.next_id)?;
        if txn.cleared {
            state.file = self.rewrite_log(buf)?;
            Ok(0)
        } else {
            self.append_to_log(state, buf)?;
            Ok(state.end)
        }
    }

    fn append_to_log(&self, state: &LogState, buf: &[u8]) -> Result<(), Error> {
        let result = state.file.write_all_at(buf, state.end).and_then(|_| {
            if self.options.disable_fsync {
                Ok(())
            } else {
                utils::sync_data(&state.file)
            }
        });
        if let Err(e) = result {
            if let Err(te) = state.file.set_len(state.end) {
                error!("Error truncating log after failed append: {te}");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

impl<K, V> StorageStrategy<K, V> for FileStorage<K, V>
where
    K: Codec + Send + Sync,
    V: Codec + Send + Sync,
{
    fn max_node_size(&self) -> usize {
        self.options.max_node_size
    }

    fn load_root_node_id(&self) -> Result<NodeId, Error> {
        let state = self.state.read();
        Ok(state
            .txn
            .as_ref()
            .and_then(|txn| txn.root_id)
            .unwrap_or(state.root_id))
    }

    fn save_root_node_id(&self, id: NodeId) -> Result<(), Error> {
        self.state.write().txn_mut()?.root_id = Some(id);
        Ok(())
    }

    fn load_node(&self, id: NodeId, data: &mut NodeData<K, V>) -> Result<(), Error> {
        let max_node_size = self.options.max_node_size;
        self.with_payload(id, |payload| decode_node(payload, data, max_node_size, true))
    }

    fn load_node_except_entries(
        &self,
        id: NodeId,
        data: &mut NodeData<K, V>,
    ) -> Result<(), Error> {
        let max_node_size = self.options.max_node_size;
        self.with_payload(id, |payload| decode_node(payload, data, max_node_size, false))
    }

    fn save_node(&self, id: NodeId, data: &NodeData<K, V>) -> Result<(), Error> {
        debug_assert_eq!(data.size, data.entries.len());
        let mut state = self.state.write();
        let txn = state.txn_mut()?;
        let offset = txn.buf.len();
        txn.buf.resize(offset + HEADER_SIZE, 0);
        encode_node(data, &mut txn.buf);
        let pos = finish_record(&mut txn.buf, offset, RecordKind::Node, id)?;
        txn.staged.insert(id, Some(pos));
        Ok(())
    }

    fn alloc_leaf_node(&self) -> Result<NodeId, Error> {
        self.alloc()
    }

    fn alloc_non_leaf_node(&self) -> Result<NodeId, Error> {
        self.alloc()
    }

    fn free_node(&self, id: NodeId) -> Result<(), Error> {
        let mut state = self.state.write();
        let txn = state.txn_mut()?;
        append_record(&mut txn.buf, RecordKind::Free, id)?;
        txn.staged.insert(id, None);
        txn.freed.push(id);
        Ok(())
    }

    fn clear(&self) -> Result<bool, Error> {
        let mut state = self.state.write();
        let LogState {
            txn,
            free_ids,
            next_id,
            ..
        } = &mut *state;
        let txn = txn
            .as_mut()
            .ok_or_else(|| Error::illegal_state("Storage write outside of a transaction"))?;
        txn.buf.clear();
        txn.staged.clear();
        txn.freed.clear();
        txn.cleared = true;
        txn.root_id = Some(NO_NODE);
        let free_ids = std::mem::take(free_ids);
        txn.free_ids_before_clear.get_or_insert(free_ids);
        *next_id = 0;
        Ok(true)
    }

    fn lock(&self) -> &TreeLock {
        &self.lock
    }

    fn begin(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        if state.txn.is_some() {
            return Err(Error::illegal_state("Transaction already in progress"));
        }
        state.txn = Some(LogTxn {
            next_id: state.next_id,
            ..Default::default()
        });
        Ok(())
    }

    fn commit(&self) -> Result<bool, Error> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(mut txn) = state.txn.take() else {
            return Err(Error::illegal_state("Commit without a transaction"));
        };
        if txn.is_empty() {
            return Ok(false);
        }
        let mut buf = std::mem::take(&mut txn.buf);
        let appended = self.write_commit(state, &txn, &mut buf);
        let base = match appended {
            Ok(base) => base,
            Err(e) => {
                error!("Error committing to {:?}: {e}", self.options.path);
                state.rollback_allocator(txn);
                return Err(e);
            }
        };
        if txn.cleared {
            state.index.clear();
        }
        for (id, pos) in txn.staged {
            match pos {
                Some(pos) => {
                    state.index.insert(
                        id,
                        RecordPos {
                            offset: base + pos.offset,
                            len: pos.len,
                        },
                    );
                }
                None => {
                    state.index.remove(&id);
                }
            }
        }
        state.free_ids.extend(txn.freed);
        if let Some(root_id) = txn.root_id {
            state.root_id = root_id;
        }
        state.end = base + buf.len() as u64;
        Ok(true)
    }

    fn abort(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        if let Some(txn) = state.txn.take() {
            state.rollback_allocator(txn);
        }
        Ok(())
    }

    fn force(&self) -> Result<bool, Error> {
        if self.options.disable_fsync {
            return Ok(false);
        }
        utils::sync_data(&self.state.read().file)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BTree;
    use std::io::Write;

    fn test_folder() -> tempfile::TempDir {
        if let Ok(p) = std::env::var("TEST_DATA_FOLDER") {
            let _ = std::fs::create_dir_all(&p);
            tempfile::tempdir_in(&p).unwrap()
        } else {
            tempfile::tempdir().unwrap()
        }
    }

    fn options(path: &std::path::Path) -> FileStorageOptions {
        let mut options = FileStorageOptions::new(path);
        options.max_node_size = 4;
        options.disable_fsync = true;
        options.use_checksums = true;
        options
    }

    fn open(path: &std::path::Path) -> BTree<u64, String, FileStorage<u64, String>> {
        BTree::open(FileStorage::open(options(path)).unwrap()).unwrap()
    }

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_SIZE, 24);
    }

    #[test]
    fn reopen_preserves_contents() {
        let _ = env_logger::try_init();
        let f = test_folder();
        {
            let tree = open(f.path());
            for k in 0..100u64 {
                tree.insert(k, format!("v{k}")).unwrap();
            }
            for k in (0..100u64).step_by(3) {
                tree.remove(&k).unwrap();
            }
        }
        let tree = open(f.path());
        assert_eq!(tree.len().unwrap(), 66);
        assert_eq!(tree.get(&4).unwrap().as_deref(), Some("v4"));
        assert_eq!(tree.get(&3).unwrap(), None);
        tree.verify().unwrap();
        tree.insert(3, "again".into()).unwrap();
        assert_eq!(tree.get(&3).unwrap().as_deref(), Some("again"));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let _ = env_logger::try_init();
        let f = test_folder();
        let committed_size;
        {
            let tree = open(f.path());
            for k in 0..20u64 {
                tree.insert(k, k.to_string()).unwrap();
            }
            committed_size = tree.storage().log_size();

            // records of a transaction that never got its commit record
            let mut buf = Vec::new();
            let offset = buf.len();
            buf.resize(HEADER_SIZE, 0);
            encode_node(
                &NodeData {
                    size: 1,
                    entries: vec![(1000u64, String::from("lost"))],
                    children: None,
                },
                &mut buf,
            );
            finish_record(&mut buf, offset, RecordKind::Node, 0).unwrap();
            append_record(&mut buf, RecordKind::Root, 0).unwrap();
            let mut file = OpenOptions::new()
                .append(true)
                .open(f.path().join(LOG_FILE_NAME))
                .unwrap();
            file.write_all(&buf).unwrap();
            // and half of another header
            file.write_all(&[0xAB; HEADER_SIZE / 2]).unwrap();
        }
        let tree = open(f.path());
        assert_eq!(tree.storage().log_size(), committed_size);
        assert_eq!(
            fs::metadata(f.path().join(LOG_FILE_NAME)).unwrap().len(),
            committed_size
        );
        assert_eq!(tree.len().unwrap(), 20);
        assert_eq!(tree.get(&1000).unwrap(), None);
        tree.verify().unwrap();
    }

    #[test]
    fn corrupt_record_fails_checksum() {
        let f = test_folder();
        let tree = open(f.path());
        tree.insert(1, "one".into()).unwrap();
        let pos = *tree.storage().state.read().index.values().next().unwrap();
        let file = OpenOptions::new()
            .write(true)
            .open(f.path().join(LOG_FILE_NAME))
            .unwrap();
        file.write_all_at(b"X", pos.offset + HEADER_SIZE as u64 + 6).unwrap();
        let mut data = NodeData::default();
        let err = tree.storage().load_node(0, &mut data).unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::InvalidData));
    }

    #[test]
    fn compaction_keeps_live_records() {
        let _ = env_logger::try_init();
        let f = test_folder();
        {
            let tree = open(f.path());
            for round in 0..5u64 {
                for k in 0..50u64 {
                    tree.insert(k, format!("{round}-{k}")).unwrap();
                }
            }
            for k in 0..10u64 {
                tree.remove(&k).unwrap();
            }
            let before = tree.storage().log_size();
            tree.storage().compact().unwrap();
            assert!(tree.storage().log_size() < before);
            assert_eq!(tree.get(&20).unwrap().as_deref(), Some("4-20"));
            tree.insert(100, "after".into()).unwrap();
            tree.verify().unwrap();
        }
        let tree = open(f.path());
        assert_eq!(tree.len().unwrap(), 41);
        assert_eq!(tree.get(&100).unwrap().as_deref(), Some("after"));
        assert_eq!(tree.first_key().unwrap(), Some(10));
        tree.verify().unwrap();
    }

    #[test]
    fn clear_truncates_the_log() {
        let f = test_folder();
        {
            let tree = open(f.path());
            for k in 0..50u64 {
                tree.insert(k, k.to_string()).unwrap();
            }
            let before = tree.storage().log_size();
            tree.clear().unwrap();
            assert!(tree.storage().log_size() < before);
            assert!(tree.is_empty().unwrap());
            tree.insert(7, "seven".into()).unwrap();
        }
        let tree = open(f.path());
        assert_eq!(tree.len().unwrap(), 1);
        assert_eq!(tree.get(&7).unwrap().as_deref(), Some("seven"));
    }

    #[test]
    fn aborted_transaction_leaves_no_trace() {
        let f = test_folder();
        let storage = FileStorage::<u64, u64>::open(options(f.path())).unwrap();
        storage.begin().unwrap();
        let id = storage.alloc_leaf_node().unwrap();
        storage
            .save_node(
                id,
                &NodeData {
                    size: 1,
                    entries: vec![(1, 1)],
                    children: None,
                },
            )
            .unwrap();
        storage.save_root_node_id(id).unwrap();
        let mut data = NodeData::default();
        storage.load_node(id, &mut data).unwrap();
        assert_eq!(data.entries, vec![(1, 1)]);
        storage.abort().unwrap();

        assert_eq!(storage.load_root_node_id().unwrap(), NO_NODE);
        assert_eq!(storage.log_size(), 0);
        storage.begin().unwrap();
        assert_eq!(storage.alloc_non_leaf_node().unwrap(), id);
        assert!(!storage.commit().unwrap());
    }

    #[test]
    fn options_are_checked_and_dir_is_locked() {
        let f = test_folder();
        let storage = FileStorage::<u64, u64>::open(options(f.path())).unwrap();

        let mut locked = options(f.path());
        locked.file_lock_timeout = Duration::from_millis(10);
        assert!(matches!(FileStorage::<u64, u64>::open(locked), Err(Error::StorageLocked)));
        drop(storage);

        let mut other = options(f.path());
        other.max_node_size = 8;
        assert!(matches!(FileStorage::<u64, u64>::open(other), Err(Error::Validation(_))));
        FileStorage::<u64, u64>::open(options(f.path())).unwrap();
    }

    #[test]
    fn metadata_loads_skip_entries() {
        let f = test_folder();
        let storage = FileStorage::<u64, String>::open(options(f.path())).unwrap();
        storage.begin().unwrap();
        let id = storage.alloc_non_leaf_node().unwrap();
        let node = NodeData {
            size: 2,
            entries: vec![(1, "a".to_string()), (2, "b".to_string())],
            children: Some(vec![10, 11, 12]),
        };
        storage.save_node(id, &node).unwrap();
        assert!(storage.commit().unwrap());

        let mut data = NodeData::default();
        storage.load_node_except_entries(id, &mut data).unwrap();
        assert_eq!(data.size, 2);
        assert!(data.entries.is_empty());
        assert_eq!(data.children, node.children);
        storage.load_node(id, &mut data).unwrap();
        assert_eq!(data, node);
        assert!(storage.force().is_ok());
    }

    fn allocator_state(storage: &FileStorage<u64, String>) -> (NodeId, BTreeSet<NodeId>) {
        let state = storage.state.read();
        assert!(state.txn.is_none());
        (state.next_id, state.free_ids.clone())
    }

    #[test]
    fn failed_commits_leave_no_trace() {
        let _ = env_logger::try_init();
        let f = test_folder();
        let mut model = std::collections::BTreeMap::new();
        {
            let mut opts = options(f.path());
            opts.disable_fsync = false;
            let tree = BTree::open(FileStorage::<u64, String>::open(opts).unwrap()).unwrap();
            for k in 0..40u64 {
                tree.insert(k, k.to_string()).unwrap();
                model.insert(k, k.to_string());
            }
            for k in 0..8u64 {
                tree.remove(&k).unwrap();
                model.remove(&k);
            }
            let log_path = f.path().join(LOG_FILE_NAME);

            let failpoints = utils::ArmedFailpoints::arm();
            for failpoint in ["fwrite", "fsync"] {
                fail::cfg(failpoint, "return").unwrap();
                let log_size = tree.storage().log_size();
                let dump = tree.dump().unwrap();
                let allocator = allocator_state(tree.storage());

                for k in [100u64, 101, 102, 103, 104] {
                    assert!(tree.insert(k, "new".into()).is_err());
                }
                assert!(tree.insert(20, "updated".into()).is_err());
                assert!(tree.remove(&30).is_err());
                assert!(tree.clear_range(10..20).is_err());
                assert!(tree.clear().is_err());

                assert_eq!(tree.dump().unwrap(), dump);
                assert_eq!(tree.len().unwrap(), model.len() as u64);
                assert_eq!(tree.get(&20).unwrap().as_deref(), Some("20"));
                assert_eq!(tree.storage().log_size(), log_size);
                assert_eq!(fs::metadata(&log_path).unwrap().len(), log_size);
                assert_eq!(allocator_state(tree.storage()), allocator);

                // ids handed out by a failed commit are handed out again
                let storage = tree.storage();
                let _guard = tree.lock().write().unwrap();
                let leaf = NodeData {
                    size: 1,
                    entries: vec![(1, "a".to_string())],
                    children: None,
                };
                storage.begin().unwrap();
                let first = storage.alloc_leaf_node().unwrap();
                let second = storage.alloc_leaf_node().unwrap();
                storage.save_node(first, &leaf).unwrap();
                storage.save_node(second, &leaf).unwrap();
                assert!(storage.commit().is_err());
                assert_eq!(allocator_state(storage), allocator);
                storage.begin().unwrap();
                assert_eq!(storage.alloc_leaf_node().unwrap(), first);
                assert_eq!(storage.alloc_leaf_node().unwrap(), second);
                storage.abort().unwrap();
                assert_eq!(allocator_state(storage), allocator);

                fail::cfg(failpoint, "off").unwrap();
            }
            drop(failpoints);

            tree.insert(100, "new".into()).unwrap();
            model.insert(100, "new".into());
            tree.remove(&30).unwrap();
            model.remove(&30);
            tree.verify().unwrap();
        }
        let tree = open(f.path());
        tree.verify().unwrap();
        let mut entries = Vec::new();
        tree.copy_entries_into(&mut entries).unwrap();
        assert_eq!(entries, model.into_iter().collect::<Vec<_>>());
    }
}
