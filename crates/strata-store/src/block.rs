//! Block storage engine.
//!
//! Values are split into chunks of `block_size` bytes. Each chunk is stored
//! once under `block/<hash>`, and `node/<key>` records the ordered hash list
//! needed to reassemble the value.
//!
//! Block files never need per-file locking: the file name is the hash of the
//! contents, so two writers racing on the same block publish identical bytes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rayon::ThreadPool;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::compress::Compressor;
use crate::config::BlockConfig;
use crate::error::{IoResultExt, Result, StoreError};
use crate::hash::HashEncoderPool;
use crate::lock::{OpGuard, StoreLock};
use crate::node::{is_invalid_node, Node};
use crate::path::StorePaths;
use crate::pool::BufferPool;

/// Suffix of block files that are still being written
pub const TEMP_SUFFIX: &str = ".tmp";

/// Temporaries younger than this may still belong to a running write and
/// are left alone by [`BlockStorage::clean`].
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(15 * 60);

/// Outcome of a successful [`BlockStorage::clean`] run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanStats {
    /// Node files examined
    pub nodes: u64,
    /// Blocks referenced by at least one node
    pub live_blocks: u64,
    /// Unreferenced blocks deleted
    pub removed_blocks: u64,
    /// Stale temporary block files deleted
    pub removed_temp: u64,
}

/// Statistics about the store contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of stored keys
    pub node_count: u64,
    /// Number of unique blocks
    pub block_count: u64,
    /// Bytes used by block files (after compression)
    pub block_bytes: u64,
}

/// Chunked, content-addressed storage rooted at one directory.
pub struct BlockStorage {
    paths: StorePaths,
    config: BlockConfig,
    compressor: Arc<dyn Compressor>,
    hashers: HashEncoderPool,
    buffers: BufferPool,
    writers: ThreadPool,
    lock: StoreLock,
    tmp_counter: AtomicU64,
}

impl fmt::Debug for BlockStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStorage")
            .field("root", &self.paths.root())
            .field("config", &self.config)
            .field("compressor", &self.compressor.name())
            .finish_non_exhaustive()
    }
}

impl BlockStorage {
    /// Open a store at `root` with the compressor named in `config`.
    ///
    /// The directory is created if it doesn't exist.
    pub fn open(root: impl AsRef<Path>, config: BlockConfig) -> Result<Self> {
        let compressor = config.compression.compressor();
        Self::open_with_compressor(root, config, compressor)
    }

    /// Open a store using a caller-supplied compressor.
    pub fn open_with_compressor(
        root: impl AsRef<Path>,
        config: BlockConfig,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let config = config.normalized();

        match fs::metadata(root) {
            Ok(meta) if !meta.is_dir() => {
                return Err(StoreError::PathIsFile {
                    path: root.to_path_buf(),
                })
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(root).at(root)?,
            Err(e) => return Err(StoreError::from_io(e, root)),
        }

        let paths = StorePaths::new(root);
        let lock = StoreLock::open(paths.lock_file())?;
        check_compression(paths.compression_file(), compressor.name())?;

        let threads = config.threads();
        let writers = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("strata-block-{}", i))
            .build()?;

        info!(
            root = %root.display(),
            block_size = config.block_size,
            compression = compressor.name(),
            threads,
            "block storage opened"
        );

        Ok(Self {
            hashers: HashEncoderPool::new(threads + 1),
            buffers: BufferPool::new(config.block_size, config.inflight_blocks()),
            writers,
            lock,
            paths,
            config,
            compressor,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }

    // ========================================================================
    // Write
    // ========================================================================

    /// Store `value` under `key`.
    pub fn write_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_stream(key, value)
    }

    /// Chunk `reader` into blocks and store the value under `key`.
    ///
    /// Missing blocks are written concurrently; the node file is only created
    /// once every block write succeeded, so a failed write leaves the key
    /// absent.
    #[instrument(skip(self, reader), level = "debug")]
    pub fn write_stream(&self, key: &str, mut reader: impl Read) -> Result<()> {
        let npath = self.paths.node_path(key)?;
        let _guard = self.lock.enter()?;

        // Checked again with O_EXCL when the node is created, since callers
        // may not serialize writers of the same key.
        if !self.config.overwrite && npath.try_exists().at(&npath)? {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }

        fs::create_dir_all(self.paths.node_dir()).at(self.paths.node_dir())?;
        fs::create_dir_all(self.paths.block_dir()).at(self.paths.block_dir())?;

        let node = self.write_blocks(&npath, &mut reader)?;
        if node.is_empty() {
            return Err(StoreError::NoDataWritten {
                key: key.to_string(),
            });
        }

        self.write_node(key, &npath, &node)?;
        debug!(key, blocks = node.hashes.len(), "value stored");
        Ok(())
    }

    /// Read, hash and persist every chunk of `reader`, returning the node.
    fn write_blocks(&self, npath: &Path, reader: &mut dyn Read) -> Result<Node> {
        let mut node = Node::default();
        let mut scheduled: HashSet<String> = HashSet::new();
        let first_err: OnceLock<StoreError> = OnceLock::new();
        let failed = &first_err;
        let mut encoder = self.hashers.acquire();
        let mut dedup_hits = 0usize;

        let read_result = self.writers.in_place_scope(|scope| -> Result<()> {
            while failed.get().is_none() {
                let mut buf = self.buffers.get();
                let n = read_full(reader, &mut buf).map_err(|e| StoreError::from_io(e, npath))?;
                if n == 0 {
                    break;
                }
                let at_eof = n < buf.len();

                // Order is fixed here, not when the block write completes
                let sum = encoder.encode_sum(&buf[..n]);
                node.hashes.push(sum.clone());

                if scheduled.contains(&sum) || self.has_block(&sum)? {
                    dedup_hits += 1;
                } else {
                    scheduled.insert(sum.clone());
                    scope.spawn(move |_| {
                        if let Err(e) = self.write_block(&sum, &buf[..n]) {
                            let _ = failed.set(e);
                        }
                    });
                }

                if at_eof {
                    break;
                }
            }
            Ok(())
        });
        self.hashers.release(encoder);

        if let Some(e) = first_err.into_inner() {
            return Err(e);
        }
        read_result?;

        debug!(
            blocks = node.hashes.len(),
            written = scheduled.len(),
            dedup_hits,
            "chunks processed"
        );
        Ok(node)
    }

    /// Publish one block: write a unique temporary file, then rename it into
    /// place. Losing the race to another writer of the same hash is success.
    fn write_block(&self, hash: &str, data: &[u8]) -> Result<()> {
        let bpath = self.paths.block_path(hash);
        let tmp = self.temp_path(hash);

        let result = self
            .write_block_file(&tmp, data)
            .and_then(|()| fs::rename(&tmp, &bpath).at(&bpath));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            if bpath.exists() {
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    fn write_block_file(&self, tmp: &Path, data: &[u8]) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp)
            .at(tmp)?;
        let mut writer = self.compressor.writer(file).at(tmp)?;
        writer.write_all(data).at(tmp)?;
        let file = writer.finish().at(tmp)?;
        if self.config.sync_writes {
            file.sync_all().at(tmp)?;
        }
        Ok(())
    }

    fn write_node(&self, key: &str, npath: &Path, node: &Node) -> Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true);
        if self.config.overwrite {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }

        let file = match opts.open(npath) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(StoreError::from_io(e, npath)),
        };

        if let Err(e) = self.fill_node(file, node, npath) {
            let _ = fs::remove_file(npath);
            return Err(e);
        }
        Ok(())
    }

    fn fill_node(&self, file: File, node: &Node, npath: &Path) -> Result<()> {
        let mut writer = BufWriter::with_capacity(self.config.write_buf_size, file);
        node.encode_to(&mut writer).at(npath)?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::from_io(e.into_error(), npath))?;
        if self.config.sync_writes {
            file.sync_all().at(npath)?;
        }
        Ok(())
    }

    fn has_block(&self, hash: &str) -> Result<bool> {
        let bpath = self.paths.block_path(hash);
        bpath.try_exists().at(&bpath)
    }

    fn temp_path(&self, hash: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.paths.block_dir().join(format!(
            "{}.{}.{}{}",
            hash,
            std::process::id(),
            n,
            TEMP_SUFFIX
        ))
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// Read the whole value stored under `key`.
    pub fn read_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.read_stream(key)?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .map_err(|e| StoreError::from_io(e, self.paths.node_dir().join(key)))?;
        Ok(out)
    }

    /// Open a streaming reader over the value stored under `key`.
    ///
    /// Blocks are loaded lazily; a missing or damaged block surfaces as a
    /// [`StoreError::CorruptNode`] from `read`, not from this call.
    #[instrument(skip(self), level = "debug")]
    pub fn read_stream(&self, key: &str) -> Result<BlockReader<'_>> {
        let npath = self.paths.node_path(key)?;
        let guard = self.lock.enter()?;
        let node = self.read_node(key, &npath)?;

        Ok(BlockReader {
            storage: self,
            key: key.to_string(),
            hashes: node.hashes.into(),
            buf: Vec::new(),
            pos: 0,
            _guard: guard,
        })
    }

    fn read_node(&self, key: &str, npath: &Path) -> Result<Node> {
        let file = match File::open(npath) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(StoreError::from_io(e, npath)),
        };

        let reader = BufReader::with_capacity(self.config.read_buf_size, file);
        let node = Node::decode(reader).map_err(|e| {
            if is_invalid_node(&e) {
                corrupt(key, e.to_string())
            } else {
                StoreError::from_io(e, npath)
            }
        })?;

        if node.is_empty() {
            return Err(corrupt(key, "node lists no blocks"));
        }
        Ok(node)
    }

    fn read_block(&self, key: &str, hash: &str) -> Result<Vec<u8>> {
        let bpath = self.paths.block_path(hash);
        let file = match File::open(&bpath) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(corrupt(key, format!("missing block {}", hash)))
            }
            Err(e) => return Err(StoreError::from_io(e, &bpath)),
        };

        let mut data = Vec::with_capacity(self.config.block_size);
        self.compressor
            .reader(file)
            .and_then(|mut r| r.read_to_end(&mut data))
            .map_err(|e| corrupt(key, format!("unreadable block {}: {}", hash, e)))?;

        if self.config.verify_reads {
            let actual = self.hashers.encode_sum(&data);
            if actual != hash {
                return Err(corrupt(
                    key,
                    format!("block {} hashes to {}", hash, actual),
                ));
            }
        }
        Ok(data)
    }

    // ========================================================================
    // Stat / Remove / Walk
    // ========================================================================

    /// Check whether a value is stored under `key`.
    pub fn stat(&self, key: &str) -> Result<bool> {
        let npath = self.paths.node_path(key)?;
        let _guard = self.lock.enter()?;
        npath.try_exists().at(&npath)
    }

    /// Remove the node for `key`. Its blocks stay until [`clean`](Self::clean).
    #[instrument(skip(self), level = "debug")]
    pub fn remove(&self, key: &str) -> Result<()> {
        let npath = self.paths.node_path(key)?;
        let _guard = self.lock.enter()?;

        match fs::remove_file(&npath) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(StoreError::from_io(e, &npath)),
        }
    }

    /// Call `f` with every stored key, in directory order.
    pub fn walk_keys(&self, mut f: impl FnMut(&str)) -> Result<()> {
        let _guard = self.lock.enter()?;
        walk_dir(self.paths.node_dir(), |key, _| {
            f(key);
            Ok(())
        })
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.walk_keys(|key| keys.push(key.to_string()))?;
        keys.sort();
        Ok(keys)
    }

    /// Count keys and blocks.
    pub fn stats(&self) -> Result<StoreStats> {
        let _guard = self.lock.enter()?;
        let mut stats = StoreStats::default();

        walk_dir(self.paths.node_dir(), |_, _| {
            stats.node_count += 1;
            Ok(())
        })?;
        walk_dir(self.paths.block_dir(), |name, entry| {
            if name.ends_with(TEMP_SUFFIX) {
                return Ok(());
            }
            let meta = entry
                .metadata()
                .map_err(|e| StoreError::from_io(e.into(), entry.path()))?;
            stats.block_count += 1;
            stats.block_bytes += meta.len();
            Ok(())
        })?;
        Ok(stats)
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Delete blocks no node references and report nodes whose blocks are
    /// missing.
    ///
    /// Corrupt nodes are returned as one [`StoreError::CorruptNodes`] and left
    /// on disk; what to do with them is up to the caller. Run without
    /// concurrent writers: a block written for a value whose node does not
    /// exist yet looks unreferenced. `KvStore::clean` holds writers off for
    /// the whole run.
    ///
    /// Temporary block files are only deleted once they are
    /// [`STALE_TEMP_AGE`] old.
    pub fn clean(&self) -> Result<CleanStats> {
        self.clean_with_temp_age(STALE_TEMP_AGE)
    }

    /// [`clean`](Self::clean) deleting temporaries at least `min_age` old.
    /// `Duration::ZERO` deletes all of them, which is only safe while no
    /// write is running.
    #[instrument(skip(self), level = "debug")]
    pub fn clean_with_temp_age(&self, min_age: Duration) -> Result<CleanStats> {
        let _guard = self.lock.enter()?;
        let mut stats = CleanStats::default();

        // Phase 1: load every node and index which keys reference each hash
        let mut pending: HashMap<String, Node> = HashMap::new();
        let mut refs: HashMap<String, Vec<String>> = HashMap::new();
        let mut corrupt_keys: Vec<String> = Vec::new();

        walk_dir(self.paths.node_dir(), |key, entry| {
            let file = match File::open(entry.path()) {
                Ok(file) => file,
                // Removed since the directory was listed
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(StoreError::from_io(e, entry.path())),
            };
            stats.nodes += 1;

            let mut node = Node::default();
            let damaged = match node
                .decode_from(BufReader::with_capacity(self.config.read_buf_size, file))
            {
                Ok(()) if node.is_empty() => {
                    warn!(key, "node lists no blocks");
                    true
                }
                Ok(()) => false,
                Err(e) if is_invalid_node(&e) => {
                    warn!(key, error = %e, "malformed node");
                    true
                }
                Err(e) => return Err(StoreError::from_io(e, entry.path())),
            };

            // Hashes decoded ahead of any damage still protect their blocks
            for hash in &node.hashes {
                let keys = refs.entry(hash.clone()).or_default();
                if keys.last().map(String::as_str) != Some(key) {
                    keys.push(key.to_string());
                }
            }

            if damaged {
                corrupt_keys.push(key.to_string());
            } else {
                pending.insert(key.to_string(), node);
            }
            Ok(())
        })?;

        // Phase 2: resolve each block against the nodes, dropping orphans
        let mut blocks = Vec::new();
        walk_dir(self.paths.block_dir(), |name, _| {
            blocks.push(name.to_string());
            Ok(())
        })?;

        for name in blocks {
            let bpath = self.paths.block_path(&name);

            if name.ends_with(TEMP_SUFFIX) {
                if temp_age(&bpath)? >= min_age {
                    remove_if_present(&bpath)?;
                    stats.removed_temp += 1;
                } else {
                    debug!(file = %name, "keeping recent temporary");
                }
                continue;
            }

            match refs.get(&name) {
                Some(keys) => {
                    stats.live_blocks += 1;
                    for key in keys {
                        if let Some(node) = pending.get_mut(key) {
                            node.remove_hash(&name);
                            if node.is_empty() {
                                pending.remove(key);
                            }
                        }
                    }
                }
                None => {
                    remove_if_present(&bpath)?;
                    stats.removed_blocks += 1;
                    debug!(hash = %name, "removed unreferenced block");
                }
            }
        }

        info!(
            nodes = stats.nodes,
            live_blocks = stats.live_blocks,
            removed_blocks = stats.removed_blocks,
            removed_temp = stats.removed_temp,
            "clean finished"
        );

        // Phase 3: whatever is still pending references blocks that are gone
        corrupt_keys.extend(pending.into_keys());
        if !corrupt_keys.is_empty() {
            corrupt_keys.sort();
            corrupt_keys.dedup();
            warn!(count = corrupt_keys.len(), "corrupt nodes found");
            return Err(StoreError::CorruptNodes { keys: corrupt_keys });
        }
        Ok(stats)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Refuse new operations, wait for in-flight ones (including open
    /// readers) and release the store lock.
    ///
    /// Must not be called while the calling thread holds a [`BlockReader`].
    pub fn close(&self) -> Result<()> {
        self.lock.close()?;
        info!(root = %self.paths.root().display(), "block storage closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock.is_closed()
    }
}

/// Sequential reader over the blocks of one value.
///
/// Holds an in-flight registration on the store until dropped.
pub struct BlockReader<'a> {
    storage: &'a BlockStorage,
    key: String,
    hashes: VecDeque<String>,
    buf: Vec<u8>,
    pos: usize,
    _guard: OpGuard<'a>,
}

impl BlockReader<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blocks not yet loaded.
    pub fn remaining_blocks(&self) -> usize {
        self.hashes.len()
    }
}

impl Read for BlockReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.buf.len() {
                let n = (self.buf.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            let Some(hash) = self.hashes.front() else {
                return Ok(0);
            };
            // A failed block stays at the front, so retries fail the same way
            self.buf = self.storage.read_block(&self.key, hash)?;
            self.pos = 0;
            self.hashes.pop_front();
        }
    }
}

impl fmt::Debug for BlockReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockReader")
            .field("key", &self.key)
            .field("remaining_blocks", &self.hashes.len())
            .finish_non_exhaustive()
    }
}

fn corrupt(key: &str, detail: impl Into<String>) -> StoreError {
    StoreError::CorruptNode {
        key: key.to_string(),
        detail: detail.into(),
    }
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of input.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Visit the regular files directly inside `dir`. A directory that was never
/// created holds no entries.
fn walk_dir(
    dir: &Path,
    mut f: impl FnMut(&str, &walkdir::DirEntry) -> Result<()>,
) -> Result<()> {
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e)
                if e.depth() == 0
                    && e.io_error()
                        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound) =>
            {
                return Ok(())
            }
            Err(e) => {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| dir.to_path_buf());
                return Err(StoreError::from_io(e.into(), path));
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            warn!(path = %entry.path().display(), "skipping non UTF-8 entry");
            continue;
        };
        f(name, &entry)?;
    }
    Ok(())
}

/// Record the compressor of a new store, or refuse one whose blocks were
/// written with a different compressor. Block names hash the raw chunk, so
/// mixed encodings would dedup against each other and fail to decode.
fn check_compression(path: &Path, name: &str) -> Result<()> {
    match fs::read_to_string(path) {
        Ok(stored) if stored.trim() == name => Ok(()),
        Ok(stored) => Err(StoreError::CompressionMismatch {
            path: path.to_path_buf(),
            stored: stored.trim().to_string(),
            configured: name.to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::write(path, format!("{}\n", name)).at(path)
        }
        Err(e) => Err(StoreError::from_io(e, path)),
    }
}

/// Time since `path` was last modified. A file that vanished or carries a
/// future mtime counts as brand new.
fn temp_age(path: &Path) -> Result<Duration> {
    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => Ok(modified.elapsed().unwrap_or_default()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Duration::ZERO),
        Err(e) => Err(StoreError::from_io(e, path)),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::from_io(e, path)),
    }
}
