use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cube::{Cube, Xyz};
use crate::error::CubesError;
use crate::mapped_file::MappedFile;

/// Per-thread read cache capacity. Must be at least 3 so an equality check
/// that dereferences two pointers cannot evict its own operands.
const READ_CACHE_CAP: usize = 1024;

/// Seeds both storage identities and their unique file names.
static NEXT_STORAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A storage backing file that unlinks itself when the last handle drops.
/// The storage and a writer copy job can both hold one; whichever lets go
/// last removes the bytes from disk.
pub struct StorageFile {
    file: MappedFile,
}

impl StorageFile {
    fn create(path: &Path) -> Result<StorageFile, CubesError> {
        let file = MappedFile::open_rw(path, 0, true)?;
        file.advise_sequential();
        Ok(StorageFile { file })
    }

    pub fn file(&self) -> &MappedFile {
        &self.file
    }
}

impl Drop for StorageFile {
    fn drop(&mut self) {
        // nobody reads these bytes again: drop dirty pages, then truncate
        // so the kernel has nothing left to write back before the unlink
        self.file.discard();
        let _ = self.file.truncate(0);
        if let Err(e) = std::fs::remove_file(self.file.path()) {
            eprintln!("[storage] WARN: failed to remove {}: {}", self.file.path().display(), e);
        }
    }
}

/// Offset of one committed (or staged) record, tagged with the storage
/// version it was produced under. A pointer from before a `discard()` can
/// never hit the read cache again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubePtr {
    seek: u64,
    version: u64,
}

impl CubePtr {
    pub fn seek(&self) -> u64 {
        self.seek
    }
}

struct StorageState {
    file: Option<Arc<StorageFile>>,
    cursor: u64,
}

/// Append-only arena of fixed-size coordinate records in one backing file.
///
/// Records go through a two-step publish: `local()` stages a cube in a
/// thread-local slot and hands back a provisional pointer at the current
/// append cursor; `commit()` writes it and advances the cursor, `drop_local()`
/// abandons it. The caller serializes local/commit pairs per storage (the
/// owning shard's exclusive lock does this on the hot path). Reads go through
/// a per-thread LRU cache so set probes do not hit the file every time.
pub struct CubeStorage {
    id: u64,
    fpath: PathBuf,
    n: usize,
    version: AtomicU64,
    state: Mutex<StorageState>,
}

type CacheKey = (u64, u64, u64); // storage id, seek, version

struct Staged {
    offset: u64,
    version: u64,
    cube: Cube,
}

struct ReadCache {
    map: FxHashMap<CacheKey, Cube>,
    order: Vec<CacheKey>, // LRU order, most recent at the back
}

impl ReadCache {
    fn get(&mut self, key: &CacheKey) -> Option<Cube> {
        if let Some(cube) = self.map.get(key) {
            let cube = cube.clone();
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                let k = self.order.remove(pos);
                self.order.push(k);
            }
            return Some(cube);
        }
        None
    }

    fn insert(&mut self, key: CacheKey, cube: Cube) {
        if self.map.len() >= READ_CACHE_CAP {
            let lru = self.order.remove(0);
            self.map.remove(&lru);
        }
        if self.map.insert(key, cube).is_none() {
            self.order.push(key);
        }
    }

    fn forget_storage(&mut self, id: u64) {
        self.map.retain(|k, _| k.0 != id);
        self.order.retain(|k| k.0 != id);
    }
}

thread_local! {
    static STAGED: RefCell<FxHashMap<u64, Staged>> = RefCell::new(FxHashMap::default());
    static READ_CACHE: RefCell<ReadCache> = RefCell::new(ReadCache {
        map: FxHashMap::default(),
        order: Vec::new(),
    });
}

impl CubeStorage {
    /// Storage for `n`-cube records under `dir`. The backing file is not
    /// created until the first commit.
    pub fn new(dir: &Path, n: usize) -> CubeStorage {
        let seq = NEXT_STORAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        CubeStorage {
            id: seq,
            fpath: dir.join(format!("storage_{}.bin", seq)),
            n,
            version: AtomicU64::new(0),
            state: Mutex::new(StorageState { file: None, cursor: 0 }),
        }
    }

    pub fn cube_size(&self) -> usize {
        self.n
    }

    pub fn record_size(&self) -> usize {
        self.n * 3
    }

    pub fn path(&self) -> &Path {
        &self.fpath
    }

    /// Committed payload length in bytes.
    pub fn bytes(&self) -> u64 {
        self.state.lock().cursor
    }

    /// The backing file handle, if anything has been committed.
    pub fn file_handle(&self) -> Option<Arc<StorageFile>> {
        self.state.lock().file.clone()
    }

    /// Stage a cube in the calling thread's slot and return a provisional
    /// pointer at the current append cursor. Nothing touches the file. The
    /// pointer is resolvable by this thread only, until `commit()`.
    pub fn local(&self, cube: &Cube) -> CubePtr {
        assert_eq!(
            cube.size(),
            self.n,
            "cube size {} differs from storage record size {}",
            cube.size(),
            self.n
        );
        let offset = self.state.lock().cursor;
        let version = self.version.load(Ordering::Acquire);
        STAGED.with(|staged| {
            staged.borrow_mut().insert(
                self.id,
                Staged { offset, version, cube: cube.clone() },
            );
        });
        CubePtr { seek: offset, version }
    }

    /// Publish the staged record: write it at the cursor and advance. Must
    /// follow a `local()` on the same thread with no interleaved commit on
    /// this storage.
    pub fn commit(&self) -> Result<(), CubesError> {
        let staged = STAGED
            .with(|staged| staged.borrow_mut().remove(&self.id))
            .unwrap_or_else(|| panic!("commit() without a staged local() on this thread"));
        let mut state = self.state.lock();
        assert_eq!(
            staged.offset, state.cursor,
            "staged record went stale: another commit slipped between local() and commit()"
        );
        if state.file.is_none() {
            state.file = Some(Arc::new(StorageFile::create(&self.fpath)?));
        }
        let file = state.file.as_ref().unwrap();
        file.file().write_at(state.cursor, &staged.cube.to_bytes())?;
        state.cursor += self.record_size() as u64;
        Ok(())
    }

    /// Abandon the staged record without writing it.
    pub fn drop_local(&self) {
        STAGED.with(|staged| {
            staged.borrow_mut().remove(&self.id);
        });
    }

    /// Resolve a pointer to its cube. The calling thread's staged slot wins
    /// when the pointer is provisional; otherwise the thread-local cache is
    /// consulted, and on a miss the record is read from the file and cached.
    ///
    /// A pointer from an out-of-range offset is a logic error and panics.
    pub fn read(&self, ptr: &CubePtr) -> Cube {
        let version = self.version.load(Ordering::Acquire);

        let staged_hit = STAGED.with(|staged| {
            let staged = staged.borrow();
            staged.get(&self.id).and_then(|s| {
                if s.offset == ptr.seek && s.version == version {
                    Some(s.cube.clone())
                } else {
                    None
                }
            })
        });
        if let Some(cube) = staged_hit {
            return cube;
        }

        let key: CacheKey = (self.id, ptr.seek, version);
        let fresh = ptr.version == version;
        if fresh {
            let hit = READ_CACHE.with(|cache| cache.borrow_mut().get(&key));
            if let Some(cube) = hit {
                return cube;
            }
        }

        let cube = self.read_record(ptr.seek);
        if fresh {
            READ_CACHE.with(|cache| cache.borrow_mut().insert(key, cube.clone()));
        }
        cube
    }

    /// Raw record copy, bypassing the read cache. Appends `n` coordinates
    /// to `out`.
    pub fn copy_data(&self, ptr: &CubePtr, out: &mut Vec<Xyz>) {
        out.extend_from_slice(self.read_record(ptr.seek).coords());
    }

    fn read_record(&self, seek: u64) -> Cube {
        let file = {
            let state = self.state.lock();
            assert!(
                seek + self.record_size() as u64 <= state.cursor,
                "record read at {} past committed length {}",
                seek,
                state.cursor
            );
            Arc::clone(state.file.as_ref().expect("storage has no backing file"))
        };
        let mut buf = vec![0u8; self.record_size()];
        file.file()
            .read_at(seek, &mut buf)
            .unwrap_or_else(|e| panic!("storage read at {} failed: {}", seek, e));
        Cube::from_bytes(&buf)
    }

    /// Drop this thread's cached cubes for this storage. Call from threads
    /// that are done reading it.
    pub fn reset_read_cache(&self) {
        READ_CACHE.with(|cache| cache.borrow_mut().forget_storage(self.id));
    }

    /// Release the backing file and start over. The bytes stay on disk for
    /// as long as anyone else (a writer copy job) still holds the file
    /// handle; the version bump strands every outstanding cache entry.
    pub fn discard(&self) {
        let mut state = self.state.lock();
        self.version.fetch_add(1, Ordering::AcqRel);
        state.cursor = 0;
        state.file = None;
    }
}

impl Drop for CubeStorage {
    fn drop(&mut self) {
        self.discard();
    }
}
