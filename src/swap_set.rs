use std::sync::Arc;

use hashbrown::hash_table::Entry;
use hashbrown::HashTable;
use parking_lot::RwLock;

use crate::cube::{hash_cube, Cube, Xyz};
use crate::error::CubesError;
use crate::storage::{CubePtr, CubeStorage};

/// A deduplicating cube set whose element data lives in a `CubeStorage`
/// file. The table itself holds only `CubePtr`s; hashing and equality
/// dereference them through the storage, so a candidate can be probed
/// without ever being written.
///
/// Inserts run the local/commit protocol under the set's exclusive lock:
/// stage the candidate, probe the table against the staged cube, then either
/// commit the record (new element) or drop the slot (duplicate).
pub struct SwapSet {
    storage: Arc<CubeStorage>,
    table: RwLock<HashTable<CubePtr>>,
}

impl SwapSet {
    pub fn new(storage: CubeStorage) -> SwapSet {
        SwapSet {
            storage: Arc::new(storage),
            table: RwLock::new(HashTable::new()),
        }
    }

    pub fn storage(&self) -> &Arc<CubeStorage> {
        &self.storage
    }

    /// Insert a canonical cube. Returns true when it was new.
    pub fn insert(&self, cube: &Cube) -> Result<bool, CubesError> {
        let hash = hash_cube(cube.coords());
        let mut table = self.table.write();
        let ptr = self.storage.local(cube);
        let entry = table.entry(
            hash,
            |k| self.storage.read(k) == *cube,
            |k| hash_cube(self.storage.read(k).coords()),
        );
        match entry {
            Entry::Occupied(_) => {
                self.storage.drop_local();
                Ok(false)
            }
            Entry::Vacant(v) => {
                v.insert(ptr);
                self.storage.commit()?;
                Ok(true)
            }
        }
    }

    pub fn contains(&self, cube: &Cube) -> bool {
        let hash = hash_cube(cube.coords());
        let table = self.table.read();
        table.find(hash, |k| self.storage.read(k) == *cube).is_some()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append every member's coordinates to `out`, bypassing the read
    /// cache. This is the materializing path; the writer's splice path
    /// never iterates the set at all.
    pub fn collect_coords(&self, out: &mut Vec<Xyz>) {
        let table = self.table.read();
        for ptr in table.iter() {
            self.storage.copy_data(ptr, out);
        }
    }

    /// Drop all members and the backing storage contents.
    pub fn clear(&self) {
        let mut table = self.table.write();
        table.clear();
        self.storage.discard();
    }
}
