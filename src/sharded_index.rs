use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cube::{hash_cube, Cube, Xyz};
use crate::error::CubesError;
use crate::storage::CubeStorage;
use crate::swap_set::SwapSet;

/// Shards per shape. Enough to spread contention across a typical machine
/// while keeping the per-shape fixed cost bounded.
pub const NUM_SHARDS: usize = 32;

/// Every shape an n-cube can canonicalize to: sorted extents, small enough
/// to fit n connected cells, big enough to hold them.
pub fn generate_shapes(n: usize) -> Vec<Xyz> {
    let n = n as i32;
    let mut out = Vec::new();
    for x in 0..n {
        for y in x..(n - x) {
            for z in y..(n - x - y) {
                if (x + 1) * (y + 1) * (z + 1) < n {
                    continue;
                }
                out.push(Xyz::new(x as i8, y as i8, z as i8));
            }
        }
    }
    out
}

/// Shape-partitioned cube index: an ordered map from shape to a fixed array
/// of independently locked `SwapSet` shards, each with its own storage file.
/// Inserts route by coordinate hash, so threads working on the same shape
/// mostly land on different shards.
pub struct ShardedIndex {
    n: usize,
    base_path: PathBuf,
    byshape: RwLock<BTreeMap<Xyz, Arc<Vec<SwapSet>>>>,
}

impl ShardedIndex {
    /// Pre-register every feasible shape for size `n`. Storage files land
    /// under `dir`.
    pub fn new(n: usize, dir: &Path) -> Result<ShardedIndex, CubesError> {
        std::fs::create_dir_all(dir)?;
        let index = ShardedIndex {
            n,
            base_path: dir.to_path_buf(),
            byshape: RwLock::new(BTreeMap::new()),
        };
        {
            let mut byshape = index.byshape.write();
            for shape in generate_shapes(n) {
                let shards: Vec<SwapSet> = (0..NUM_SHARDS)
                    .map(|_| SwapSet::new(CubeStorage::new(&index.base_path, n)))
                    .collect();
                byshape.insert(shape, Arc::new(shards));
            }
            println!("[cubes] {} sets by shape for N={}", byshape.len(), n);
        }
        Ok(index)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// The shard array for a shape. Shapes are fixed at `new()`; asking for
    /// one that was never registered is a logic error.
    pub fn shards(&self, shape: Xyz) -> Arc<Vec<SwapSet>> {
        let byshape = self.byshape.read();
        match byshape.get(&shape) {
            Some(shards) => Arc::clone(shards),
            None => panic!(
                "BUG: missing shape [{:2} {:2} {:2}]",
                shape.x(),
                shape.y(),
                shape.z()
            ),
        }
    }

    /// Insert a canonical cube under its shape. Returns true when new.
    pub fn insert(&self, cube: &Cube, shape: Xyz) -> Result<bool, CubesError> {
        let shards = self.shards(shape);
        let idx = (hash_cube(cube.coords()) % NUM_SHARDS as u64) as usize;
        shards[idx].insert(cube)
    }

    /// Registered shapes in table order (sorted by packed dims).
    pub fn shapes(&self) -> Vec<Xyz> {
        self.byshape.read().keys().copied().collect()
    }

    pub fn num_shapes(&self) -> usize {
        self.byshape.read().len()
    }

    pub fn size(&self) -> u64 {
        let byshape = self.byshape.read();
        byshape
            .values()
            .map(|shards| shards.iter().map(|s| s.len() as u64).sum::<u64>())
            .sum()
    }

    pub fn size_of_shape(&self, shape: Xyz) -> u64 {
        self.shards(shape).iter().map(|s| s.len() as u64).sum()
    }

    /// Drop one shape's members and storage, keeping the shape registered.
    pub fn clear_shape(&self, shape: Xyz) {
        for set in self.shards(shape).iter() {
            set.storage().reset_read_cache();
            set.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_enumeration_matches_known_small_sizes() {
        assert_eq!(generate_shapes(1), vec![Xyz::new(0, 0, 0)]);
        assert_eq!(generate_shapes(2), vec![Xyz::new(0, 0, 1)]);
        assert_eq!(generate_shapes(3), vec![Xyz::new(0, 0, 2), Xyz::new(0, 1, 1)]);
        // every shape is sorted and can hold n cells
        for n in 1..=8usize {
            for s in generate_shapes(n) {
                assert!(s.x() <= s.y() && s.y() <= s.z());
                let volume = (s.x() as usize + 1) * (s.y() as usize + 1) * (s.z() as usize + 1);
                assert!(volume >= n);
                assert!((s.x() + s.y() + s.z()) as usize <= n - 1);
            }
        }
    }

    #[test]
    fn insert_routes_and_dedups() {
        let tmp = tempfile::tempdir().unwrap();
        let index = ShardedIndex::new(2, tmp.path()).unwrap();
        let c = Cube::new(vec![Xyz::new(0, 0, 0), Xyz::new(0, 0, 1)]);
        let shape = Xyz::new(0, 0, 1);

        assert!(index.insert(&c, shape).unwrap());
        assert!(!index.insert(&c, shape).unwrap());
        assert_eq!(index.size(), 1);
        assert_eq!(index.size_of_shape(shape), 1);
    }

    #[test]
    #[should_panic(expected = "missing shape")]
    fn unknown_shape_panics() {
        let tmp = tempfile::tempdir().unwrap();
        let index = ShardedIndex::new(2, tmp.path()).unwrap();
        index.shards(Xyz::new(1, 1, 1));
    }

    #[test]
    fn shapes_come_out_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let index = ShardedIndex::new(5, tmp.path()).unwrap();
        let shapes = index.shapes();
        let mut sorted = shapes.clone();
        sorted.sort();
        assert_eq!(shapes, sorted);
        assert_eq!(shapes.len(), index.num_shapes());
    }

    #[test]
    fn parallel_inserts_from_many_threads_dedup() {
        let tmp = tempfile::tempdir().unwrap();
        let index = Arc::new(ShardedIndex::new(3, tmp.path()).unwrap());
        let line = Cube::new(vec![Xyz::new(0, 0, 0), Xyz::new(0, 0, 1), Xyz::new(0, 0, 2)]);
        let bent = Cube::new(vec![Xyz::new(0, 0, 0), Xyz::new(0, 0, 1), Xyz::new(0, 1, 1)]);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let index = Arc::clone(&index);
                let line = line.clone();
                let bent = bent.clone();
                scope.spawn(move || {
                    for _ in 0..500 {
                        index.insert(&line, Xyz::new(0, 0, 2)).unwrap();
                        index.insert(&bent, Xyz::new(0, 1, 1)).unwrap();
                    }
                });
            }
        });
        assert_eq!(index.size(), 2);
    }
}
