use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::cache_format::{CacheHeader, ShapeEntry, MAGIC, XYZ_SIZE};
use crate::cube::{Cube, Xyz};
use crate::error::CubesError;
use crate::mapped_file::{ArrayRegion, MappedFile, StructRegion};
use crate::sharded_index::ShardedIndex;

/// A set of per-shape cube ranges, memory-resident or on disk. The
/// enumeration driver only ever sees this trait, so a freshly computed
/// in-memory generation and a mapped cache file are interchangeable bases.
pub trait CubeSource {
    /// Total number of polycubes.
    fn size(&self) -> u64;
    fn num_shapes(&self) -> usize;
    /// Cube range for shape index `i` in shape-table order.
    fn cubes_by_shape(&self, i: usize) -> ShapeRange;
}

#[derive(Clone, Debug)]
enum Backing {
    Empty,
    /// Coordinates already materialized in RAM.
    Mem { data: Arc<Vec<Xyz>>, start: usize },
    /// Coordinates inside a read-only file mapping.
    Mapped { map: Arc<Mmap>, byte_off: usize },
    /// Offset into a file; every dereference rereads.
    File { file: Arc<MappedFile>, offset: u64 },
}

/// One shape's worth of cubes.
#[derive(Clone)]
pub struct ShapeRange {
    shape: Xyz,
    n: usize,
    count: u64,
    backing: Backing,
}

impl ShapeRange {
    pub fn empty(shape: Xyz, n: usize) -> ShapeRange {
        ShapeRange { shape, n, count: 0, backing: Backing::Empty }
    }

    pub fn shape(&self) -> Xyz {
        self.shape
    }

    pub fn size(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> CubeIter {
        CubeIter { n: self.n, count: self.count, pos: 0, backing: self.backing.clone() }
    }
}

/// Forward cube iterator over a shape range. One tag per storage flavor;
/// equality is position-only, so iterators from clones of the same range
/// compare meaningfully.
#[derive(Clone, Debug)]
pub struct CubeIter {
    n: usize,
    count: u64,
    pos: u64,
    backing: Backing,
}

impl CubeIter {
    pub fn pos(&self) -> u64 {
        self.pos
    }

    fn fetch(&self, i: u64) -> Cube {
        match &self.backing {
            Backing::Empty => unreachable!("dereference of an empty range"),
            Backing::Mem { data, start } => {
                let at = start + (i as usize) * self.n;
                Cube::new(data[at..at + self.n].to_vec())
            }
            Backing::Mapped { map, byte_off } => {
                let at = byte_off + (i as usize) * self.n * XYZ_SIZE;
                Cube::from_bytes(&map[at..at + self.n * XYZ_SIZE])
            }
            Backing::File { file, offset } => {
                let mut buf = vec![0u8; self.n * XYZ_SIZE];
                let at = offset + i * (self.n * XYZ_SIZE) as u64;
                file.read_at(at, &mut buf)
                    .unwrap_or_else(|e| panic!("cache read at {} failed: {}", at, e));
                Cube::from_bytes(&buf)
            }
        }
    }
}

impl Iterator for CubeIter {
    type Item = Cube;

    fn next(&mut self) -> Option<Cube> {
        if self.pos >= self.count {
            return None;
        }
        let cube = self.fetch(self.pos);
        self.pos += 1;
        Some(cube)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.pos) as usize;
        (left, Some(left))
    }
}

impl PartialEq for CubeIter {
    fn eq(&self, other: &Self) -> bool {
        self.pos == other.pos
    }
}

impl Eq for CubeIter {}

/// Reader over one cache file. The header and shape table are validated on
/// load; payload offsets are recomputed from the entry sizes, the stored
/// offset field is advisory only.
#[derive(Debug)]
pub struct CacheReader {
    file: Option<Arc<MappedFile>>,
    header: CacheHeader,
    entries: Vec<ShapeEntry>,
    offsets: Vec<u64>,
}

impl CacheReader {
    /// A reader with nothing loaded: zero shapes, zero cubes.
    pub fn new() -> CacheReader {
        CacheReader {
            file: None,
            header: CacheHeader::default(),
            entries: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Map and validate a cache file. A missing file surfaces as an `Io`
    /// error with kind `NotFound` (callers treat that as "no cache");
    /// structural problems are `Format` errors.
    pub fn load(path: &Path) -> Result<CacheReader, CubesError> {
        let file = Arc::new(MappedFile::open(path)?);

        let header_region = StructRegion::<CacheHeader>::new(&file, 0)
            .map_err(|_| CubesError::Format(format!("{}: truncated header", path.display())))?;
        let header = header_region.get()?;
        if header.magic != MAGIC {
            return Err(CubesError::Format(format!(
                "{}: bad magic {:#010x}",
                path.display(),
                header.magic
            )));
        }
        if header.n == 0 || header.n > 127 {
            return Err(CubesError::Format(format!(
                "{}: implausible cube size {}",
                path.display(),
                header.n
            )));
        }

        let table = ArrayRegion::<ShapeEntry>::new(&file, header_region.end_seek(), header.num_shapes as usize)
            .map_err(|_| CubesError::Format(format!("{}: truncated shape table", path.display())))?;
        let record_size = (header.n as usize * XYZ_SIZE) as u64;
        let mut entries = Vec::with_capacity(table.len());
        let mut offsets = Vec::with_capacity(table.len());
        let mut offset = table.end_seek();
        for i in 0..table.len() {
            let entry = table.get(i)?;
            if entry.size % record_size != 0 {
                return Err(CubesError::Format(format!(
                    "{}: shape {} payload {} is not a record multiple",
                    path.display(),
                    i,
                    entry.size
                )));
            }
            offsets.push(offset);
            offset += entry.size;
            entries.push(entry);
        }
        if file.size() != offset {
            println!(
                "[cache] warn: {} is {} bytes, expected {}",
                path.display(),
                file.size(),
                offset
            );
        }

        Ok(CacheReader { file: Some(file), header, entries, offsets })
    }

    pub fn loaded(&self) -> bool {
        self.file.is_some()
    }

    pub fn n(&self) -> usize {
        self.header.n as usize
    }

    pub fn shape_entry(&self, i: usize) -> &ShapeEntry {
        &self.entries[i]
    }

    fn range(&self, i: usize, streaming: bool) -> ShapeRange {
        if i >= self.entries.len() {
            return ShapeRange::empty(Xyz::new(0, 0, 0), self.n());
        }
        let entry = &self.entries[i];
        let n = self.n();
        let count = entry.size / (n * XYZ_SIZE) as u64;
        if count == 0 {
            return ShapeRange::empty(entry.shape(), n);
        }
        let file = self.file.as_ref().expect("entries imply a loaded file");
        let backing = if streaming {
            Backing::File { file: Arc::clone(file), offset: self.offsets[i] }
        } else {
            match file.ro_window() {
                Some(map) => Backing::Mapped { map, byte_off: self.offsets[i] as usize },
                None => Backing::File { file: Arc::clone(file), offset: self.offsets[i] },
            }
        };
        ShapeRange { shape: entry.shape(), n, count, backing }
    }

    /// Range that rereads from the file on every dereference instead of
    /// pointing into the mapping. For passes that must not pull the whole
    /// file through memory.
    pub fn cubes_by_shape_streaming(&self, i: usize) -> ShapeRange {
        self.range(i, true)
    }
}

impl Default for CacheReader {
    fn default() -> Self {
        CacheReader::new()
    }
}

impl CubeSource for CacheReader {
    fn size(&self) -> u64 {
        self.header.num_polycubes
    }

    fn num_shapes(&self) -> usize {
        self.header.num_shapes as usize
    }

    fn cubes_by_shape(&self, i: usize) -> ShapeRange {
        self.range(i, false)
    }
}

/// Memory-only cache, materialized from a populated index by iterating the
/// sets. Bootstraps runs that never touch disk.
pub struct FlatCache {
    n: usize,
    data: Arc<Vec<Xyz>>,
    shapes: Vec<(Xyz, usize, u64)>, // shape, start coordinate index, cube count
}

impl FlatCache {
    pub fn new(n: usize) -> FlatCache {
        FlatCache { n, data: Arc::new(Vec::new()), shapes: Vec::new() }
    }

    pub fn from_index(index: &ShardedIndex) -> FlatCache {
        let n = index.n();
        let mut data = Vec::with_capacity(index.size() as usize * n);
        let mut shapes = Vec::new();
        for shape in index.shapes() {
            let start = data.len();
            for set in index.shards(shape).iter() {
                set.collect_coords(&mut data);
            }
            let count = ((data.len() - start) / n) as u64;
            shapes.push((shape, start, count));
        }
        FlatCache { n, data: Arc::new(data), shapes }
    }

    pub fn n(&self) -> usize {
        self.n
    }
}

impl CubeSource for FlatCache {
    fn size(&self) -> u64 {
        (self.data.len() / self.n.max(1)) as u64
    }

    fn num_shapes(&self) -> usize {
        self.shapes.len()
    }

    fn cubes_by_shape(&self, i: usize) -> ShapeRange {
        if i >= self.shapes.len() {
            return ShapeRange::empty(Xyz::new(0, 0, 0), self.n);
        }
        let (shape, start, count) = self.shapes[i];
        if count == 0 {
            return ShapeRange::empty(shape, self.n);
        }
        ShapeRange {
            shape,
            n: self.n,
            count,
            backing: Backing::Mem { data: Arc::clone(&self.data), start },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::Cube;
    use crate::mapped_file::Record;

    #[test]
    fn empty_reader_is_safe() {
        let reader = CacheReader::new();
        assert!(!reader.loaded());
        assert_eq!(reader.size(), 0);
        assert_eq!(reader.num_shapes(), 0);
        assert!(reader.cubes_by_shape(0).is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = CacheReader::load(Path::new("no_such_cache.bin")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.bin");
        let mut bytes = vec![0u8; CacheHeader::SIZE];
        CacheHeader { magic: 0xDEAD_BEEF, n: 2, num_shapes: 0, num_polycubes: 0 }
            .encode_to(&mut bytes);
        std::fs::write(&path, &bytes).unwrap();
        match CacheReader::load(&path) {
            Err(CubesError::Format(msg)) => assert!(msg.contains("bad magic")),
            other => panic!("expected format error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_header_is_a_format_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short.bin");
        std::fs::write(&path, [0x50, 0x43, 0x55]).unwrap();
        assert!(matches!(CacheReader::load(&path), Err(CubesError::Format(_))));
    }

    #[test]
    fn flat_cache_round_trips_an_index() {
        let tmp = tempfile::tempdir().unwrap();
        let index = ShardedIndex::new(2, tmp.path()).unwrap();
        let c = Cube::new(vec![Xyz::new(0, 0, 0), Xyz::new(0, 0, 1)]);
        index.insert(&c, Xyz::new(0, 0, 1)).unwrap();

        let flat = FlatCache::from_index(&index);
        assert_eq!(flat.size(), 1);
        assert_eq!(flat.num_shapes(), 1);
        let range = flat.cubes_by_shape(0);
        assert_eq!(range.shape(), Xyz::new(0, 0, 1));
        let cubes: Vec<Cube> = range.iter().collect();
        assert_eq!(cubes, vec![c]);
    }

    #[test]
    fn iterator_equality_is_position_only() {
        let tmp = tempfile::tempdir().unwrap();
        let index = ShardedIndex::new(2, tmp.path()).unwrap();
        let c = Cube::new(vec![Xyz::new(0, 0, 0), Xyz::new(0, 0, 1)]);
        index.insert(&c, Xyz::new(0, 0, 1)).unwrap();
        let flat = FlatCache::from_index(&index);

        let range = flat.cubes_by_shape(0);
        let mut a = range.iter();
        let b = range.iter();
        assert_eq!(a, b);
        a.next();
        assert_ne!(a, b);
        let mut c2 = range.iter();
        c2.next();
        assert_eq!(a, c2);
    }
}
