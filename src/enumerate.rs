use std::path::{Path, PathBuf};
use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::cache_reader::{CacheReader, CubeSource, FlatCache};
use crate::cache_writer::CacheWriter;
use crate::compressed::is_connected;
use crate::cube::{Cube, Xyz};
use crate::error::CubesError;
use crate::results::check_result;
use crate::rotations::canonicalize;
use crate::sharded_index::{generate_shapes, ShardedIndex};

#[derive(Clone, Debug)]
pub struct GenOptions {
    pub threads: usize,
    pub use_cache: bool,
    pub write_cache: bool,
    pub split_cache: bool,
    pub use_split_cache: bool,
    pub cache_dir: PathBuf,
}

impl GenOptions {
    pub fn new(cache_dir: &Path) -> GenOptions {
        GenOptions {
            threads: 1,
            use_cache: false,
            write_cache: false,
            split_cache: false,
            use_split_cache: false,
            cache_dir: cache_dir.to_path_buf(),
        }
    }
}

pub fn cache_path(dir: &Path, n: usize) -> PathBuf {
    dir.join(format!("cubes_{}.bin", n))
}

pub fn split_cache_path(dir: &Path, n: usize, shape: Xyz) -> PathBuf {
    dir.join(format!(
        "cubes_{}_{}-{}-{}.bin",
        n,
        shape.x(),
        shape.y(),
        shape.z()
    ))
}

/// Expand one base cube: every empty 6-neighbor becomes a candidate, each
/// candidate is shifted back into the non-negative octant, canonicalized
/// over the 24 rotations and inserted under its shape. With `only` set,
/// candidates of any other shape are dropped (split-cache mode).
pub fn expand(base: &Cube, index: &ShardedIndex, only: Option<Xyz>) -> Result<(), CubesError> {
    let coords = base.coords();
    let mut candidates: FxHashSet<Xyz> =
        FxHashSet::with_capacity_and_hasher(coords.len() * 6, Default::default());
    for p in coords {
        candidates.insert(Xyz::new(p.x() + 1, p.y(), p.z()));
        candidates.insert(Xyz::new(p.x() - 1, p.y(), p.z()));
        candidates.insert(Xyz::new(p.x(), p.y() + 1, p.z()));
        candidates.insert(Xyz::new(p.x(), p.y() - 1, p.z()));
        candidates.insert(Xyz::new(p.x(), p.y(), p.z() + 1));
        candidates.insert(Xyz::new(p.x(), p.y(), p.z() - 1));
    }
    for p in coords {
        candidates.remove(p);
    }

    let mut grown = Vec::with_capacity(coords.len() + 1);
    for p in candidates {
        let ax = if p.x() < 0 { 1 } else { 0 };
        let ay = if p.y() < 0 { 1 } else { 0 };
        let az = if p.z() < 0 { 1 } else { 0 };
        grown.clear();
        grown.push(Xyz::new(p.x() + ax, p.y() + ay, p.z() + az));
        for c in coords {
            grown.push(Xyz::new(c.x() + ax, c.y() + ay, c.z() + az));
        }
        let (canon, shape) = canonicalize(&grown);
        if let Some(target) = only {
            if shape != target {
                continue;
            }
        }
        let cube = Cube::new(canon);
        debug_assert!(is_connected(&cube));
        index.insert(&cube, shape)?;
    }
    Ok(())
}

/// Compute all polycubes of size `n`. Returns the total count.
pub fn gen(n: usize, opts: &GenOptions) -> Result<u64, CubesError> {
    std::fs::create_dir_all(&opts.cache_dir)?;
    let writer = CacheWriter::new(8);
    let total = if opts.split_cache || opts.use_split_cache {
        gen_split(n, opts, &writer)?
    } else {
        gen_source(n, opts, &writer)?.size()
    };
    writer.flush();
    println!("[cubes] num total cubes: {}", total);
    Ok(total)
}

/// Produce the cubes of size `n` as an iterable source: loaded from cache
/// when allowed, computed (recursively) otherwise.
fn gen_source(n: usize, opts: &GenOptions, writer: &CacheWriter) -> Result<Box<dyn CubeSource>, CubesError> {
    if n == 0 {
        return Ok(Box::new(FlatCache::new(1)));
    }
    if n <= 2 {
        let index = ShardedIndex::new(n, &opts.cache_dir)?;
        if n == 1 {
            index.insert(&Cube::new(vec![Xyz::new(0, 0, 0)]), Xyz::new(0, 0, 0))?;
        } else {
            index.insert(
                &Cube::new(vec![Xyz::new(0, 0, 0), Xyz::new(0, 0, 1)]),
                Xyz::new(0, 0, 1),
            )?;
        }
        println!("[cubes] {} elements for N={}", index.size(), n);
        return Ok(Box::new(FlatCache::from_index(&index)));
    }

    if opts.use_cache {
        match load_cache(&cache_path(&opts.cache_dir, n), n) {
            Ok(Some(reader)) => return Ok(Box::new(reader)),
            Ok(None) => {}
            Err(e) => return Err(e),
        }
    }

    let base = gen_source(n - 1, opts, writer)?;
    // bases that came off disk get their connectivity verified on the way in
    let verify = opts.use_cache;
    let index = enumerate_generation(base.as_ref(), n, opts, verify)?;

    let count = index.size();
    check_result(n, count)?;

    if opts.write_cache {
        let path = cache_path(&opts.cache_dir, n);
        writer.save(&path, &index)?;
        writer.flush();
        drop(index);
        let reader = CacheReader::load(&path)?;
        return Ok(Box::new(reader));
    }
    Ok(Box::new(FlatCache::from_index(&index)))
}

fn load_cache(path: &Path, n: usize) -> Result<Option<CacheReader>, CubesError> {
    match CacheReader::load(path) {
        Ok(reader) => {
            if reader.n() != n {
                println!(
                    "[cubes] ignoring {}: cache is for N={}, need N={}",
                    path.display(),
                    reader.n(),
                    n
                );
                return Ok(None);
            }
            println!(
                "[cubes] loaded {} ({} cubes, {} shapes)",
                path.display(),
                reader.size(),
                reader.num_shapes()
            );
            Ok(Some(reader))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(CubesError::Format(msg)) => {
            println!("[cubes] ignoring unreadable cache: {}", msg);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// One full generation step: expand every base cube into a fresh index.
fn enumerate_generation(
    base: &dyn CubeSource,
    n: usize,
    opts: &GenOptions,
    verify: bool,
) -> Result<ShardedIndex, CubesError> {
    println!(
        "[cubes] N = {} || generating new cubes from {} base cubes",
        n,
        base.size()
    );
    let start = Instant::now();
    let index = ShardedIndex::new(n, &opts.cache_dir)?;

    for i in 0..base.num_shapes() {
        let range = base.cubes_by_shape(i);
        if range.is_empty() {
            continue;
        }
        let cubes: Vec<Cube> = range.iter().collect();
        expand_all(&cubes, &index, None, opts.threads, verify)?;
    }

    println!(
        "[cubes]   {} cubes for N={}, took {:.2} s",
        index.size(),
        n,
        start.elapsed().as_secs_f64()
    );
    Ok(index)
}

/// Expand a batch of base cubes across worker threads.
fn expand_all(
    cubes: &[Cube],
    index: &ShardedIndex,
    only: Option<Xyz>,
    threads: usize,
    verify: bool,
) -> Result<(), CubesError> {
    if verify {
        for cube in cubes {
            if !is_connected(cube) {
                return Err(CubesError::Unconnected(format!(
                    "cache contained an unconnected {}-cube",
                    cube.size()
                )));
            }
        }
    }
    let threads = threads.max(1).min(cubes.len().max(1));
    if threads == 1 {
        for cube in cubes {
            expand(cube, index, only)?;
        }
        return Ok(());
    }
    let results = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(threads);
        for t in 0..threads {
            let start = cubes.len() * t / threads;
            let end = cubes.len() * (t + 1) / threads;
            let chunk = &cubes[start..end];
            handles.push(scope.spawn(move || -> Result<(), CubesError> {
                for cube in chunk {
                    expand(cube, index, only)?;
                }
                Ok(())
            }));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("expansion worker panicked"))
            .collect::<Vec<_>>()
    });
    for r in results {
        r?;
    }
    Ok(())
}

/// Split-cache mode: process one output shape at a time, writing each as
/// its own cache file and discarding it before the next, so only a single
/// shape's set is ever resident.
fn gen_split(n: usize, opts: &GenOptions, writer: &CacheWriter) -> Result<u64, CubesError> {
    if n <= 2 {
        return Err(CubesError::Other(format!(
            "split cache mode needs N >= 3, got {}",
            n
        )));
    }
    let targets = generate_shapes(n);
    println!("[cubes] N = {} || {} output shapes", n, targets.len());

    // base cubes grouped by shape, either streamed from split files or from
    // a full base source
    let base_shapes = generate_shapes(n - 1);
    let full_base = if opts.use_split_cache {
        None
    } else {
        Some(gen_source(n - 1, opts, writer)?)
    };

    let index = ShardedIndex::new(n, &opts.cache_dir)?;
    let mut total = 0u64;
    let start = Instant::now();

    for (ti, &target) in targets.iter().enumerate() {
        println!(
            "[cubes] process output shape {:3}/{} [{:2} {:2} {:2}]",
            ti + 1,
            targets.len(),
            target.x(),
            target.y(),
            target.z()
        );
        for &s in &base_shapes {
            if !shape_feeds_target(s, target) {
                continue;
            }
            let (cubes, verify) = match &full_base {
                Some(base) => (base_cubes_of_shape(base.as_ref(), s), opts.use_cache),
                None => {
                    let path = split_cache_path(&opts.cache_dir, n - 1, s);
                    match load_cache(&path, n - 1)? {
                        Some(reader) => {
                            let mut cubes = Vec::new();
                            for i in 0..reader.num_shapes() {
                                cubes.extend(reader.cubes_by_shape_streaming(i).iter());
                            }
                            (cubes, true)
                        }
                        None => continue,
                    }
                }
            };
            if cubes.is_empty() {
                continue;
            }
            expand_all(&cubes, &index, Some(target), opts.threads, verify)?;
        }

        let count = index.size_of_shape(target);
        total += count;
        println!(
            "[cubes]   [{:2} {:2} {:2}] num cubes: {}",
            target.x(),
            target.y(),
            target.z(),
            count
        );
        if opts.split_cache && count > 0 {
            writer.save_shape(&split_cache_path(&opts.cache_dir, n, target), &index, target)?;
            writer.flush();
        }
        index.clear_shape(target);
    }

    if opts.use_split_cache && total == 0 {
        return Err(CubesError::Other(format!(
            "no split cache files for N={} under {}",
            n - 1,
            opts.cache_dir.display()
        )));
    }

    println!("[cubes] took {:.2} s", start.elapsed().as_secs_f64());
    check_result(n, total)?;
    Ok(total)
}

fn base_cubes_of_shape(base: &dyn CubeSource, shape: Xyz) -> Vec<Cube> {
    for i in 0..base.num_shapes() {
        let range = base.cubes_by_shape(i);
        if range.shape() == shape {
            return range.iter().collect();
        }
    }
    Vec::new()
}

/// Can an (n-1)-cube of sorted shape `s` expand into an n-cube of sorted
/// shape `t`? Adding one cell grows at most one extent by one, so the
/// sorted difference must be non-negative and sum to at most 1.
fn shape_feeds_target(s: Xyz, t: Xyz) -> bool {
    let dx = t.x() - s.x();
    let dy = t.y() - s.y();
    let dz = t.z() - s.z();
    dx >= 0 && dy >= 0 && dz >= 0 && dx + dy + dz <= 1
}
