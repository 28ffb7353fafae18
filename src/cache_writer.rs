use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::cache_format::{CacheHeader, ShapeEntry, MAGIC, XYZ_SIZE};
use crate::cache_reader::CubeSource;
use crate::cube::Xyz;
use crate::error::CubesError;
use crate::mapped_file::{ArrayRegion, MappedFile, StructRegion};
use crate::sharded_index::ShardedIndex;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queues {
    copy: VecDeque<Job>,
    flush: VecDeque<Job>,
    // in-flight jobs count toward these until they finish
    num_copies: usize,
    num_flushes: usize,
    active: bool,
}

struct Shared {
    queues: Mutex<Queues>,
    run: Condvar,
    wait: Condvar,
}

/// Background cache finalizer. A fixed pool drains two queues, copies
/// before flushes, so bulk data lands in the file before any file is
/// truncated and closed. `save` schedules one copy job per nonempty
/// (shape, shard) pair; the job splices the shard's storage file into the
/// cache file at a pre-assigned offset and then releases its file handle,
/// which unlinks the storage once the owning set lets go too.
pub struct CacheWriter {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl CacheWriter {
    pub fn new(num_threads: usize) -> CacheWriter {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues {
                copy: VecDeque::new(),
                flush: VecDeque::new(),
                num_copies: 0,
                num_flushes: 0,
                active: true,
            }),
            run: Condvar::new(),
            wait: Condvar::new(),
        });
        let workers = (0..num_threads.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || Self::run(&shared))
            })
            .collect();
        CacheWriter { shared, workers }
    }

    fn run(shared: &Shared) {
        let mut q = shared.queues.lock();
        loop {
            if let Some(job) = q.copy.pop_front() {
                drop(q);
                job();
                q = shared.queues.lock();
                q.num_copies -= 1;
                shared.wait.notify_all();
                continue;
            }
            if let Some(job) = q.flush.pop_front() {
                drop(q);
                job();
                q = shared.queues.lock();
                q.num_flushes -= 1;
                shared.wait.notify_all();
                continue;
            }
            if !q.active {
                break;
            }
            shared.wait.notify_all();
            shared.run.wait(&mut q);
        }
        shared.wait.notify_all();
    }

    /// Write the whole index as one cache file.
    pub fn save(&self, path: &Path, index: &ShardedIndex) -> Result<(), CubesError> {
        if index.size() == 0 {
            return Ok(());
        }
        self.save_filtered(path, index, None)
    }

    /// Write a single shape's cubes as a one-entry cache file (split-cache
    /// mode).
    pub fn save_shape(&self, path: &Path, index: &ShardedIndex, shape: Xyz) -> Result<(), CubesError> {
        self.save_filtered(path, index, Some(shape))
    }

    fn save_filtered(
        &self,
        path: &Path,
        index: &ShardedIndex,
        only: Option<Xyz>,
    ) -> Result<(), CubesError> {
        let start = Instant::now();
        let n = index.n();
        let record_size = (n * XYZ_SIZE) as u64;
        let shapes: Vec<Xyz> = match only {
            Some(shape) => vec![shape],
            None => index.shapes(),
        };

        let file = Arc::new(MappedFile::open_rw(path, 0, true)?);

        let header_region = StructRegion::<CacheHeader>::new(&file, 0)?;
        let table = ArrayRegion::<ShapeEntry>::new(&file, header_region.end_seek(), shapes.len())?;

        // shape table with pre-assigned absolute payload offsets
        let mut offset = table.end_seek();
        let mut num_polycubes = 0u64;
        let mut shape_offsets = Vec::with_capacity(shapes.len());
        for (i, &shape) in shapes.iter().enumerate() {
            let count = index.size_of_shape(shape);
            num_polycubes += count;
            let entry = ShapeEntry {
                dim: [shape.x() as u8, shape.y() as u8, shape.z() as u8],
                offset,
                size: count * record_size,
            };
            table.set(i, &entry)?;
            shape_offsets.push(offset);
            offset += entry.size;
        }
        let file_end = offset;

        let header = CacheHeader {
            magic: MAGIC,
            n: n as u32,
            num_shapes: shapes.len() as u32,
            num_polycubes,
        };
        header_region.set(&header)?;
        header_region.flush()?;
        table.flush()?;

        // one copy job per nonempty shard; destination offsets are fixed
        // here, so completion order does not matter
        let mut scheduled = 0usize;
        for (i, &shape) in shapes.iter().enumerate() {
            let mut put = shape_offsets[i];
            for set in index.shards(shape).iter() {
                let num = set.len() as u64;
                if num == 0 {
                    continue;
                }
                let bytes = num * record_size;
                let src = set
                    .storage()
                    .file_handle()
                    .expect("nonempty shard must have a backing file");
                let dst = Arc::clone(&file);
                let dest = put;
                self.enqueue_copy(Box::new(move || {
                    if let Err(e) = dst.copy_at(src.file(), 0, bytes, dest) {
                        eprintln!("[cache] ERROR: splice of {} bytes to {} failed: {}", bytes, dest, e);
                        std::process::abort();
                    }
                    // dropping src releases the storage file handle
                }));
                scheduled += 1;
                put += bytes;
            }
        }

        // backpressure: don't let the copy backlog outgrow the pool
        {
            let mut q = self.shared.queues.lock();
            while q.num_copies > self.workers.len() {
                self.shared.wait.wait(&mut q);
            }
        }

        // finalization runs behind all copies
        {
            let dst = Arc::clone(&file);
            let mut q = self.shared.queues.lock();
            q.flush.push_back(Box::new(move || {
                if let Err(e) = dst.truncate(file_end).and_then(|_| dst.flush()) {
                    eprintln!("[cache] ERROR: finalize of {} failed: {}", dst.path().display(), e);
                    std::process::abort();
                }
            }));
            q.num_flushes += 1;
            self.shared.run.notify_all();
        }

        println!(
            "[cache] saved {} ({} cubes, {} copy jobs), took {:.2} s",
            path.display(),
            num_polycubes,
            scheduled,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn enqueue_copy(&self, job: Job) {
        let mut q = self.shared.queues.lock();
        q.copy.push_back(job);
        q.num_copies += 1;
        self.shared.run.notify_all();
    }

    /// Materializing fallback: iterate a cube source and write records one
    /// by one. Used when there are no storage files to splice.
    pub fn save_source(&self, path: &Path, source: &dyn CubeSource, n: usize) -> Result<(), CubesError> {
        if source.size() == 0 {
            return Ok(());
        }
        let record_size = (n * XYZ_SIZE) as u64;
        let file = Arc::new(MappedFile::open_rw(path, 0, true)?);

        let header_region = StructRegion::<CacheHeader>::new(&file, 0)?;
        let table = ArrayRegion::<ShapeEntry>::new(&file, header_region.end_seek(), source.num_shapes())?;
        header_region.set(&CacheHeader {
            magic: MAGIC,
            n: n as u32,
            num_shapes: source.num_shapes() as u32,
            num_polycubes: source.size(),
        })?;

        let mut offset = table.end_seek();
        for i in 0..source.num_shapes() {
            let range = source.cubes_by_shape(i);
            let shape = range.shape();
            table.set(
                i,
                &ShapeEntry {
                    dim: [shape.x() as u8, shape.y() as u8, shape.z() as u8],
                    offset,
                    size: range.size() * record_size,
                },
            )?;
            for cube in range.iter() {
                file.write_at(offset, &cube.to_bytes())?;
                offset += record_size;
            }
        }
        file.truncate(offset)?;
        file.flush()?;
        println!("[cache] saved {} ({} cubes, materialized)", path.display(), source.size());
        Ok(())
    }

    /// Block until every scheduled copy and flush has completed.
    pub fn flush(&self) {
        let mut q = self.shared.queues.lock();
        while q.num_copies > 0 || q.num_flushes > 0 {
            self.shared.wait.wait(&mut q);
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        self.flush();
        {
            let mut q = self.shared.queues.lock();
            q.active = false;
            self.shared.run.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
