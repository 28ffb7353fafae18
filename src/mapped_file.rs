use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use parking_lot::RwLock;

/// Growth granularity for read-write files. Views round file growth up to
/// this, and the final truncate trims the slack.
pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug)]
enum Window {
    None,
    Ro(Arc<Mmap>),
    Rw(MmapMut),
}

#[derive(Debug)]
struct Inner {
    file: File,
    len: u64,
    window: Window,
}

impl Inner {
    fn remap(&mut self, rw: bool) -> io::Result<()> {
        self.window = if self.len == 0 {
            Window::None
        } else if rw {
            Window::Rw(unsafe { MmapMut::map_mut(&self.file)? })
        } else {
            Window::Ro(Arc::new(unsafe { Mmap::map(&self.file)? }))
        };
        Ok(())
    }

    fn ensure_len(&mut self, need: u64, rw: bool) -> io::Result<()> {
        if need <= self.len {
            return Ok(());
        }
        let new_len = need.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        self.file.set_len(new_len)?;
        self.len = new_len;
        self.remap(rw)
    }
}

/// A file handle plus one read/write mapping window. Methods are
/// shared-read / exclusive-write; instances are shared as `Arc<MappedFile>`
/// between the sets, the writer pool and the reader iterators.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    rw: bool,
    inner: RwLock<Inner>,
}

impl MappedFile {
    /// Open an existing file read-only.
    pub fn open(path: &Path) -> io::Result<MappedFile> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut inner = Inner { file, len, window: Window::None };
        inner.remap(false)?;
        Ok(MappedFile { path: path.to_path_buf(), rw: false, inner: RwLock::new(inner) })
    }

    /// Open read-write. `create` makes the file if absent; a nonzero
    /// `reserve` grows it to at least that many bytes up front.
    pub fn open_rw(path: &Path, reserve: u64, create: bool) -> io::Result<MappedFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        let mut len = file.metadata()?.len();
        if reserve > len {
            file.set_len(reserve)?;
            len = reserve;
        }
        let mut inner = Inner { file, len, window: Window::None };
        inner.remap(true)?;
        Ok(MappedFile { path: path.to_path_buf(), rw: true, inner: RwLock::new(inner) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_rw(&self) -> bool {
        self.rw
    }

    pub fn size(&self) -> u64 {
        self.inner.read().len
    }

    /// Advise the kernel that access will be sequential and large.
    pub fn advise_sequential(&self) {
        #[cfg(unix)]
        {
            let inner = self.inner.read();
            let _ = match &inner.window {
                Window::Ro(map) => map.advise(memmap2::Advice::Sequential),
                Window::Rw(map) => map.advise(memmap2::Advice::Sequential),
                Window::None => Ok(()),
            };
        }
    }

    /// Grow the file (page-granular) so `need` bytes are addressable.
    pub fn grow_to(&self, need: u64) -> io::Result<()> {
        if !self.rw {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is read-only"));
        }
        self.inner.write().ensure_len(need, true)
    }

    /// Set the file length to exactly `n`, dropping any pages past it.
    pub fn truncate(&self, n: u64) -> io::Result<()> {
        if !self.rw {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is read-only"));
        }
        let mut inner = self.inner.write();
        inner.window = Window::None;
        inner.file.set_len(n)?;
        inner.len = n;
        inner.remap(true)
    }

    pub fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<()> {
        if !self.rw {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is read-only"));
        }
        if src.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        inner.ensure_len(offset + src.len() as u64, true)?;
        if matches!(inner.window, Window::None) {
            inner.remap(true)?;
        }
        match &mut inner.window {
            Window::Rw(map) => {
                let start = offset as usize;
                map[start..start + src.len()].copy_from_slice(src);
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::Other, "no writable mapping")),
        }
    }

    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        {
            let inner = self.inner.read();
            if offset + dst.len() as u64 > inner.len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {} past length {}", dst.len(), offset, inner.len),
                ));
            }
            let start = offset as usize;
            match &inner.window {
                Window::Ro(map) => {
                    dst.copy_from_slice(&map[start..start + dst.len()]);
                    return Ok(());
                }
                Window::Rw(map) => {
                    dst.copy_from_slice(&map[start..start + dst.len()]);
                    return Ok(());
                }
                Window::None => {}
            }
        }
        // window was dropped by discard(); rebuild it and retry
        {
            let mut inner = self.inner.write();
            if matches!(inner.window, Window::None) {
                inner.remap(self.rw)?;
            }
        }
        self.read_at(offset, dst)
    }

    /// Byte-exact copy of `n` bytes from another file into this one. The
    /// destination's write lock is held for the whole run, so the copy is
    /// atomic with respect to other mutating calls. `src` must be a
    /// different file.
    pub fn copy_at(&self, src: &MappedFile, src_off: u64, n: u64, dst_off: u64) -> io::Result<()> {
        if n == 0 {
            return Ok(());
        }
        if !self.rw {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is read-only"));
        }
        let mut dst_inner = self.inner.write();
        dst_inner.ensure_len(dst_off + n, true)?;
        if matches!(dst_inner.window, Window::None) {
            dst_inner.remap(true)?;
        }
        let mut src_inner = src.inner.upgradable_read();
        if src_off + n > src_inner.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("copy of {} bytes at {} past source length {}", n, src_off, src_inner.len),
            ));
        }
        if matches!(src_inner.window, Window::None) {
            src_inner.with_upgraded(|inner| inner.remap(src.rw))?;
        }
        let src_slice: &[u8] = match &*src_inner {
            Inner { window: Window::Ro(map), .. } => &map[src_off as usize..(src_off + n) as usize],
            Inner { window: Window::Rw(map), .. } => &map[src_off as usize..(src_off + n) as usize],
            _ => return Err(io::Error::new(io::ErrorKind::Other, "no source mapping")),
        };
        match &mut dst_inner.window {
            Window::Rw(map) => {
                map[dst_off as usize..(dst_off + n) as usize].copy_from_slice(src_slice);
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::Other, "no writable mapping")),
        }
    }

    /// Ask the kernel to write a range back. Returns once the flush is
    /// accepted.
    pub fn flush_range(&self, offset: u64, n: u64) -> io::Result<()> {
        let inner = self.inner.read();
        match &inner.window {
            Window::Rw(map) => {
                let end = (offset + n).min(inner.len);
                if end > offset {
                    map.flush_range(offset as usize, (end - offset) as usize)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        let len = self.size();
        self.flush_range(0, len)
    }

    /// Drop the mapping window without flushing it first. For abandoning a
    /// file: the caller truncates right after, so the dirty pages are
    /// released instead of written back. Always whole-window, since a
    /// sub-range of one shared mapping cannot be un-dirtied on its own.
    pub fn discard(&self) {
        let mut inner = self.inner.write();
        inner.window = Window::None;
    }

    /// The whole-file read-only mapping, if this file was opened read-only.
    /// Used by the memory-resident cube iterators.
    pub fn ro_window(&self) -> Option<Arc<Mmap>> {
        match &self.inner.read().window {
            Window::Ro(map) => Some(Arc::clone(map)),
            _ => None,
        }
    }
}

/// Fixed-size on-disk record with an explicit little-endian byte layout.
pub trait Record: Sized {
    const SIZE: usize;
    fn decode_from(buf: &[u8]) -> Self;
    fn encode_to(&self, buf: &mut [u8]);
}

/// A single fixed-size record at a given offset of a mapped file.
pub struct StructRegion<T: Record> {
    file: Arc<MappedFile>,
    offset: u64,
    _marker: PhantomData<T>,
}

impl<T: Record> StructRegion<T> {
    /// On a read-write file the view grows the file to cover itself; on a
    /// read-only file a short file is an error.
    pub fn new(file: &Arc<MappedFile>, offset: u64) -> io::Result<Self> {
        let end = offset + T::SIZE as u64;
        if file.is_rw() {
            file.grow_to(end)?;
        } else if file.size() < end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file too short for record at {}", offset),
            ));
        }
        Ok(StructRegion { file: Arc::clone(file), offset, _marker: PhantomData })
    }

    pub fn get(&self) -> io::Result<T> {
        let mut buf = vec![0u8; T::SIZE];
        self.file.read_at(self.offset, &mut buf)?;
        Ok(T::decode_from(&buf))
    }

    pub fn set(&self, value: &T) -> io::Result<()> {
        let mut buf = vec![0u8; T::SIZE];
        value.encode_to(&mut buf);
        self.file.write_at(self.offset, &buf)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.file.flush_range(self.offset, T::SIZE as u64)
    }

    /// Offset just past this view, for chained placement.
    pub fn end_seek(&self) -> u64 {
        self.offset + T::SIZE as u64
    }
}

/// `count` consecutive fixed-size records at a given offset.
pub struct ArrayRegion<T: Record> {
    file: Arc<MappedFile>,
    offset: u64,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T: Record> ArrayRegion<T> {
    pub fn new(file: &Arc<MappedFile>, offset: u64, count: usize) -> io::Result<Self> {
        let end = offset + (count * T::SIZE) as u64;
        if file.is_rw() {
            file.grow_to(end)?;
        } else if file.size() < end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file too short for {} records at {}", count, offset),
            ));
        }
        Ok(ArrayRegion { file: Arc::clone(file), offset, count, _marker: PhantomData })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, i: usize) -> io::Result<T> {
        assert!(i < self.count, "array region index {} out of {}", i, self.count);
        let mut buf = vec![0u8; T::SIZE];
        self.file.read_at(self.offset + (i * T::SIZE) as u64, &mut buf)?;
        Ok(T::decode_from(&buf))
    }

    pub fn set(&self, i: usize, value: &T) -> io::Result<()> {
        assert!(i < self.count, "array region index {} out of {}", i, self.count);
        let mut buf = vec![0u8; T::SIZE];
        value.encode_to(&mut buf);
        self.file.write_at(self.offset + (i * T::SIZE) as u64, &buf)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.file.flush_range(self.offset, (self.count * T::SIZE) as u64)
    }

    pub fn end_seek(&self) -> u64 {
        self.offset + (self.count * T::SIZE) as u64
    }
}
