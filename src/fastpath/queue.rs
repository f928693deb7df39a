//! Fixed-geometry circular queue over shared memory. Samples move between a
//! producer and a consumer without per-sample syscalls; the region is backed
//! by an anonymous memory fd so a second endpoint can attach from another
//! process.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use thiserror::Error;

/// Possible errors for circular queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue holds `capacity` unconsumed entries. Recoverable; the sample
    /// is dropped, never blocked on.
    #[error("queue is full")]
    Full,
    /// The queue has never been written (or holds no unconsumed entries).
    /// Distinguished so pollers can retry silently.
    #[error("queue has never been written")]
    Underrun,
    #[error("sample size {0} does not match entry size {1}")]
    SampleSize(usize, usize),
    #[error("operation not permitted for the {0:?} role")]
    Role(Role),
    #[error("invalid queue geometry")]
    Geometry,
    #[error("shared memory error: {0}")]
    Memory(#[from] nix::Error),
    #[error("fd error: {0}")]
    Fd(#[from] std::io::Error),
}

/// The role this endpoint plays. Only the producer may write samples; only
/// the consumer may consume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

/// Shared-memory header at the start of the region. Head and tail are free
/// running counters; their difference is the number of unconsumed entries.
#[repr(C)]
struct Header {
    head: AtomicU64,
    tail: AtomicU64,
    capacity: u64,
    entry_size: u64,
}

const HEADER_SIZE: usize = 64;

/// A single-producer/single-consumer ring of fixed-size binary samples over
/// an mmap'd shared region. Capacity and entry size are fixed at creation
/// and never renegotiated.
pub struct CircularQueue {
    role: Role,
    fd: OwnedFd,
    ptr: NonNull<c_void>,
    len: usize,
    capacity: usize,
    entry_size: usize,
}

// The mapping stays valid for the queue's lifetime and all shared-header
// access goes through atomics.
unsafe impl Send for CircularQueue {}
unsafe impl Sync for CircularQueue {}

impl CircularQueue {
    /// Create a new queue with the given number of fixed-size entries. The
    /// backing region is an anonymous memory fd owned by this endpoint.
    pub fn with_entries(
        role: Role,
        capacity: usize,
        entry_size: usize,
    ) -> Result<Self, QueueError> {
        if capacity == 0 || entry_size == 0 {
            return Err(QueueError::Geometry);
        }
        let len = HEADER_SIZE + capacity * entry_size;
        let fd = memfd_create(c"hidpath-fastpath", MemFdCreateFlag::MFD_CLOEXEC)?;
        ftruncate(&fd, len as i64)?;
        let ptr = map_shared(&fd, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;

        let queue = Self {
            role,
            fd,
            ptr,
            len,
            capacity,
            entry_size,
        };
        let header = queue.header();
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        // geometry is fixed once written; attaching endpoints validate it
        let header = queue.header_mut();
        header.capacity = capacity as u64;
        header.entry_size = entry_size as u64;

        log::debug!("Created {role:?} queue with {capacity} entries of {entry_size} bytes");
        Ok(queue)
    }

    /// Attach to an existing queue region, taking ownership of the given fd.
    /// Geometry is read back from the shared header.
    pub fn open(role: Role, fd: OwnedFd) -> Result<Self, QueueError> {
        // map just the header first to learn the region geometry
        let probe = map_shared(&fd, HEADER_SIZE, ProtFlags::PROT_READ)?;
        let (capacity, entry_size) = {
            // header is at the start of the page-aligned mapping
            let header = unsafe { &*(probe.as_ptr() as *const Header) };
            (header.capacity as usize, header.entry_size as usize)
        };
        unsafe { munmap(probe, HEADER_SIZE)? };
        if capacity == 0 || entry_size == 0 {
            return Err(QueueError::Geometry);
        }

        let len = HEADER_SIZE + capacity * entry_size;
        let ptr = map_shared(&fd, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;
        log::debug!("Opened {role:?} queue with {capacity} entries of {entry_size} bytes");

        Ok(Self {
            role,
            fd,
            ptr,
            len,
            capacity,
            entry_size,
        })
    }

    /// Duplicate the backing fd so another endpoint can [CircularQueue::open]
    /// the same region.
    pub fn share_fd(&self) -> Result<OwnedFd, QueueError> {
        Ok(self.fd.try_clone()?)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of entries written but not yet consumed
    pub fn entry_count(&self) -> usize {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    /// Append one sample. Fails with [QueueError::Full] when the consumer has
    /// fallen `capacity` entries behind; the caller drops the sample.
    pub fn enqueue(&self, sample: &[u8]) -> Result<(), QueueError> {
        if self.role != Role::Producer {
            return Err(QueueError::Role(self.role));
        }
        if sample.len() != self.entry_size {
            return Err(QueueError::SampleSize(sample.len(), self.entry_size));
        }
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        if head - tail >= self.capacity as u64 {
            return Err(QueueError::Full);
        }
        self.slot_mut(head).copy_from_slice(sample);
        header.head.store(head + 1, Ordering::Release);
        Ok(())
    }

    /// Destructively read the oldest unconsumed entry into `buf`
    pub fn dequeue(&self, buf: &mut [u8]) -> Result<usize, QueueError> {
        if self.role != Role::Consumer {
            return Err(QueueError::Role(self.role));
        }
        if buf.len() < self.entry_size {
            return Err(QueueError::SampleSize(buf.len(), self.entry_size));
        }
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        if tail >= head {
            return Err(QueueError::Underrun);
        }
        buf[..self.entry_size].copy_from_slice(self.slot(tail));
        header.tail.store(tail + 1, Ordering::Release);
        Ok(self.entry_size)
    }

    /// Non-destructively read the most recently written entry into `buf`.
    /// Older entries are left unconsumed; a poller that only cares about the
    /// latest value never has to drain the queue.
    pub fn copy_latest(&self, buf: &mut [u8]) -> Result<usize, QueueError> {
        if buf.len() < self.entry_size {
            return Err(QueueError::SampleSize(buf.len(), self.entry_size));
        }
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        if head == 0 {
            return Err(QueueError::Underrun);
        }
        buf[..self.entry_size].copy_from_slice(self.slot(head - 1));
        Ok(self.entry_size)
    }

    /// Map the queue region for direct access. Producers map read-write;
    /// consumers get a read-only mapping, enforced by the mapping protection
    /// rather than convention.
    pub fn map_region(&self) -> Result<MappedRegion, QueueError> {
        let prot = match self.role {
            Role::Producer => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            Role::Consumer => ProtFlags::PROT_READ,
        };
        let ptr = map_shared(&self.fd, self.len, prot)?;
        Ok(MappedRegion {
            ptr,
            len: self.len,
            read_only: self.role == Role::Consumer,
        })
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.ptr.as_ptr() as *const Header) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut Header {
        // only used once during creation, before the region is shared
        unsafe { &mut *(self.ptr.as_ptr() as *mut Header) }
    }

    fn slot(&self, index: u64) -> &[u8] {
        let offset = HEADER_SIZE + (index % self.capacity as u64) as usize * self.entry_size;
        unsafe {
            std::slice::from_raw_parts(
                (self.ptr.as_ptr() as *const u8).add(offset),
                self.entry_size,
            )
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot_mut(&self, index: u64) -> &mut [u8] {
        let offset = HEADER_SIZE + (index % self.capacity as u64) as usize * self.entry_size;
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.ptr.as_ptr() as *mut u8).add(offset),
                self.entry_size,
            )
        }
    }
}

impl Drop for CircularQueue {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("failed to unmap queue region: {err}");
        }
    }
}

impl std::fmt::Debug for CircularQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularQueue")
            .field("role", &self.role)
            .field("capacity", &self.capacity)
            .field("entry_size", &self.entry_size)
            .finish()
    }
}

/// A direct mapping of a queue region. Consumer mappings are read-only; the
/// protection is enforced by the kernel, so a consumer cannot corrupt
/// producer state through it.
pub struct MappedRegion {
    ptr: NonNull<c_void>,
    len: usize,
    read_only: bool,
}

unsafe impl Send for MappedRegion {}

impl MappedRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    /// Mutable access to the region, available to producer mappings only
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], QueueError> {
        if self.read_only {
            return Err(QueueError::Role(Role::Consumer));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("failed to unmap region: {err}");
        }
    }
}

fn map_shared(
    fd: &impl AsFd,
    len: usize,
    prot: ProtFlags,
) -> Result<NonNull<c_void>, QueueError> {
    let length = NonZeroUsize::new(len).ok_or(QueueError::Geometry)?;
    let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, fd, 0)? };
    Ok(ptr)
}
