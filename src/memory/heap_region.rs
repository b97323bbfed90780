//! In-process backing storage.
//!
//! Inter-thread channels do not need the OS: the backing region is an
//! aligned, zeroed heap buffer held in a process-global registry keyed by
//! channel name. Every endpoint that opens the same name gets a pointer into
//! the same buffer. Registry entries live for the lifetime of the process,
//! so a channel's header (and its registered parameters) survives until the
//! process exits.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;

use crate::error::{PikaError, PikaResult};

lazy_static! {
    static ref REGIONS: DashMap<String, Arc<AlignedBuf>> = DashMap::new();
}

/// A zero-initialized heap allocation with an explicit alignment.
#[derive(Debug)]
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    pub(crate) fn zeroed(size: usize, align: usize) -> PikaResult<Self> {
        let layout = Layout::from_size_align(size, align).map_err(|err| {
            PikaError::backing_storage(format!(
                "invalid region layout (size {}, align {}): {}",
                size, align, err
            ))
        })?;
        // SAFETY: layout has non-zero size for any valid channel geometry;
        // validated above.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            PikaError::backing_storage(format!("allocation of {} bytes failed", size))
        })?;
        Ok(Self { ptr, layout })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the buffer is raw shared bytes; all concurrent access goes through
// the channel header's synchronization, the same way the mapped variant does.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

/// A handle onto a process-global named buffer.
#[derive(Debug)]
pub struct HeapRegion {
    buf: Arc<AlignedBuf>,
    name: String,
}

impl HeapRegion {
    /// Look up or create the buffer registered under `name`.
    ///
    /// Re-opening an existing name with a different size or a stricter
    /// alignment fails: the first opener fixes the geometry.
    pub fn open(name: &str, size: usize, align: usize) -> PikaResult<Self> {
        if name.is_empty() {
            return Err(PikaError::backing_storage(
                "channel name must not be empty".to_string(),
            ));
        }
        let buf = match REGIONS.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let buf = existing.get();
                if buf.len() != size {
                    return Err(PikaError::backing_storage(format!(
                        "in-process region '{}' already exists with size {} but {} bytes were requested",
                        name,
                        buf.len(),
                        size
                    )));
                }
                if buf.align() < align {
                    return Err(PikaError::backing_storage(format!(
                        "in-process region '{}' has alignment {} but {} is required",
                        name,
                        buf.align(),
                        align
                    )));
                }
                Arc::clone(buf)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let buf = Arc::new(AlignedBuf::zeroed(size, align)?);
                log::debug!("created in-process region '{}' ({} bytes)", name, size);
                slot.insert(Arc::clone(&buf));
                buf
            }
        };
        Ok(Self {
            buf,
            name: name.to_string(),
        })
    }

    /// Look up an existing buffer at whatever size it was registered with.
    pub fn open_existing(name: &str) -> PikaResult<Self> {
        let buf = REGIONS
            .get(name)
            .map(|existing| Arc::clone(existing.value()))
            .ok_or_else(|| {
                PikaError::backing_storage(format!("in-process region '{}' does not exist", name))
            })?;
        Ok(Self {
            buf,
            name: name.to_string(),
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
