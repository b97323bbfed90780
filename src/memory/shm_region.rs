//! Inter-process backing storage over POSIX shared memory.
//!
//! A region is a named shared-memory object (`shm_open`) mapped read-write
//! into the caller's address space. The object's size is exact: the first
//! endpoint sizes it, later endpoints must request the same size. Unlinking
//! is a separate, explicit step performed by the channel layer when the last
//! endpoint disconnects — a dropped handle only unmaps.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{PikaError, PikaResult};

/// A mapped view of a named POSIX shared-memory object.
#[derive(Debug)]
pub struct ShmRegion {
    mmap: MmapMut,
    // Keeps the descriptor open for the lifetime of the mapping.
    _file: File,
    name: String,
    size: usize,
    created: bool,
}

fn shm_name(name: &str) -> PikaResult<CString> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(PikaError::backing_storage(format!(
            "shared memory name '{}' must begin with \"/\" and name an object",
            name
        )));
    }
    CString::new(name).map_err(|_| {
        PikaError::backing_storage(format!("shared memory name '{}' contains a null byte", name))
    })
}

impl ShmRegion {
    /// Create or open the named object at exactly `size` bytes and map it.
    ///
    /// The mapped base must be aligned to at least `align`; a fresh object is
    /// zero-filled by the OS.
    pub fn open(name: &str, size: usize, align: usize) -> PikaResult<Self> {
        let c_name = shm_name(name)?;

        // SAFETY: c_name is a valid null-terminated CString; flags and mode
        // are valid POSIX constants.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd < 0 {
            return Err(PikaError::backing_storage(format!(
                "shm_open({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: fd is a freshly opened descriptor owned by nothing else.
        let file = unsafe { File::from_raw_fd(fd) };

        let metadata = file.metadata().map_err(|err| {
            PikaError::backing_storage(format!("fstat({}) failed: {}", name, err))
        })?;
        let created = metadata.len() == 0;
        if created {
            file.set_len(size as u64).map_err(|err| {
                PikaError::backing_storage(format!(
                    "ftruncate({}) to {} bytes failed: {}",
                    name, size, err
                ))
            })?;
        } else if metadata.len() != size as u64 {
            return Err(PikaError::backing_storage(format!(
                "shared memory object '{}' already exists with size {} but {} bytes were requested",
                name,
                metadata.len(),
                size
            )));
        }

        // SAFETY: file is a valid open shared-memory descriptor sized to at
        // least `size` above; the mapping length matches the object size.
        let mmap = unsafe {
            MmapOptions::new().len(size).map_mut(&file).map_err(|err| {
                PikaError::backing_storage(format!("mmap({}) failed: {}", name, err))
            })?
        };

        if !(mmap.as_ptr() as usize).is_multiple_of(align) {
            return Err(PikaError::backing_storage(format!(
                "mapped region for '{}' is not aligned to {} bytes",
                name, align
            )));
        }

        log::debug!(
            "{} shared memory region '{}' ({} bytes)",
            if created { "created" } else { "opened" },
            name,
            size
        );

        Ok(Self {
            mmap,
            _file: file,
            name: name.to_string(),
            size,
            created,
        })
    }

    /// Map an existing named object at whatever size it already has.
    ///
    /// Used to inspect a live channel's header when the caller's requested
    /// geometry disagrees with the registered one.
    pub fn open_existing(name: &str, align: usize) -> PikaResult<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid null-terminated CString.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(PikaError::backing_storage(format!(
                "shared memory object '{}' does not exist: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: fd is a freshly opened descriptor owned by nothing else.
        let file = unsafe { File::from_raw_fd(fd) };
        let size = file
            .metadata()
            .map_err(|err| {
                PikaError::backing_storage(format!("fstat({}) failed: {}", name, err))
            })?
            .len() as usize;
        if size == 0 {
            return Err(PikaError::backing_storage(format!(
                "shared memory object '{}' has no size yet",
                name
            )));
        }
        // SAFETY: mapping length matches the object's recorded size.
        let mmap = unsafe {
            MmapOptions::new().len(size).map_mut(&file).map_err(|err| {
                PikaError::backing_storage(format!("mmap({}) failed: {}", name, err))
            })?
        };
        if !(mmap.as_ptr() as usize).is_multiple_of(align) {
            return Err(PikaError::backing_storage(format!(
                "mapped region for '{}' is not aligned to {} bytes",
                name, align
            )));
        }
        Ok(Self {
            mmap,
            _file: file,
            name: name.to_string(),
            size,
            created: false,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the object (as opposed to attaching).
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Remove the named object from the system namespace.
    ///
    /// Existing mappings stay valid until they are dropped. A missing object
    /// is not an error: when several endpoints race to clean up the same
    /// channel, every unlinker past the first sees `ENOENT`.
    pub fn unlink(name: &str) -> PikaResult<()> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid null-terminated CString.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                log::debug!("shm_unlink({}): already removed", name);
                return Ok(());
            }
            return Err(PikaError::backing_storage(format!(
                "shm_unlink({}) failed: {}",
                name, err
            )));
        }
        log::debug!("unlinked shared memory region '{}'", name);
        Ok(())
    }
}

// SAFETY: the mapping is plain shared memory with no thread-local state;
// concurrent access is coordinated by the channel header placed inside it.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}
