//! POSIX shared memory standing in for device FRAM.
//!
//! A [`Fram<T, Mode>`] maps one shared memory object holding the persistent
//! image of an application. The object outlives the process that mapped it,
//! so killing the process at any instruction and starting it again behaves
//! like a power failure followed by a reboot: everything in the image is
//! still there, everything else is gone.
//!
//! # Overview
//!
//! - [`Fram::boot`] - open the image, creating and formatting it on first boot
//! - [`FramPath`] - validated shared memory object name
//! - [`Retained`] - typestate marker: the image survives drop (device memory)
//! - [`Scratch`] - typestate marker: the image is unlinked on drop (tests)
//!
//! # Usage
//!
//! ```no_run
//! use chain::nvm::{BootKind, Fram, FramPath, Retained};
//! use chain::channel::Field;
//! use chain::NonVolatile;
//!
//! #[derive(NonVolatile, Default)]
//! #[repr(C)]
//! struct Image {
//!     reading: Field<u16>,
//! }
//!
//! let path = FramPath::new("/sensor-fram")?;
//! let (fram, kind) = Fram::<Image, Retained>::boot(&path)?;
//! if kind == BootKind::Cold {
//!     // first boot ever: the image holds Image::default()
//! }
//! # Ok::<(), chain::nvm::FramError>(())
//! ```
//!
//! # Image Layout
//!
//! ```text
//! ┌────────────────────────────────┐
//! │ format marker (u64)            │  written last on format
//! ├────────────────────────────────┤
//! │ T: application image           │
//! └────────────────────────────────┘
//! ```
//!
//! A power failure while formatting leaves the marker unset, so the next boot
//! formats again instead of trusting a half-written image.

use rustix::fs::{Mode as FileMode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use thiserror::Error;

use super::{NonVolatile, NvCell};
use crate::trace::{debug, info};

/// Result alias for image operations.
pub type Result<T> = std::result::Result<T, FramError>;

/// Why an image cannot be opened or mapped.
#[derive(Debug, Error)]
pub enum FramError {
    /// The name cannot be passed to `shm_open`.
    #[error("cannot name an image `{name}`: {problem}")]
    BadName { name: String, problem: NameProblem },
    /// A system call failed.
    #[error("{call} on image `{name}`: {errno}")]
    Os {
        call: &'static str,
        name: String,
        #[source]
        errno: io::Errno,
    },
    /// The object holds an image of another size, written by another program.
    #[error("image `{name}` holds {found} bytes, this program's image is {expected}")]
    Foreign {
        name: String,
        expected: usize,
        found: u64,
    },
}

impl FramError {
    fn os<'a>(call: &'static str, name: &'a str) -> impl FnOnce(io::Errno) -> Self + 'a {
        move |errno| Self::Os {
            call,
            name: name.to_string(),
            errno,
        }
    }
}

/// What is wrong with a rejected image name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NameProblem {
    #[error("names start with '/'")]
    Relative,
    #[error("nothing follows the '/'")]
    Empty,
    #[error("only the leading '/' is allowed")]
    Nested,
    #[error("names cannot contain NUL")]
    Nul,
    #[error("{0} bytes is longer than NAME_MAX")]
    TooLong(usize),
}

/// Whether the image had to be formatted on this boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    /// The image did not exist or was never completely formatted.
    Cold,
    /// The image was found intact; execution resumes from it.
    Warm,
}

/// What dropping a [`Fram`] does to the object behind it.
pub trait FramMode {
    /// Unlink the object once the mapping is gone.
    const UNLINK_ON_DROP: bool;
}

/// Device memory: dropping the mapping keeps the image for the next boot.
pub struct Retained;
impl FramMode for Retained {
    const UNLINK_ON_DROP: bool = false;
}

/// Throwaway image: dropping the mapping unlinks it.
pub struct Scratch;
impl FramMode for Scratch {
    const UNLINK_ON_DROP: bool = true;
}

/// `NAME_MAX` on Linux, which `shm_open` applies to the whole name.
const NAME_MAX: usize = 255;

/// Name of the shared memory object holding an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramPath(String);

impl FramPath {
    /// Accepts names of the form `/name` that `shm_open` can use.
    ///
    /// # Errors
    ///
    /// Returns [`FramError::BadName`] naming the [`NameProblem`].
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let problem = match name.strip_prefix('/') {
            None => Some(NameProblem::Relative),
            Some("") => Some(NameProblem::Empty),
            Some(rest) if rest.contains('/') => Some(NameProblem::Nested),
            Some(rest) if rest.contains('\0') => Some(NameProblem::Nul),
            Some(_) if name.len() > NAME_MAX => Some(NameProblem::TooLong(name.len())),
            Some(_) => None,
        };
        match problem {
            Some(problem) => Err(FramError::BadName { name, problem }),
            None => Ok(Self(name)),
        }
    }

    /// Returns the object name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FramPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const FORMAT_MAGIC: u64 = 0x4348_4149_4E46_4D54; // "CHAINFMT" in ASCII

/// On-object layout: format marker followed by the application image.
#[repr(C)]
struct Image<T> {
    marker: NvCell<u64>,
    body: T,
}

/// Mapped non-volatile image with typestate-based cleanup.
///
/// # Safety Invariants
///
/// - **Allocated**: `ptr` points to `size_of::<Image<T>>()` bytes mapped via `mmap()`
/// - **Mapped**: memory remains mapped for the lifetime of `Fram<T>`
/// - **Aligned**: `mmap` returns page-aligned addresses
/// - **Initialized**: the body is only exposed after the format marker is set
///
/// An image can be handed to another thread but not shared with one:
///
/// ```compile_fail
/// use chain::nvm::{Fram, Retained};
///
/// fn assert_sync<T: Sync>() {}
/// assert_sync::<Fram<u64, Retained>>();
/// ```
pub struct Fram<T: NonVolatile, Mode: FramMode> {
    ptr: NonNull<Image<T>>,
    path: FramPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: Fram<T> owns its mapping, which is not thread-local, and
// T: NonVolatile is Send. Fram is !Sync, like the cells it exposes.
unsafe impl<T: NonVolatile, Mode: FramMode> Send for Fram<T, Mode> {}

impl<T: NonVolatile + Default, Mode: FramMode> Fram<T, Mode> {
    /// Maps the image at `path`, creating it if needed.
    ///
    /// An existing, completely formatted image is mapped as-is
    /// ([`BootKind::Warm`]). A missing object is created; a new or
    /// incompletely formatted image is written with `T::default()` before the
    /// format marker is set ([`BootKind::Cold`]).
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Permissions forbid creating or opening the object (`EACCES`)
    /// - The object exists with a size other than this program's image
    /// - Mapping fails (e.g., address space exhausted)
    ///
    /// # Panics
    ///
    /// Panics if `T::default()` panics. The mapping is released first; the
    /// object keeps an unset marker and is formatted again on the next boot.
    pub fn boot(path: &FramPath) -> Result<(Self, BootKind)> {
        let name = path.as_str();
        let size = size_of::<Image<T>>();

        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::RDWR,
            FileMode::RUSR | FileMode::WUSR,
        )
        .map_err(FramError::os("shm_open", name))?;

        let stat = fstat(&fd).map_err(FramError::os("fstat", name))?;
        if stat.st_size == 0 {
            // Fresh object; ftruncate zero-fills it, so the marker reads unset.
            ftruncate(&fd, size as u64).map_err(FramError::os("ftruncate", name))?;
        } else if stat.st_size != size as i64 {
            return Err(FramError::Foreign {
                name: name.to_string(),
                expected: size,
                found: stat.st_size as u64,
            });
        }

        // SAFETY: We are creating a new independent mapping that doesn't alias
        // any existing Rust objects:
        // - Size valid: the object holds exactly size_of::<Image<T>>() bytes
        // - FD valid: shm_open succeeded
        // - Aligned: mmap returns page-aligned addresses, satisfying any T's alignment
        // - No aliasing: fresh mapping from the kernel
        let raw = unsafe {
            mmap(
                null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(FramError::os("mmap", name))?;

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<Image<T>>()) };

        let fram = Self {
            ptr,
            path: path.clone(),
            _mode: PhantomData,
        };

        let kind = match catch_unwind(AssertUnwindSafe(|| fram.format_if_needed())) {
            Ok(kind) => kind,
            Err(payload) => {
                drop(fram);
                resume_unwind(payload);
            }
        };
        info!(path = %fram.path, ?kind, bytes = size, "image mapped");
        Ok((fram, kind))
    }

    fn format_if_needed(&self) -> BootKind {
        let image = self.ptr.as_ptr();

        // SAFETY: the marker is a plain u64 inside the mapping; all bit
        // patterns are valid, including the zero fill of a fresh object.
        let marker = unsafe { &(*image).marker };
        if marker.get() == FORMAT_MAGIC {
            return BootKind::Warm;
        }

        debug!(path = %self.path, "format marker unset, formatting image");
        // SAFETY: the body is not reachable through Deref until `boot`
        // returns, so this write cannot alias a live reference. The previous
        // contents are zero or half-formatted and are overwritten without drop.
        unsafe { std::ptr::addr_of_mut!((*image).body).write(T::default()) };

        marker.set(FORMAT_MAGIC);
        BootKind::Cold
    }
}

impl<T: NonVolatile, Mode: FramMode> Fram<T, Mode> {
    /// Returns the object name backing this image.
    #[must_use]
    pub fn path(&self) -> &FramPath {
        &self.path
    }

    /// Removes the object name so the next [`Fram::boot`] starts cold.
    ///
    /// A missing object is not an error. Existing mappings stay valid until
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`FramError::Os`] if `shm_unlink` fails for any other reason
    /// than the object not existing.
    pub fn erase(path: &FramPath) -> Result<()> {
        match shm::unlink(path.as_str()) {
            Ok(()) | Err(io::Errno::NOENT) => Ok(()),
            Err(err) => Err(FramError::os("shm_unlink", path.as_str())(err)),
        }
    }
}

impl<T: NonVolatile, Mode: FramMode> Drop for Fram<T, Mode> {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<Image<T>>());
        }

        if Mode::UNLINK_ON_DROP {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: NonVolatile, Mode: FramMode> Deref for Fram<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: ptr is valid for the lifetime of Fram, the body was formatted
        // before the value was returned from `boot`, and T: NonVolatile only
        // exposes interior mutability through NvCell.
        unsafe { &(*self.ptr.as_ptr()).body }
    }
}
