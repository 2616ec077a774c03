//! Locked secret memory.
//!
//! Every long-lived secret in the engine (root keys, chain keys, identity
//! scalars, message keys) lives in a [`SecretBuf`] or a shared [`SecretHandle`],
//! never in a growable container. The region is page-locked where the OS
//! allows (`mlock` on Unix, `VirtualLock` on Windows) and wiped with a
//! compiler-opaque zeroisation before release.
//!
//! Lock failure is not fatal: a process running against RLIMIT_MEMLOCK still
//! works, it just loses the no-swap guarantee. Allocation failure is fatal.

use std::sync::Arc;

use zeroize::Zeroize;

mod error;

pub use error::SecMemError;

/// Hard cap on a single secret allocation. Secrets in this engine are keys
/// and serialized session state, never bulk payloads.
pub const MAX_SECRET_LEN: usize = 1 << 20;

// ── Page locking ─────────────────────────────────────────────────────────────

#[cfg(unix)]
fn page_lock(ptr: *const u8, len: usize) -> bool {
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(unix)]
fn page_unlock(ptr: *const u8, len: usize) {
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(windows)]
fn page_lock(ptr: *const u8, len: usize) -> bool {
    unsafe { windows_sys::Win32::System::Memory::VirtualLock(ptr as *mut _, len) != 0 }
}

#[cfg(windows)]
fn page_unlock(ptr: *const u8, len: usize) {
    unsafe {
        windows_sys::Win32::System::Memory::VirtualUnlock(ptr as *mut _, len);
    }
}

#[cfg(not(any(unix, windows)))]
fn page_lock(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
fn page_unlock(_ptr: *const u8, _len: usize) {}

// ── SecretBuf ────────────────────────────────────────────────────────────────

/// Uniquely-owned secret region. Wiped and unlocked on drop or on an
/// explicit [`SecretBuf::dispose`]; disposing twice is a no-op.
pub struct SecretBuf {
    data: Option<Box<[u8]>>,
    locked: bool,
}

impl SecretBuf {
    /// Allocate `len` zeroed bytes of locked memory.
    pub fn alloc(len: usize) -> Result<Self, SecMemError> {
        if len == 0 {
            return Err(SecMemError::InvalidSize {
                expected: 1,
                got: 0,
            });
        }
        if len > MAX_SECRET_LEN {
            return Err(SecMemError::AllocationFailed(format!(
                "{len} bytes exceeds the {MAX_SECRET_LEN}-byte secret cap"
            )));
        }
        let data = vec![0u8; len].into_boxed_slice();
        let locked = page_lock(data.as_ptr(), data.len());
        if !locked {
            tracing::warn!(len, "page lock refused; secret held in unlocked memory");
        }
        Ok(Self {
            data: Some(data),
            locked,
        })
    }

    /// Allocate and fill from `bytes` in one step.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecMemError> {
        let mut buf = Self::alloc(bytes.len())?;
        buf.write(bytes)?;
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.data.is_none()
    }

    /// Copy `bytes` into the region. The lengths must agree exactly.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), SecMemError> {
        let data = self.data.as_mut().ok_or(SecMemError::ObjectDisposed)?;
        if bytes.len() != data.len() {
            return Err(SecMemError::InvalidSize {
                expected: data.len(),
                got: bytes.len(),
            });
        }
        data.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy the region out into `dst`, which must be at least as long.
    pub fn read_into(&self, dst: &mut [u8]) -> Result<(), SecMemError> {
        let data = self.data.as_ref().ok_or(SecMemError::ObjectDisposed)?;
        if dst.len() < data.len() {
            return Err(SecMemError::BufferTooSmall {
                needed: data.len(),
                got: dst.len(),
            });
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Borrow the bytes for the duration of `f`. The closure must not copy
    /// them into anything that outlives it unprotected.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, SecMemError> {
        let data = self.data.as_ref().ok_or(SecMemError::ObjectDisposed)?;
        Ok(f(data))
    }

    /// Wipe, unlock and release the region. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.zeroize();
            if self.locked {
                page_unlock(data.as_ptr(), data.len());
                self.locked = false;
            }
        }
    }

    /// Seal into a shared read-only handle.
    pub fn into_handle(self) -> SecretHandle {
        SecretHandle {
            inner: Arc::new(self),
        }
    }
}

impl Drop for SecretBuf {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ── SecretHandle ─────────────────────────────────────────────────────────────

/// Reference-counted read-only view over a [`SecretBuf`]. Clones share the
/// region; the last clone's drop performs the wipe.
#[derive(Clone)]
pub struct SecretHandle {
    inner: Arc<SecretBuf>,
}

impl SecretHandle {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecMemError> {
        Ok(SecretBuf::from_bytes(bytes)?.into_handle())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn read_into(&self, dst: &mut [u8]) -> Result<(), SecMemError> {
        self.inner.read_into(dst)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, SecMemError> {
        self.inner.with_bytes(f)
    }
}

impl std::fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBuf")
            .field("len", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// Secrets never Display or Debug their contents.
impl std::fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretHandle({} bytes)", self.len())
    }
}
