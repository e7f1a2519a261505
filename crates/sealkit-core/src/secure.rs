//! Secret-buffer handling: zero on drop, best-effort page locking.

use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{ErrorKind, Result};

/// Heap buffer for keys and buffered plaintext.  The backing storage is
/// locked into RAM where the platform allows it and zeroised before
/// release.  Growth is managed by hand: `Vec` must never reallocate behind
/// our back, since that would free the locked pages without zeroising them
/// and leave the lock pointing at a stale address.  Instead, growth past
/// the current capacity copies into a fresh locked allocation and scrubs
/// the old one first.
pub struct SecretBuffer {
    data: Vec<u8>,
    locked: bool,
}

impl SecretBuffer {
    pub fn new() -> Self {
        SecretBuffer { data: Vec::new(), locked: false }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = SecretBuffer { data: Vec::with_capacity(capacity.max(1)), locked: false };
        buf.lock_pages();
        buf
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        let mut buf = Self::with_capacity(slice.len());
        buf.data.extend_from_slice(slice);
        buf
    }

    fn lock_pages(&mut self) {
        // mlock can fail for unprivileged processes; zeroise-on-drop still
        // applies, so a failure here is not an error.
        #[cfg(unix)]
        {
            if self.data.capacity() > 0 {
                let rc = unsafe {
                    libc::mlock(self.data.as_ptr() as *const libc::c_void, self.data.capacity())
                };
                self.locked = rc == 0;
            }
        }
    }

    fn unlock_pages(&mut self) {
        #[cfg(unix)]
        {
            if self.locked {
                unsafe {
                    libc::munlock(self.data.as_ptr() as *const libc::c_void, self.data.capacity());
                }
                self.locked = false;
            }
        }
    }

    /// Make room for `additional` more bytes.  When the current allocation
    /// is too small, move to a fresh one ourselves: copy, unlock and zero
    /// the old pages, then lock the new ones.
    fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed <= self.data.capacity() {
            return;
        }
        let new_capacity = needed.max(self.data.capacity() * 2).max(64);
        let mut new_data = Vec::with_capacity(new_capacity);
        new_data.extend_from_slice(&self.data);
        self.unlock_pages();
        self.data.zeroize();
        self.data = new_data;
        self.lock_pages();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn extend_from_slice(&mut self, slice: &[u8]) {
        self.ensure_capacity(slice.len());
        self.data.extend_from_slice(slice);
    }

    pub fn push(&mut self, byte: u8) {
        self.ensure_capacity(1);
        self.data.push(byte);
    }

    /// Remove and return the first `count` bytes.  The allocation (and its
    /// lock) stays in place; only the length shrinks.
    pub fn drain_front(&mut self, count: usize) -> Vec<u8> {
        let count = count.min(self.data.len());
        let out: Vec<u8> = self.data.drain(..count).collect();
        out
    }

    pub fn clear(&mut self) {
        self.data.zeroize();
        self.data.clear();
    }
}

impl Default for SecretBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
        self.unlock_pages();
    }
}

impl std::fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBuffer({} bytes)", self.data.len())
    }
}

/// Constant-time comparison for key check values and key IDs.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// OS-backed random fill for IVs, salts and session keys.
pub fn secure_random(buf: &mut [u8]) -> Result<()> {
    rand::rngs::OsRng
        .try_fill_bytes(buf)
        .map_err(|_| ErrorKind::Signalled)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroised_after_clear() {
        let mut buf = SecretBuffer::from_slice(b"top secret");
        assert_eq!(buf.as_slice(), b"top secret");
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_front_keeps_remainder() {
        let mut buf = SecretBuffer::from_slice(&[1, 2, 3, 4, 5]);
        let head = buf.drain_front(2);
        assert_eq!(head, vec![1, 2]);
        assert_eq!(buf.as_slice(), &[3, 4, 5]);
    }

    #[test]
    fn growth_across_reallocations_keeps_content() {
        // Push well past the initial allocation so the managed
        // reallocation path runs several times.
        let mut buf = SecretBuffer::new();
        let mut expected = Vec::new();
        for round in 0..64u32 {
            let chunk = [round as u8; 100];
            buf.extend_from_slice(&chunk);
            expected.extend_from_slice(&chunk);
        }
        assert_eq!(buf.as_slice(), expected.as_slice());
        assert!(buf.len() <= buf.data.capacity());

        // Still fully usable afterwards.
        let head = buf.drain_front(150);
        assert_eq!(head, expected[..150]);
        assert_eq!(buf.as_slice(), &expected[150..]);
    }

    #[test]
    fn ct_eq_mismatched_lengths() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"abcd", b"abcd"));
    }
}
