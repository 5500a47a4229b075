//! Fixed-length byte regions that can be registered for one-sided access.
use std::fmt;
use std::sync::Arc;

use crate::{NaError, Result};

/// A shared, fixed-length byte region.
///
/// Clones refer to the same memory. The backing allocation never moves or resizes, so
/// [`MemBuffer::base_addr`] is stable for the lifetime of the region.
#[derive(Clone)]
pub struct MemBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    base: u64,
    data: spin::RwLock<Box<[u8]>>,
}

impl MemBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(v: Vec<u8>) -> Self {
        let data = v.into_boxed_slice();
        let base = data.as_ptr() as u64;
        MemBuffer {
            inner: Arc::new(Inner {
                base,
                data: spin::RwLock::new(data),
            }),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peer-local virtual address of the first byte.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.inner.base
    }

    #[inline]
    pub fn ptr_eq(&self, other: &MemBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    fn check(&self, offset: u64, len: u64, size: usize) -> Result<(usize, usize)> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= size as u64 => Ok((offset as usize, end as usize)),
            _ => Err(NaError::OutOfBounds {
                offset,
                len,
                size: size as u64,
            }),
        }
    }

    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.inner.data.read();
        let (start, end) = self.check(offset, dst.len() as u64, data.len())?;
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    pub fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut data = self.inner.data.write();
        let (start, end) = self.check(offset, src.len() as u64, data.len())?;
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    /// Copy `len` bytes between two regions, which may be the same region.
    pub fn copy(src: &MemBuffer, src_offset: u64, dst: &MemBuffer, dst_offset: u64, len: u64) -> Result<()> {
        if src.ptr_eq(dst) {
            let mut data = src.inner.data.write();
            let size = data.len();
            let (s, _) = src.check(src_offset, len, size)?;
            let (d, _) = dst.check(dst_offset, len, size)?;
            data.copy_within(s..s + len as usize, d);
            return Ok(());
        }
        // Lock in address order so opposite-direction copies cannot deadlock.
        let from;
        let mut to;
        if src.inner.base < dst.inner.base {
            from = src.inner.data.read();
            to = dst.inner.data.write();
        } else {
            to = dst.inner.data.write();
            from = src.inner.data.read();
        }
        let (s0, s1) = src.check(src_offset, len, from.len())?;
        let (d0, d1) = dst.check(dst_offset, len, to.len())?;
        to[d0..d1].copy_from_slice(&from[s0..s1]);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.data.read().to_vec()
    }
}

impl fmt::Debug for MemBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBuffer")
            .field("base", &format_args!("{:#x}", self.inner.base))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_bounds() {
        let buf = MemBuffer::zeroed(16);
        buf.write_at(4, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        buf.read_at(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(matches!(
            buf.write_at(15, &[0, 0]),
            Err(NaError::OutOfBounds { offset: 15, len: 2, size: 16 })
        ));
    }

    #[test]
    fn copy_within_same_region() {
        let buf = MemBuffer::from_vec((0..8).collect());
        MemBuffer::copy(&buf, 0, &buf, 4, 4).unwrap();
        assert_eq!(buf.to_vec(), vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn base_addr_is_stable() {
        let buf = MemBuffer::zeroed(32);
        let base = buf.base_addr();
        buf.write_at(0, &[9; 32]).unwrap();
        assert_eq!(buf.clone().base_addr(), base);
    }
}
