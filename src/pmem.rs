//! Physical memory model: the contiguous host allocation backing guest RAM.
//!
//! Grounded on `original_source/pmem.c`. The source gets its backing store
//! from Mach's `vm_allocate`; the direct host-OS equivalent available to a
//! hosted Rust binary is an anonymous private `mmap`, which is what
//! `rustix::mm` (used the same way across the pack's other hosted VMMs)
//! wraps safely.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::types::{AccessSize, HostAddr};

pub const PAGE_SIZE: u32 = 0x1000;

#[must_use]
pub fn align_up(v: u32, align: u32) -> u32 {
    (v + (align - 1)) & !(align - 1)
}

#[must_use]
pub fn align_down(v: u32, align: u32) -> u32 {
    v & !(align - 1)
}

/// Contiguous host allocation backing guest real memory.
pub struct Pmem {
    base: NonNull<u8>,
    size: u32,
    /// When the guest runs little-endian on this (big-endian-policy)
    /// host, RAM is kept byte-swizzled per-lane; see [`Pmem::to`]/[`Pmem::from`].
    little_endian: bool,
}

// The allocation is privately owned and all access goes through `&mut self`
// transfer methods that bounds-check first.
unsafe impl Send for Pmem {}

impl Pmem {
    /// Page-align `bytes` up and allocate a fresh, zeroed host region.
    pub fn init(bytes: u32, little_endian: bool) -> Result<Self> {
        let size = align_up(bytes, PAGE_SIZE);
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                size as usize,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::PRIVATE,
            )
        }
        .map_err(|_| Error::NoMem)?;
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(Error::NoMem)?;
        Ok(Self {
            base,
            size,
            little_endian,
        })
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn gra_valid(&self, ra: u32) -> bool {
        ra < self.size
    }

    /// Host address for `ra`. Fatal (per spec) if `ra` is out of bounds.
    #[must_use]
    pub fn ha(&self, ra: u32) -> HostAddr {
        assert!(self.gra_valid(ra), "invalid guest real address 0x{ra:x}");
        HostAddr(self.base.as_ptr() as usize + ra as usize)
    }

    pub fn gra(&self, ha: HostAddr) -> Result<u32> {
        let base = self.base.as_ptr() as usize;
        if ha.0 < base || ha.0 >= base + self.size as usize {
            return Err(Error::NotFound);
        }
        Ok((ha.0 - base) as u32)
    }

    fn lane_xor(access: AccessSize) -> usize {
        8 - access.bytes() as usize
    }

    /// Copy `src` into guest RAM at `dest`, honoring endian swizzling and
    /// `force_be`. Returns the number of bytes actually copied (a short
    /// copy at the RAM boundary is legal, not an error).
    pub fn to(
        &mut self,
        dest: u32,
        src: &[u8],
        access_size: AccessSize,
        force_be: bool,
    ) -> Result<u32> {
        let n = access_size.bytes();
        if src.len() as u32 % n != 0 {
            return Err(Error::OutOfBounds);
        }
        let avail = self.size.saturating_sub(dest);
        let copy_len = src.len().min(avail as usize);
        let copy_len = copy_len - (copy_len % n as usize);

        let swizzle = self.little_endian && !force_be;
        for off in (0..copy_len).step_by(n as usize) {
            let chunk = &src[off..off + n as usize];
            let dst_off = if swizzle {
                (dest as usize + off) ^ Self::lane_xor(access_size)
            } else {
                dest as usize + off
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    self.base.as_ptr().add(dst_off),
                    n as usize,
                );
            }
        }
        Ok(copy_len as u32)
    }

    /// Copy `len` bytes from guest RAM at `src` into `dest`. If
    /// `nul_terminate` is set (valid only for `access_size == Byte`), stop
    /// at the first zero byte and return the count without the NUL (but
    /// having still copied it, matching `guest_from_ex`'s contract).
    pub fn from(
        &self,
        dest: &mut [u8],
        src: u32,
        len: u32,
        access_size: AccessSize,
        nul_terminate: bool,
        force_be: bool,
    ) -> Result<u32> {
        if nul_terminate && access_size != AccessSize::Byte {
            return Err(Error::Unsupported("nul_terminate requires access_size == Byte"));
        }
        let n = access_size.bytes();
        if len % n != 0 || dest.len() < len as usize {
            return Err(Error::OutOfBounds);
        }
        let avail = self.size.saturating_sub(src);
        let copy_len = len.min(avail);
        let copy_len = copy_len - (copy_len % n);

        let swizzle = self.little_endian && !force_be;
        let mut copied = 0u32;
        'outer: for off in (0..copy_len).step_by(n as usize) {
            let src_off = if swizzle {
                (src + off) as usize ^ Self::lane_xor(access_size)
            } else {
                (src + off) as usize
            };
            let chunk = unsafe {
                std::slice::from_raw_parts(self.base.as_ptr().add(src_off), n as usize)
            };
            dest[off as usize..off as usize + n as usize].copy_from_slice(chunk);

            if nul_terminate {
                for (i, b) in chunk.iter().enumerate() {
                    copied = off + i as u32 + 1;
                    if *b == 0 {
                        copied -= 1;
                        break 'outer;
                    }
                }
            } else {
                copied = off + n;
            }
        }
        Ok(copied)
    }
}

impl Drop for Pmem {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_rounds_up_to_page() {
        let p = Pmem::init(1, false).unwrap();
        assert_eq!(p.size(), PAGE_SIZE);
    }

    #[test]
    fn plain_be_roundtrip() {
        let mut p = Pmem::init(0x1000, false).unwrap();
        let src = [1u8, 2, 3, 4];
        p.to(0x10, &src, AccessSize::Word, false).unwrap();
        let mut out = [0u8; 4];
        p.from(&mut out, 0x10, 4, AccessSize::Word, false, false)
            .unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn little_endian_roundtrip_all_widths() {
        for access in [AccessSize::Byte, AccessSize::Half, AccessSize::Word] {
            let mut p = Pmem::init(0x1000, true).unwrap();
            let n = access.bytes() as usize;
            let src: Vec<u8> = (0..n as u8).collect();
            p.to(0x100, &src, access, false).unwrap();
            let mut out = vec![0u8; n];
            p.from(&mut out, 0x100, n as u32, access, false, false)
                .unwrap();
            assert_eq!(out, src, "mismatch for access size {n}");
        }
    }

    #[test]
    fn from_short_copy_at_ram_end() {
        let p = Pmem::init(0x1000, false).unwrap();
        let mut out = [0xffu8; 16];
        let n = p
            .from(&mut out, p.size() - 4, 16, AccessSize::Byte, false, false)
            .unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn nul_terminated_from_stops_at_zero() {
        let mut p = Pmem::init(0x1000, false).unwrap();
        p.to(0x0, b"hi\0junk", AccessSize::Byte, false).unwrap();
        let mut out = [0u8; 16];
        let n = p.from(&mut out, 0x0, 16, AccessSize::Byte, true, false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&out[..2], b"hi");
    }

    #[test]
    fn force_be_overrides_guest_endian_policy() {
        let mut p = Pmem::init(0x1000, true).unwrap();
        let src = [1u8, 2, 3, 4];
        p.to(0x10, &src, AccessSize::Word, true).unwrap();
        let mut out = [0u8; 4];
        p.from(&mut out, 0x10, 4, AccessSize::Word, false, true)
            .unwrap();
        assert_eq!(out, src);
    }
}
