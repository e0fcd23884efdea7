//! Kernel↔user memory transfer
//!
//! All routines walk the target page table one page at a time and copy
//! through the kernel-physical alias, so `sstatus.SUM` stays off and a
//! missing mapping surfaces as an error instead of a nested fault.
//! User→user transfers bridge the two address spaces with a heap bounce
//! buffer.

use alloc::vec;

use super::{phys_to_virt, TaskMemory, VirtAddr};
use crate::error::MmError;

/// Walk `[vaddr, vaddr + len)` in `tm`, invoking `f` with the kernel alias
/// and length of each page-bounded chunk.
fn for_each_chunk(
    tm: &TaskMemory,
    vaddr: VirtAddr,
    len: usize,
    mut f: impl FnMut(*mut u8, usize),
) -> Result<(), MmError> {
    let mut va = vaddr.as_usize();
    let mut remaining = len;
    while remaining > 0 {
        let (pa, in_page) = tm
            .table()
            .translate(VirtAddr(va))
            .ok_or(MmError::Unmapped { vaddr: va })?;
        let chunk = in_page.min(remaining);
        f(phys_to_virt(pa), chunk);
        va += chunk;
        remaining -= chunk;
    }
    Ok(())
}

/// Copy a kernel buffer into user memory.
pub fn memcpy_k2u(tm: &TaskMemory, dst: VirtAddr, src: &[u8]) -> Result<(), MmError> {
    let mut offset = 0;
    for_each_chunk(tm, dst, src.len(), |kva, chunk| {
        // SAFETY: kva addresses `chunk` bytes of a mapped user page through
        // the kernel alias; the source range is a live slice.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(offset), kva, chunk);
        }
        offset += chunk;
    })
}

/// Copy user memory into a kernel buffer.
pub fn memcpy_u2k(tm: &TaskMemory, dst: &mut [u8], src: VirtAddr) -> Result<(), MmError> {
    let mut offset = 0;
    let len = dst.len();
    let dst_ptr = dst.as_mut_ptr();
    for_each_chunk(tm, src, len, |kva, chunk| {
        // SAFETY: kva addresses `chunk` bytes of a mapped user page; the
        // destination range is a live slice.
        unsafe {
            core::ptr::copy_nonoverlapping(kva, dst_ptr.add(offset), chunk);
        }
        offset += chunk;
    })
}

/// Copy between two user address spaces through a heap bounce buffer.
pub fn memcpy_u2u(
    dst_tm: &TaskMemory,
    dst: VirtAddr,
    src_tm: &TaskMemory,
    src: VirtAddr,
    len: usize,
) -> Result<(), MmError> {
    let mut bounce = vec![0u8; len];
    memcpy_u2k(src_tm, &mut bounce, src)?;
    memcpy_k2u(dst_tm, dst, &bounce)
}

/// Fill user memory with `byte`.
pub fn memset_u(tm: &TaskMemory, dst: VirtAddr, byte: u8, len: usize) -> Result<(), MmError> {
    for_each_chunk(tm, dst, len, |kva, chunk| {
        // SAFETY: kva addresses `chunk` bytes of a mapped user page.
        unsafe {
            core::ptr::write_bytes(kva, byte, chunk);
        }
    })
}

/// Compare two user ranges; returns the `memcmp` sign.
pub fn memcmp_u2u(
    tm1: &TaskMemory,
    va1: VirtAddr,
    tm2: &TaskMemory,
    va2: VirtAddr,
    len: usize,
) -> Result<i32, MmError> {
    let mut buf1 = vec![0u8; len];
    let mut buf2 = vec![0u8; len];
    memcpy_u2k(tm1, &mut buf1, va1)?;
    memcpy_u2k(tm2, &mut buf2, va2)?;
    Ok(match buf1.cmp(&buf2) {
        core::cmp::Ordering::Less => -1,
        core::cmp::Ordering::Equal => 0,
        core::cmp::Ordering::Greater => 1,
    })
}

/// Copy a NUL-terminated user string into a kernel buffer of at most
/// `max_len` bytes. Returns the bytes copied, excluding the terminator.
pub fn strncpy_u2k(
    tm: &TaskMemory,
    dst: &mut alloc::vec::Vec<u8>,
    src: VirtAddr,
    max_len: usize,
) -> Result<usize, MmError> {
    let mut va = src.as_usize();
    while dst.len() < max_len {
        let mut byte = [0u8; 1];
        memcpy_u2k(tm, &mut byte, VirtAddr(va))?;
        if byte[0] == 0 {
            break;
        }
        dst.push(byte[0]);
        va += 1;
    }
    Ok(dst.len())
}
