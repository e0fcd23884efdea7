//! Permission bits
//!
//! Every capability carries a 64-bit basic permission word (low 16 bits
//! reserved for the generic operations) plus, for payload types whose object
//! is itself a collection, an extension bitmap for per-element control.
//! `imply` is bitwise implication over the whole thing; `downgrade` is its
//! monotone in-place application.

use alloc::boxed::Box;
use alloc::vec;

use super::object::PayloadType;
use super::{CapError, CapResult};

/// Generic basic bits, valid for every payload type.
pub mod basic {
    /// Borrow the raw payload
    pub const UNWRAP: u64 = 0x1;
    /// Derive a child capability
    pub const CLONE: u64 = 0x2;
    /// Move the capability to another slot or holder
    pub const MIGRATE: u64 = 0x4;
}

/// Bitwise implication: every bit of `required` is present in `held`.
#[inline]
pub const fn bits_imply(held: u64, required: u64) -> bool {
    held & required == required
}

/// A capability's permission set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionBits {
    basic: u64,
    bitmap: Option<Box<[u64]>>,
    ptype: PayloadType,
}

impl PermissionBits {
    /// Extension bitmap length in words for a payload type.
    pub fn bitmap_words(ptype: PayloadType) -> usize {
        match ptype {
            PayloadType::SpaceAccessor => super::csa::BITMAP_WORDS,
            PayloadType::Notification => super::notification::PERM_WORDS,
            _ => 0,
        }
    }

    /// Basic bits only; the extension bitmap (if the type has one) is zero.
    pub fn new(basic: u64, ptype: PayloadType) -> Self {
        let words = Self::bitmap_words(ptype);
        Self {
            basic,
            bitmap: (words > 0).then(|| vec![0u64; words].into_boxed_slice()),
            ptype,
        }
    }

    /// Basic bits plus an explicit extension bitmap. Shorter inputs are
    /// zero-extended, longer ones truncated to the type's width.
    pub fn with_bitmap(basic: u64, bitmap: &[u64], ptype: PayloadType) -> Self {
        let mut perm = Self::new(basic, ptype);
        if let Some(own) = perm.bitmap.as_mut() {
            for (dst, src) in own.iter_mut().zip(bitmap) {
                *dst = *src;
            }
        } else if !bitmap.is_empty() {
            log::warn!("permission: type {ptype:?} takes no bitmap; ignoring one");
        }
        perm
    }

    /// Everything granted: the permission set of a freshly created root.
    pub fn all(ptype: PayloadType) -> Self {
        let words = Self::bitmap_words(ptype);
        Self {
            basic: u64::MAX,
            bitmap: (words > 0).then(|| vec![u64::MAX; words].into_boxed_slice()),
            ptype,
        }
    }

    /// Nothing granted.
    pub fn none(ptype: PayloadType) -> Self {
        Self::new(0, ptype)
    }

    pub fn payload_type(&self) -> PayloadType {
        self.ptype
    }

    pub fn basic(&self) -> u64 {
        self.basic
    }

    /// Does this permission cover the requested basic bits?
    pub fn imply_basic(&self, required: u64) -> bool {
        bits_imply(self.basic, required)
    }

    /// Extract up to 64 bits of the extension bitmap starting at `offset`
    /// bits. Bits beyond the bitmap read as zero.
    pub fn window(&self, offset: usize, width: usize) -> u64 {
        debug_assert!(width > 0 && width <= 64);
        let Some(bitmap) = self.bitmap.as_deref() else {
            return 0;
        };
        let word = offset / 64;
        let shift = offset % 64;
        if word >= bitmap.len() {
            return 0;
        }
        let mut bits = bitmap[word] >> shift;
        if shift + width > 64 && word + 1 < bitmap.len() {
            bits |= bitmap[word + 1] << (64 - shift);
        }
        if width < 64 {
            bits &= (1u64 << width) - 1;
        }
        bits
    }

    /// Does the bitmap window at `offset` cover `required`?
    pub fn imply_window(&self, offset: usize, width: usize, required: u64) -> bool {
        bits_imply(self.window(offset, width), required)
    }

    /// Overwrite the bitmap window at `offset` with `bits`.
    pub fn set_window(&mut self, offset: usize, width: usize, bits: u64) {
        debug_assert!(width > 0 && width <= 64);
        let Some(bitmap) = self.bitmap.as_mut() else {
            return;
        };
        let word = offset / 64;
        let shift = offset % 64;
        if word >= bitmap.len() {
            return;
        }
        let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        bitmap[word] = (bitmap[word] & !(mask << shift)) | ((bits & mask) << shift);
        if shift + width > 64 && word + 1 < bitmap.len() {
            let spill = shift + width - 64;
            let spill_mask = (1u64 << spill) - 1;
            bitmap[word + 1] =
                (bitmap[word + 1] & !spill_mask) | ((bits & mask) >> (64 - shift));
        }
    }

    /// Clear the bitmap window at `offset`.
    pub fn clear_window(&mut self, offset: usize, width: usize) {
        self.set_window(offset, width, 0);
    }

    /// Full implication: same payload type, basic bits imply, and every
    /// bitmap word implies. A type that requires a bitmap never implies a
    /// permission whose bitmap is missing.
    pub fn imply(&self, other: &PermissionBits) -> bool {
        if self.ptype != other.ptype {
            return false;
        }
        if !bits_imply(self.basic, other.basic) {
            return false;
        }
        match (self.bitmap.as_deref(), other.bitmap.as_deref()) {
            (None, None) => true,
            (Some(mine), Some(theirs)) => {
                // Accumulated rather than early-exit: the bitmaps are small
                // and the check almost always succeeds.
                let mut implied = true;
                for (m, t) in mine.iter().zip(theirs.iter()) {
                    implied &= bits_imply(*m, *t);
                }
                implied
            }
            _ => false,
        }
    }

    /// Monotone in-place reduction: fails unless `self` implies `new`,
    /// afterwards `self == new`.
    pub fn downgrade(&mut self, new: &PermissionBits) -> CapResult<()> {
        if self.ptype != new.ptype {
            return Err(CapError::TypeNotMatched);
        }
        if !self.imply(new) {
            return Err(CapError::InsufficientPermissions);
        }
        self.basic = new.basic;
        if let (Some(mine), Some(theirs)) = (self.bitmap.as_mut(), new.bitmap.as_deref()) {
            mine.copy_from_slice(theirs);
        }
        Ok(())
    }
}
