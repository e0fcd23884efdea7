//! Notification objects
//!
//! A notification is a 256-bit bitmap. Each bit can be set, reset, and
//! checked, and each of the three operations is gated by its own per-bit
//! permission bitmap inside the capability (set words 0..4, reset 4..8,
//! check 8..12). Waiters declare a mask; any setter hitting the mask makes
//! them runnable again.

use alloc::vec::Vec;

use super::object::Payload;
use super::system::CapSystem;
use super::{CapError, CapIdx, CapResult, HolderId};
use crate::task::{Pid, Tid};

/// Bits per notification object.
pub const NOTIF_BITS: usize = 256;
/// Bitmap words per notification object.
pub const NOTIF_WORDS: usize = NOTIF_BITS / 64;
/// Permission bitmap: one per-bit map for set, reset, and check.
pub const PERM_WORDS: usize = 3 * NOTIF_WORDS;

const SET_WORDS: usize = 0;
const RESET_WORDS: usize = NOTIF_WORDS;
const CHECK_WORDS: usize = 2 * NOTIF_WORDS;

/// A blocked waiter: which task to wake and the mask it sleeps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub pid: Pid,
    /// Thread-level wait, or process-level when None.
    pub tid: Option<Tid>,
    pub mask: [u64; NOTIF_WORDS],
}

impl Waiter {
    fn matches(&self, bitmap: &[u64; NOTIF_WORDS]) -> bool {
        self.mask.iter().zip(bitmap).any(|(m, b)| m & b != 0)
    }
}

/// The notification payload: the bitmap plus its registered waiters.
#[derive(Debug, Default)]
pub struct Notification {
    bitmap: [u64; NOTIF_WORDS],
    waiters: Vec<Waiter>,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, bit: usize) -> bool {
        self.bitmap[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn any_masked(&self, mask: &[u64; NOTIF_WORDS]) -> bool {
        mask.iter().zip(&self.bitmap).any(|(m, b)| m & b != 0)
    }
}

/// A mask with exactly `bit` set.
pub fn single_bit_mask(bit: usize) -> [u64; NOTIF_WORDS] {
    let mut mask = [0u64; NOTIF_WORDS];
    mask[bit / 64] = 1 << (bit % 64);
    mask
}

impl CapSystem {
    fn resolve_notification(
        &self,
        holder: HolderId,
        cap_idx: CapIdx,
    ) -> CapResult<super::CapNodeId> {
        let cap = self.access(holder, cap_idx)?;
        match self.payload(cap)? {
            Payload::Notification(_) => Ok(cap),
            _ => Err(CapError::TypeNotMatched),
        }
    }

    /// Check the per-bit permission for one of the three op regions.
    fn notif_permitted(&self, cap: super::CapNodeId, region: usize, bit: usize) -> CapResult<()> {
        if bit >= NOTIF_BITS {
            return Err(CapError::InvalidIndex);
        }
        let node = self.node(cap)?;
        if node.perm().window(region * 64 + bit, 1) != 1 {
            log::debug!("notification: bit {bit} denied in region {}", region / NOTIF_WORDS);
            return Err(CapError::InsufficientPermissions);
        }
        Ok(())
    }

    fn notification_mut(&mut self, cap: super::CapNodeId) -> CapResult<&mut Notification> {
        let payload_id = self.node(cap)?.payload_id();
        match self.payloads.get_mut(&payload_id) {
            Some(Payload::Notification(n)) => Ok(n),
            Some(_) => Err(CapError::TypeNotMatched),
            None => Err(CapError::PayloadError),
        }
    }

    /// Set `bit`. Returns the waiters whose masks the bit satisfied; the
    /// caller moves them Blocked → Ready.
    pub fn notification_set(
        &mut self,
        holder: HolderId,
        cap_idx: CapIdx,
        bit: usize,
    ) -> CapResult<Vec<Waiter>> {
        let cap = self.resolve_notification(holder, cap_idx)?;
        self.notif_permitted(cap, SET_WORDS, bit)?;
        let notif = self.notification_mut(cap)?;
        notif.bitmap[bit / 64] |= 1 << (bit % 64);

        let bitmap = notif.bitmap;
        let mut woken = Vec::new();
        notif.waiters.retain(|w| {
            if w.matches(&bitmap) {
                woken.push(*w);
                false
            } else {
                true
            }
        });
        Ok(woken)
    }

    /// Clear `bit`. Racy by design: the waiter clears after observing.
    pub fn notification_reset(
        &mut self,
        holder: HolderId,
        cap_idx: CapIdx,
        bit: usize,
    ) -> CapResult<()> {
        let cap = self.resolve_notification(holder, cap_idx)?;
        self.notif_permitted(cap, RESET_WORDS, bit)?;
        let notif = self.notification_mut(cap)?;
        notif.bitmap[bit / 64] &= !(1 << (bit % 64));
        Ok(())
    }

    /// Read `bit`.
    pub fn notification_check(
        &self,
        holder: HolderId,
        cap_idx: CapIdx,
        bit: usize,
    ) -> CapResult<bool> {
        let cap = self.resolve_notification(holder, cap_idx)?;
        self.notif_permitted(cap, CHECK_WORDS, bit)?;
        match self.payload(cap)? {
            Payload::Notification(n) => Ok(n.is_set(bit)),
            _ => Err(CapError::TypeNotMatched),
        }
    }

    /// Begin a wait on `mask`.
    ///
    /// Requires check permission on every masked bit. Returns `true` when a
    /// masked bit is already set (the caller does not block); otherwise the
    /// waiter is registered and the caller must block itself.
    pub fn notification_wait(
        &mut self,
        holder: HolderId,
        cap_idx: CapIdx,
        waiter: Waiter,
    ) -> CapResult<bool> {
        let cap = self.resolve_notification(holder, cap_idx)?;
        let node = self.node(cap)?;
        for word in 0..NOTIF_WORDS {
            let required = waiter.mask[word];
            if !node
                .perm()
                .imply_window(CHECK_WORDS * 64 + word * 64, 64, required)
            {
                log::debug!("notification: wait mask exceeds check permission");
                return Err(CapError::InsufficientPermissions);
            }
        }

        let notif = self.notification_mut(cap)?;
        if notif.any_masked(&waiter.mask) {
            return Ok(true);
        }
        notif.waiters.push(waiter);
        Ok(false)
    }

    /// Drop any registered waits of `pid` (process teardown).
    pub fn notification_forget_waiter(&mut self, pid: Pid) {
        for payload in self.payloads.values_mut() {
            if let Payload::Notification(n) = payload {
                n.waiters.retain(|w| w.pid != pid);
            }
        }
    }
}
