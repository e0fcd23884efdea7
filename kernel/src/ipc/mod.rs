//! IPC: notification wake-ups
//!
//! Bulk message passing is capability migration into a receive space; the
//! notification bitmap is the wake signal. This module is the glue between
//! the capability system (which owns the bitmaps and waiter lists) and the
//! scheduler (which owns runnability): set collects the satisfied waiters
//! under the capability lock and applies the wakes under the task lock.

use crate::cap::notification::single_bit_mask;
use crate::cap::{CapError, CapIdx, CapResult, CapSystem, Waiter};
use crate::sched::Scheduler;
use crate::task::{Pid, ProcessTable, Tid};

/// How a wait call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A masked bit was already set; the caller keeps running.
    Immediate,
    /// The caller is now blocked; reschedule.
    Blocked,
}

/// Wait until any bit in `mask` of the notification at `notif_idx` is set.
///
/// With `tid` this is a thread-level wait: the thread leaves the runnable
/// rotation and the process blocks only when no runnable thread remains.
/// Without `tid` the whole process blocks.
pub fn wait_notifications(
    caps: &mut CapSystem,
    table: &mut ProcessTable,
    sched: &mut Scheduler,
    pid: Pid,
    tid: Option<Tid>,
    notif_idx: CapIdx,
    mask: [u64; 4],
) -> CapResult<WaitOutcome> {
    let holder = table
        .get(pid)
        .ok_or(CapError::InvalidCapability)?
        .holder;
    let waiter = Waiter { pid, tid, mask };
    if caps.notification_wait(holder, notif_idx, waiter)? {
        // Set before the wait was issued: observed immediately.
        return Ok(WaitOutcome::Immediate);
    }

    match tid {
        Some(t) => {
            let proc = table.get_mut(pid).ok_or(CapError::InvalidCapability)?;
            proc.block_thread(t);
            if !proc.has_ready_threads() {
                proc.state = crate::task::TaskState::Blocked;
            }
        }
        None => {
            if sched.current() == Some(pid) {
                sched.block_current(table);
            } else if let Some(proc) = table.get_mut(pid) {
                proc.state = crate::task::TaskState::Blocked;
            }
        }
    }
    Ok(WaitOutcome::Blocked)
}

/// Single-bit wait.
pub fn wait_notification(
    caps: &mut CapSystem,
    table: &mut ProcessTable,
    sched: &mut Scheduler,
    pid: Pid,
    tid: Option<Tid>,
    notif_idx: CapIdx,
    bit: usize,
) -> CapResult<WaitOutcome> {
    if bit >= crate::cap::notification::NOTIF_BITS {
        return Err(CapError::InvalidIndex);
    }
    wait_notifications(caps, table, sched, pid, tid, notif_idx, single_bit_mask(bit))
}

/// Set a notification bit on behalf of `pid` and make every satisfied
/// waiter runnable again.
pub fn notification_set(
    caps: &mut CapSystem,
    table: &mut ProcessTable,
    sched: &mut Scheduler,
    pid: Pid,
    notif_idx: CapIdx,
    bit: usize,
) -> CapResult<()> {
    let holder = table
        .get(pid)
        .ok_or(CapError::InvalidCapability)?
        .holder;
    let woken = caps.notification_set(holder, notif_idx, bit)?;
    for waiter in woken {
        if let Some(t) = waiter.tid {
            if let Some(proc) = table.get_mut(waiter.pid) {
                proc.wake_thread(t);
            }
        }
        sched.wake(table, waiter.pid);
    }
    Ok(())
}

/// Reset a notification bit on behalf of `pid`.
pub fn notification_reset(
    caps: &mut CapSystem,
    table: &ProcessTable,
    pid: Pid,
    notif_idx: CapIdx,
    bit: usize,
) -> CapResult<()> {
    let holder = table
        .get(pid)
        .ok_or(CapError::InvalidCapability)?
        .holder;
    caps.notification_reset(holder, notif_idx, bit)
}

/// Check a notification bit on behalf of `pid`.
pub fn notification_check(
    caps: &CapSystem,
    table: &ProcessTable,
    pid: Pid,
    notif_idx: CapIdx,
    bit: usize,
) -> CapResult<bool> {
    let holder = table
        .get(pid)
        .ok_or(CapError::InvalidCapability)?
        .holder;
    caps.notification_check(holder, notif_idx, bit)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::cap::{Notification, Payload};
    use crate::mm::buddy::test_support::TestArena;
    use crate::mm::VirtAddr;
    use crate::task::TaskState;

    struct Fixture {
        _arena: TestArena,
        alloc: crate::mm::FrameAllocator,
        caps: CapSystem,
        table: ProcessTable,
        sched: Scheduler,
    }

    fn fixture() -> Fixture {
        let arena = TestArena::new(2048, 64);
        let alloc = arena.allocator();
        Fixture {
            _arena: arena,
            alloc,
            caps: CapSystem::new(),
            table: ProcessTable::new(),
            sched: Scheduler::new(),
        }
    }

    impl Fixture {
        fn spawn(&mut self) -> Pid {
            let pid = self
                .table
                .new_task(
                    &mut self.alloc,
                    &mut self.caps,
                    VirtAddr(0x1_0000),
                    2,
                    1,
                    None,
                )
                .unwrap();
            self.sched.enqueue(&mut self.table, pid);
            pid
        }

        /// Create a notification in `owner` and share it with `peer` by
        /// derivation.
        fn shared_notification(&mut self, owner: Pid, peer: Pid) -> CapIdx {
            let owner_holder = self.table.get(owner).unwrap().holder;
            let peer_holder = self.table.get(peer).unwrap().holder;
            let csa = self.caps.holder(owner_holder).unwrap().csa_idx();
            let idx = self.caps.csa_alloc_slot(owner_holder, csa).unwrap();
            let node = self
                .caps
                .csa_create(
                    owner_holder,
                    csa,
                    idx,
                    Payload::Notification(Notification::new()),
                )
                .unwrap();
            // Peer gets the same slot index in its own space.
            self.caps
                .clone_into(
                    crate::cap::SpaceRef::major(peer_holder, 0),
                    idx,
                    node,
                    None,
                )
                .unwrap();
            idx
        }
    }

    #[test]
    fn bit_set_before_wait_returns_immediately() {
        let mut fx = fixture();
        let a = fx.spawn();
        let b = fx.spawn();
        let notif = fx.shared_notification(a, b);
        fx.sched.schedule(&mut fx.table);

        notification_set(&mut fx.caps, &mut fx.table, &mut fx.sched, a, notif, 7).unwrap();
        let outcome = wait_notification(
            &mut fx.caps,
            &mut fx.table,
            &mut fx.sched,
            b,
            None,
            notif,
            7,
        )
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Immediate);
        assert_ne!(fx.table.get(b).unwrap().state, TaskState::Blocked);
    }

    #[test]
    fn set_wakes_a_blocked_waiter() {
        let mut fx = fixture();
        let waiter = fx.spawn();
        let setter = fx.spawn();
        let notif = fx.shared_notification(waiter, setter);

        fx.sched.schedule(&mut fx.table);
        assert_eq!(fx.sched.current(), Some(waiter));

        let outcome = wait_notification(
            &mut fx.caps,
            &mut fx.table,
            &mut fx.sched,
            waiter,
            None,
            notif,
            3,
        )
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Blocked);
        fx.sched.schedule(&mut fx.table);
        assert_eq!(fx.sched.current(), Some(setter));

        // An unrelated bit wakes nobody.
        notification_set(&mut fx.caps, &mut fx.table, &mut fx.sched, setter, notif, 4).unwrap();
        assert_eq!(fx.table.get(waiter).unwrap().state, TaskState::Blocked);

        notification_set(&mut fx.caps, &mut fx.table, &mut fx.sched, setter, notif, 3).unwrap();
        assert_eq!(fx.table.get(waiter).unwrap().state, TaskState::Ready);

        // The waiter observes the bit and clears it afterwards.
        assert!(notification_check(&fx.caps, &fx.table, waiter, notif, 3).unwrap());
        notification_reset(&mut fx.caps, &fx.table, waiter, notif, 3).unwrap();
        assert!(!notification_check(&fx.caps, &fx.table, waiter, notif, 3).unwrap());
    }

    #[test]
    fn mask_wait_wakes_on_any_bit() {
        let mut fx = fixture();
        let waiter = fx.spawn();
        let setter = fx.spawn();
        let notif = fx.shared_notification(waiter, setter);
        fx.sched.schedule(&mut fx.table);

        let mut mask = [0u64; 4];
        mask[1] = 0b101; // bits 64 and 66
        let outcome = wait_notifications(
            &mut fx.caps,
            &mut fx.table,
            &mut fx.sched,
            waiter,
            None,
            notif,
            mask,
        )
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Blocked);

        notification_set(&mut fx.caps, &mut fx.table, &mut fx.sched, setter, notif, 66).unwrap();
        assert_eq!(fx.table.get(waiter).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn thread_level_wait_blocks_only_the_thread() {
        let mut fx = fixture();
        let proc = fx.spawn();
        let peer = fx.spawn();
        let notif = fx.shared_notification(proc, peer);

        let (tid, _) = fx
            .table
            .create_thread(&mut fx.alloc, &mut fx.caps, proc, VirtAddr(0x2_0000), 0)
            .unwrap();
        fx.sched.schedule(&mut fx.table);

        let outcome = wait_notification(
            &mut fx.caps,
            &mut fx.table,
            &mut fx.sched,
            proc,
            Some(tid),
            notif,
            9,
        )
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Blocked);
        // The main thread keeps the process runnable.
        assert_ne!(fx.table.get(proc).unwrap().state, TaskState::Blocked);
        assert!(fx.table.get(proc).unwrap().has_ready_threads());

        notification_set(&mut fx.caps, &mut fx.table, &mut fx.sched, peer, notif, 9).unwrap();
        // The woken thread is back in the rotation.
        let p = fx.table.get_mut(proc).unwrap();
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..3 {
            seen.push(p.next_ready_thread().unwrap());
        }
        assert!(seen.contains(&tid));
    }

    #[test]
    fn wait_without_check_permission_is_refused() {
        let mut fx = fixture();
        let owner = fx.spawn();
        let restricted = fx.spawn();
        let notif = fx.shared_notification(owner, restricted);

        // Strip the restricted process's copy down to set-only rights.
        let restricted_holder = fx.table.get(restricted).unwrap().holder;
        let cap = fx.caps.access(restricted_holder, notif).unwrap();
        let mut bitmap = [0u64; 12];
        for word in bitmap.iter_mut().take(4) {
            *word = u64::MAX; // set region only
        }
        fx.caps
            .downgrade(
                cap,
                crate::cap::PermissionBits::with_bitmap(
                    0,
                    &bitmap,
                    crate::cap::PayloadType::Notification,
                ),
            )
            .unwrap();

        let err = wait_notification(
            &mut fx.caps,
            &mut fx.table,
            &mut fx.sched,
            restricted,
            None,
            notif,
            1,
        )
        .unwrap_err();
        assert_eq!(err, CapError::InsufficientPermissions);
    }
}
