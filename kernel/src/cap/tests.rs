//! Capability system tests
//!
//! End-to-end coverage of the capability store: creation and access, clone
//! and migrate semantics, permission downgrade policy, revocation cascades,
//! receive-space gating, and the client/server accessor handshake.

#![cfg(all(test, not(target_os = "none")))]

use super::object::testobj;
use super::permission::basic;
use super::*;

fn two_holders() -> (CapSystem, HolderId, HolderId) {
    let mut caps = CapSystem::new();
    let h0 = caps.create_holder();
    let h1 = caps.create_holder();
    (caps, h0, h1)
}

fn new_test_object(caps: &mut CapSystem, holder: HolderId, value: i64) -> (CapIdx, CapNodeId) {
    let csa = caps.holder(holder).unwrap().csa_idx();
    let idx = caps.csa_alloc_slot(holder, csa).unwrap();
    let node = caps
        .csa_create(holder, csa, idx, Payload::Test(TestObject::new(value)))
        .unwrap();
    (idx, node)
}

mod creation {
    use super::*;

    #[test]
    fn holders_bootstrap_their_accessor() {
        let (caps, h0, h1) = two_holders();
        assert_ne!(h0, h1);
        let csa0 = caps.holder(h0).unwrap().csa_idx();
        assert_eq!(csa0, CapIdx::major(0, 0));
        let cap = caps.access(h0, csa0).unwrap();
        assert!(caps.node(cap).unwrap().is_root());
        assert!(matches!(
            caps.payload(cap).unwrap(),
            Payload::SpaceAccessor(r) if *r == SpaceRef::major(h0, 0)
        ));
    }

    #[test]
    fn create_and_read_back() {
        let (mut caps, h0, _) = two_holders();
        let csa = caps.holder(h0).unwrap().csa_idx();

        let idx = caps.csa_alloc_slot(h0, csa).unwrap();
        // Slot (0, 0) belongs to the accessor, so the first free one is
        // (0, 1).
        assert_eq!(idx, CapIdx::major(0, 1));

        let node = caps
            .csa_create(h0, csa, idx, Payload::Test(TestObject::new(12345)))
            .unwrap();
        assert_eq!(caps.test_read(node).unwrap(), 12345);
        assert_eq!(caps.access(h0, idx).unwrap(), node);
    }

    #[test]
    fn occupied_slot_refuses_creation() {
        let (mut caps, h0, _) = two_holders();
        let (idx, _) = new_test_object(&mut caps, h0, 1);
        let csa = caps.holder(h0).unwrap().csa_idx();
        let err = caps
            .csa_create(h0, csa, idx, Payload::Test(TestObject::new(2)))
            .unwrap_err();
        assert_eq!(err, CapError::SlotBusy);
    }

    #[test]
    fn lookup_through_missing_levels_fails() {
        let (caps, h0, _) = two_holders();
        // Group never created.
        assert_eq!(
            caps.access(h0, CapIdx::major(17, 3)).unwrap_err(),
            CapError::InvalidIndex
        );
        // Slot beyond the group's capacity.
        assert_eq!(
            caps.access(h0, CapIdx::major(0, 64)).unwrap_err(),
            CapError::InvalidIndex
        );
        // Null and error indices never resolve.
        assert_eq!(
            caps.access(h0, CapIdx::NULL).unwrap_err(),
            CapError::InvalidIndex
        );
        assert_eq!(
            caps.access(h0, CapIdx::error()).unwrap_err(),
            CapError::InvalidIndex
        );
    }
}

mod clone_and_migrate {
    use super::*;

    #[test]
    fn clone_shares_the_payload() {
        let (mut caps, h0, _) = two_holders();
        let (idx, node) = new_test_object(&mut caps, h0, 12345);
        let csa = caps.holder(h0).unwrap().csa_idx();

        let idx2 = caps.csa_alloc_slot(h0, csa).unwrap();
        assert_eq!(idx2, CapIdx::major(0, 2));
        let clone = caps.csa_clone(h0, csa, idx2, SpaceRef::major(h0, 0), idx).unwrap();

        assert_eq!(caps.test_read(clone).unwrap(), 12345);
        // One payload, two nodes: a write through either is seen by both.
        caps.test_increase(clone).unwrap();
        assert_eq!(caps.test_read(node).unwrap(), 12346);
        assert!(!caps.node(clone).unwrap().is_root());
        assert_eq!(caps.node(clone).unwrap().parent(), Some(node));
    }

    #[test]
    fn clone_without_clone_permission_fails() {
        let (mut caps, h0, _) = two_holders();
        let (idx, node) = new_test_object(&mut caps, h0, 5);
        caps.downgrade(node, PermissionBits::new(testobj::READ, PayloadType::TestObject))
            .unwrap();
        let err = caps
            .clone_into(SpaceRef::major(h0, 0), CapIdx::major(1, 0), node, None)
            .unwrap_err();
        assert_eq!(err, CapError::InsufficientPermissions);
        let _ = idx;
    }

    #[test]
    fn clone_cannot_exceed_the_parent() {
        let (mut caps, h0, _) = two_holders();
        let (_, node) = new_test_object(&mut caps, h0, 5);
        caps.downgrade(
            node,
            PermissionBits::new(basic::CLONE | testobj::READ, PayloadType::TestObject),
        )
        .unwrap();

        let too_much = PermissionBits::new(
            basic::CLONE | testobj::READ | testobj::WRITE,
            PayloadType::TestObject,
        );
        let err = caps
            .clone_into(SpaceRef::major(h0, 0), CapIdx::major(1, 0), node, Some(too_much))
            .unwrap_err();
        assert_eq!(err, CapError::InsufficientPermissions);

        // A subset is fine.
        let subset = PermissionBits::new(testobj::READ, PayloadType::TestObject);
        let child = caps
            .clone_into(SpaceRef::major(h0, 0), CapIdx::major(1, 0), node, Some(subset))
            .unwrap();
        assert_eq!(caps.test_read(child).unwrap(), 5);
        assert_eq!(
            caps.test_increase(child).unwrap_err(),
            CapError::InsufficientPermissions
        );
    }

    #[test]
    fn migrate_clears_the_source_slot() {
        let (mut caps, h0, h1) = two_holders();
        let (idx, node) = new_test_object(&mut caps, h0, 12345);

        let dst = CapIdx::major(0, 1);
        caps.migrate_into(SpaceRef::major(h1, 0), dst, node).unwrap();

        assert_eq!(
            caps.get(SpaceRef::major(h0, 0), idx).unwrap_err(),
            CapError::InvalidIndex
        );
        let moved = caps.get(SpaceRef::major(h1, 0), dst).unwrap();
        assert_eq!(moved, node);
        assert_eq!(caps.test_read(moved).unwrap(), 12345);
    }

    #[test]
    fn migrate_round_trip_restores_everything() {
        let (mut caps, h0, h1) = two_holders();
        let (parent_idx, parent) = new_test_object(&mut caps, h0, 9);
        let child_idx = CapIdx::major(2, 4);
        let child = caps
            .clone_into(SpaceRef::major(h0, 0), child_idx, parent, None)
            .unwrap();
        let perm_before = caps.node(child).unwrap().perm().clone();

        let away = CapIdx::major(7, 7);
        caps.migrate_into(SpaceRef::major(h1, 0), away, child).unwrap();
        caps.migrate_into(SpaceRef::major(h0, 0), child_idx, child).unwrap();

        // Same slot, same derivation links, same permissions.
        assert_eq!(caps.get(SpaceRef::major(h0, 0), child_idx).unwrap(), child);
        assert_eq!(
            caps.get(SpaceRef::major(h1, 0), away).unwrap_err(),
            CapError::InvalidIndex
        );
        assert_eq!(caps.node(child).unwrap().parent(), Some(parent));
        assert_eq!(*caps.node(child).unwrap().perm(), perm_before);
        assert_eq!(caps.get(SpaceRef::major(h0, 0), parent_idx).unwrap(), parent);
    }

    #[test]
    fn migrate_into_an_occupied_slot_fails_cleanly() {
        let (mut caps, h0, h1) = two_holders();
        let (idx, node) = new_test_object(&mut caps, h0, 1);
        let blocker = CapIdx::major(0, 1);
        new_test_object(&mut caps, h1, 2); // lands at (0, 1) of h1

        let err = caps
            .migrate_into(SpaceRef::major(h1, 0), blocker, node)
            .unwrap_err();
        assert_eq!(err, CapError::SlotBusy);
        // The source is untouched.
        assert_eq!(caps.get(SpaceRef::major(h0, 0), idx).unwrap(), node);
    }
}

mod downgrade {
    use super::*;

    #[test]
    fn read_only_then_nothing() {
        let (mut caps, h0, h1) = two_holders();
        let (_, node) = new_test_object(&mut caps, h0, 12345);
        caps.migrate_into(SpaceRef::major(h1, 0), CapIdx::major(0, 1), node)
            .unwrap();

        caps.downgrade(node, PermissionBits::new(testobj::READ, PayloadType::TestObject))
            .unwrap();
        assert_eq!(
            caps.test_increase(node).unwrap_err(),
            CapError::InsufficientPermissions
        );
        assert_eq!(caps.test_read(node).unwrap(), 12345);

        caps.downgrade(node, PermissionBits::none(PayloadType::TestObject))
            .unwrap();
        assert_eq!(
            caps.test_read(node).unwrap_err(),
            CapError::InsufficientPermissions
        );
    }

    #[test]
    fn downgrade_refuses_type_changes() {
        let (mut caps, h0, _) = two_holders();
        let (_, node) = new_test_object(&mut caps, h0, 1);
        let err = caps
            .downgrade(node, PermissionBits::none(PayloadType::Notification))
            .unwrap_err();
        assert_eq!(err, CapError::TypeNotMatched);
    }

    #[test]
    fn clone_then_downgrade_to_self_equals_clone() {
        let (mut caps, h0, _) = two_holders();
        let (_, parent) = new_test_object(&mut caps, h0, 3);

        let a = caps
            .clone_into(SpaceRef::major(h0, 0), CapIdx::major(3, 0), parent, None)
            .unwrap();
        let b = caps
            .clone_into(SpaceRef::major(h0, 0), CapIdx::major(3, 1), parent, None)
            .unwrap();
        let self_perm = caps.node(b).unwrap().perm().clone();
        caps.downgrade(b, self_perm).unwrap();

        assert_eq!(caps.node(a).unwrap().perm(), caps.node(b).unwrap().perm());
    }
}

mod revoke {
    use super::*;

    #[test]
    fn removing_a_branch_destroys_its_descendants_only() {
        let (mut caps, h0, h1) = two_holders();
        let space0 = SpaceRef::major(h0, 0);
        let space1 = SpaceRef::major(h1, 0);

        let (root_idx, root) = new_test_object(&mut caps, h0, 999);
        let keep_idx = CapIdx::major(4, 0);
        let keep = caps.clone_into(space0, keep_idx, root, None).unwrap();
        let a_idx = CapIdx::major(4, 1);
        let a = caps.clone_into(space0, a_idx, root, None).unwrap();
        let b_idx = CapIdx::major(4, 2);
        let b = caps.clone_into(space0, b_idx, a, None).unwrap();
        // The grandchild lives in another holder.
        let c_idx = CapIdx::major(0, 1);
        let c = caps.clone_into(space1, c_idx, b, None).unwrap();

        caps.remove_at(space0, a_idx).unwrap();

        for (space, idx) in [(space0, a_idx), (space0, b_idx), (space1, c_idx)] {
            assert_eq!(caps.get(space, idx).unwrap_err(), CapError::InvalidIndex);
        }
        for node in [a, b, c] {
            assert_eq!(caps.node(node).unwrap_err(), CapError::InvalidCapability);
        }
        // The root and the untouched sibling survive, payload intact.
        assert_eq!(caps.get(space0, root_idx).unwrap(), root);
        assert_eq!(caps.get(space0, keep_idx).unwrap(), keep);
        assert_eq!(caps.test_read(keep).unwrap(), 999);
    }

    #[test]
    fn removing_the_root_destroys_the_payload() {
        let (mut caps, h0, _) = two_holders();
        let space0 = SpaceRef::major(h0, 0);
        let (root_idx, root) = new_test_object(&mut caps, h0, 7);
        let child = caps
            .clone_into(space0, CapIdx::major(5, 0), root, None)
            .unwrap();

        caps.remove_at(space0, root_idx).unwrap();
        assert_eq!(caps.node(root).unwrap_err(), CapError::InvalidCapability);
        assert_eq!(caps.node(child).unwrap_err(), CapError::InvalidCapability);
    }

    #[test]
    fn holder_teardown_revokes_derived_caps_elsewhere() {
        let (mut caps, h0, h1) = two_holders();
        let (_, root) = new_test_object(&mut caps, h0, 11);
        let lent = caps
            .clone_into(SpaceRef::major(h1, 0), CapIdx::major(0, 1), root, None)
            .unwrap();
        assert_eq!(caps.test_read(lent).unwrap(), 11);

        caps.destroy_holder(h0);
        assert_eq!(caps.node(lent).unwrap_err(), CapError::InvalidCapability);
        assert!(caps.holder(h0).is_err());
        // The borrower itself is unaffected.
        assert!(caps.holder(h1).is_ok());
    }

    #[test]
    fn tidyup_releases_emptied_groups() {
        let (mut caps, h0, _) = two_holders();
        let space0 = SpaceRef::major(h0, 0);
        let idx = CapIdx::major(9, 3);
        caps.create_in(space0, idx, Payload::Test(TestObject::new(1)))
            .unwrap();
        caps.remove_at(space0, idx).unwrap();

        caps.holder_mut(h0).unwrap().tidyup();
        // The group is gone; creating there again works from scratch.
        assert_eq!(caps.get(space0, idx).unwrap_err(), CapError::InvalidIndex);
        caps.create_in(space0, idx, Payload::Test(TestObject::new(2)))
            .unwrap();
    }
}

mod accessor {
    use super::*;

    #[test]
    fn alloc_slot_requires_the_alloc_bit() {
        let (mut caps, h0, _) = two_holders();
        let csa = caps.holder(h0).unwrap().csa_idx();
        let cap = caps.access(h0, csa).unwrap();

        // Full windows, but no ALLOC in the basic word.
        caps.downgrade(
            cap,
            PermissionBits::with_bitmap(
                basic::UNWRAP | basic::CLONE | basic::MIGRATE,
                &[u64::MAX; 64],
                PayloadType::SpaceAccessor,
            ),
        )
        .unwrap();

        assert_eq!(
            caps.csa_alloc_slot(h0, csa).unwrap_err(),
            CapError::InsufficientPermissions
        );
    }

    #[test]
    fn window_bits_gate_each_operation() {
        let (mut caps, h0, _) = two_holders();
        let csa = caps.holder(h0).unwrap().csa_idx();
        let cap = caps.access(h0, csa).unwrap();

        // INSERT on group 2 only; no READ or REMOVE anywhere.
        let mut perm = PermissionBits::new(u64::MAX, PayloadType::SpaceAccessor);
        perm.set_window(csa::window_offset(2), csa::SLOT_BITS, csa::SLOT_INSERT);
        caps.downgrade(cap, perm).unwrap();

        let ok_idx = CapIdx::major(2, 0);
        caps.csa_create(h0, csa, ok_idx, Payload::Test(TestObject::new(1)))
            .unwrap();
        assert_eq!(
            caps.csa_create(h0, csa, CapIdx::major(3, 0), Payload::Test(TestObject::new(2)))
                .unwrap_err(),
            CapError::InsufficientPermissions
        );
        assert_eq!(
            caps.csa_get(h0, csa, ok_idx).unwrap_err(),
            CapError::InsufficientPermissions
        );
        assert_eq!(
            caps.csa_remove(h0, csa, ok_idx).unwrap_err(),
            CapError::InsufficientPermissions
        );
    }

    #[test]
    fn cloning_an_unshared_group_strips_its_window() {
        let (mut caps, h0, _) = two_holders();
        let csa = caps.holder(h0).unwrap().csa_idx();
        let root = caps.access(h0, csa).unwrap();

        // Group 6: full window including SHARE. Group 7: everything but
        // SHARE.
        let mut perm = PermissionBits::new(u64::MAX, PayloadType::SpaceAccessor);
        perm.set_window(
            csa::window_offset(6),
            csa::SLOT_BITS,
            csa::SLOT_READ | csa::SLOT_INSERT | csa::SLOT_REMOVE | csa::SLOT_SHARE,
        );
        perm.set_window(
            csa::window_offset(7),
            csa::SLOT_BITS,
            csa::SLOT_READ | csa::SLOT_INSERT | csa::SLOT_REMOVE,
        );
        caps.downgrade(root, perm).unwrap();

        let child = caps
            .clone_into(SpaceRef::major(h0, 0), CapIdx::major(6, 0), root, None)
            .unwrap();
        let child_perm = caps.node(child).unwrap().perm().clone();
        // The shared group survives the clone, the unshared one is cleared.
        assert_eq!(
            child_perm.window(csa::window_offset(6), csa::SLOT_BITS),
            csa::SLOT_READ | csa::SLOT_INSERT | csa::SLOT_REMOVE | csa::SLOT_SHARE
        );
        assert_eq!(child_perm.window(csa::window_offset(7), csa::SLOT_BITS), 0);
    }
}

mod recv_space {
    use super::*;

    #[test]
    fn migration_needs_the_armed_sender() {
        let (mut caps, h0, h1) = two_holders();
        let h2 = caps.create_holder();
        let (_, node) = new_test_object(&mut caps, h0, 24680);
        let recv1 = SpaceRef::recv(h1, 0);
        let dst = CapIdx::recv(3, 0);

        // Unarmed: refused.
        assert_eq!(
            caps.migrate_into(recv1, dst, node).unwrap_err(),
            CapError::InvalidIndex
        );

        // Armed for the wrong sender: still refused.
        caps.recv_set_sender(h1, 0, 3, h1).unwrap();
        assert_eq!(
            caps.migrate_into(recv1, dst, node).unwrap_err(),
            CapError::InvalidIndex
        );

        // Armed for the right sender: accepted, readable through access().
        caps.recv_set_sender(h1, 0, 3, h0).unwrap();
        caps.migrate_into(recv1, dst, node).unwrap();
        let received = caps.access(h1, dst).unwrap();
        assert_eq!(caps.test_read(received).unwrap(), 24680);

        // A third holder is not the armed sender for this group.
        let (_, intruder) = new_test_object(&mut caps, h2, 1);
        assert_eq!(
            caps.migrate_into(recv1, CapIdx::recv(3, 1), intruder)
                .unwrap_err(),
            CapError::InvalidIndex
        );
    }

    #[test]
    fn service_handshake_round_trip() {
        // Client h0, server h1. The client hands the server a downgraded
        // accessor over one group of its space plus a request object; the
        // server answers through that accessor.
        let (mut caps, client, server) = two_holders();
        let client_space = SpaceRef::major(client, 0);
        const GROUP: u16 = 900;

        // Client: clone its root accessor and cut it down to "insert into
        // group 900" plus ALLOC, keeping the generic bits that let the
        // capability travel.
        let client_csa = caps.holder(client).unwrap().csa_idx();
        let subset_idx = caps.csa_alloc_slot(client, client_csa).unwrap();
        let subset = caps
            .csa_clone(client, client_csa, subset_idx, client_space, client_csa)
            .unwrap();
        let mut subset_perm = PermissionBits::new(
            basic::UNWRAP | basic::MIGRATE | csa::ALLOC,
            PayloadType::SpaceAccessor,
        );
        subset_perm.set_window(csa::window_offset(GROUP), csa::SLOT_BITS, csa::SLOT_INSERT);
        caps.downgrade(subset, subset_perm).unwrap();

        // Client: request object.
        let req_idx = caps.csa_alloc_slot(client, client_csa).unwrap();
        caps.csa_create(
            client,
            client_csa,
            req_idx,
            Payload::Test(TestObject::new(13579)),
        )
        .unwrap();

        // Server arms its receive space for this client; the client
        // migrates the accessor subset and the request in.
        caps.recv_set_sender(server, 0, GROUP, client).unwrap();
        let recv = SpaceRef::recv(server, 0);
        let recv_csa = CapIdx::recv(GROUP, 0);
        let recv_req = CapIdx::recv(GROUP, 1);
        caps.migrate_into(recv, recv_csa, subset).unwrap();
        let req_node = caps.get(client_space, req_idx).unwrap();
        caps.migrate_into(recv, recv_req, req_node).unwrap();

        // Server: read the request through the receive space.
        let request = caps.access(server, recv_req).unwrap();
        assert_eq!(caps.test_read(request).unwrap(), 13579);

        // Server: answer through the received accessor, into the one group
        // the client opened.
        let reply_idx = caps.csa_alloc_slot(server, recv_csa).unwrap();
        assert_eq!(reply_idx.group(), GROUP);
        caps.csa_create(
            server,
            recv_csa,
            reply_idx,
            Payload::Test(TestObject::new(24680)),
        )
        .unwrap();
        // Other groups of the client's space stay closed.
        assert_eq!(
            caps.csa_create(
                server,
                recv_csa,
                CapIdx::major(5, 0),
                Payload::Test(TestObject::new(0))
            )
            .unwrap_err(),
            CapError::InsufficientPermissions
        );

        // Client: pick up the reply from its own space.
        let reply = caps.get(client_space, reply_idx).unwrap();
        assert_eq!(caps.test_read(reply).unwrap(), 24680);
    }
}
