// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for the entity registry: named dedup, pointer lookup, removal.
// The registry is process-wide, so all tests here share one server.

use std::sync::atomic::{AtomicU16, Ordering};

use libsmem::{EntityManager, ErrCode, TransConfig, TransRole};

static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);

fn unique_port() -> u16 {
    31000 + (std::process::id() % 400) as u16 * 4 + PORT_OFFSET.fetch_add(1, Ordering::Relaxed)
}

fn config() -> TransConfig {
    TransConfig {
        role: TransRole::Receiver,
        start_config_server: true,
        ..TransConfig::default()
    }
}

#[test]
fn create_lookup_remove() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    let name = format!("127.0.0.1:{}", 6000 + port % 100);
    let manager = EntityManager::instance();

    let entity = manager.create_entity(&name, &store_url, config()).expect("create");
    let handle = manager.handle_of(&entity);
    assert_ne!(handle, 0);

    // Both lookups resolve to the same entity.
    let by_name = manager.get_by_name(&name).expect("by name");
    assert_eq!(manager.handle_of(&by_name), handle);
    let by_ptr = manager.get_by_ptr(handle).expect("by ptr");
    assert_eq!(by_ptr.name(), name);

    manager.remove_by_ptr(handle).expect("remove");
    assert_eq!(manager.get_by_name(&name).unwrap_err(), ErrCode::ObjectNotExists);
    assert_eq!(manager.get_by_ptr(handle).unwrap_err(), ErrCode::ObjectNotExists);
    assert_eq!(manager.remove_by_ptr(handle).unwrap_err(), ErrCode::ObjectNotExists);
}

#[test]
fn duplicate_names_rejected() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    let name = format!("127.0.0.1:{}", 6100 + port % 100);
    let manager = EntityManager::instance();

    let _entity = manager.create_entity(&name, &store_url, config()).expect("create");
    assert_eq!(
        manager.create_entity(&name, &store_url, config()).unwrap_err(),
        ErrCode::RepeatCall
    );
    manager.remove_by_name(&name).expect("remove");

    // After removal the name is free again.
    let entity = manager.create_entity(&name, &store_url, config()).expect("recreate");
    manager.remove_by_ptr(manager.handle_of(&entity)).expect("cleanup");
}

#[test]
fn failed_creation_leaves_no_entry() {
    let manager = EntityManager::instance();
    assert_eq!(
        manager
            .create_entity("not-an-address", "tcp://127.0.0.1:1", config())
            .unwrap_err(),
        ErrCode::InvalidParam
    );
    assert_eq!(
        manager.get_by_name("not-an-address").unwrap_err(),
        ErrCode::ObjectNotExists
    );
    // The pending reservation is released, so a retry still fails the same
    // way instead of reporting a duplicate.
    assert_eq!(
        manager
            .create_entity("not-an-address", "tcp://127.0.0.1:1", config())
            .unwrap_err(),
        ErrCode::InvalidParam
    );
}

#[test]
fn unknown_pointer_lookup_fails() {
    assert_eq!(
        EntityManager::instance().get_by_ptr(0xDEAD_BEEF).unwrap_err(),
        ErrCode::ObjectNotExists
    );
}
