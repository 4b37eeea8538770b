// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for the address grammar: store URLs, transport nics with CIDR
// selection, worker sessions.

use libsmem::net::{analyse_nic, UrlParts, WorkerSession};
use libsmem::ErrCode;

#[test]
fn store_url_parses() {
    let parts = UrlParts::parse("tcp://127.0.0.1:5432").expect("url");
    assert_eq!(parts.ip, "127.0.0.1");
    assert_eq!(parts.port, 5432);

    // Peer names are accepted without the scheme.
    let parts = UrlParts::parse("192.168.1.9:80").expect("bare");
    assert_eq!(parts.ip, "192.168.1.9");
    assert_eq!(parts.port, 80);
}

#[test]
fn store_url_rejects_garbage() {
    for bad in [
        "",
        "tcp://",
        "tcp://localhost:1234",
        "tcp://1.2.3.4",
        "tcp://1.2.3.4:0",
        "tcp://1.2.3.4:70000",
        "tcp://1.2.3.4:abc",
        "999.1.1.1:5",
    ] {
        assert_eq!(
            UrlParts::parse(bad).unwrap_err(),
            ErrCode::InvalidParam,
            "{bad} must be rejected"
        );
    }
}

#[test]
fn nic_plain_forms() {
    for proto in ["tcp", "mte", "roce", "ubc"] {
        let nic = analyse_nic(&format!("{proto}://10.0.0.1:9000")).expect("nic");
        assert_eq!(nic.protocol, format!("{proto}://"));
        assert_eq!(nic.ip, "10.0.0.1");
        assert_eq!(nic.port, 9000);
    }
}

#[test]
fn nic_rejects_unknown_protocol() {
    assert!(analyse_nic("udp://10.0.0.1:9000").is_err());
    assert!(analyse_nic("10.0.0.1:9000").is_err());
    assert!(analyse_nic("tcp://10.0.0.1:0").is_err());
    assert!(analyse_nic("tcp://10.0.0.1/33:9000").is_err());
}

#[test]
fn nic_cidr_selects_loopback() {
    // Every host has 127.0.0.1 on the 127.0.0.0/8 subnet.
    let nic = analyse_nic("tcp://127.0.0.0/8:9000").expect("cidr");
    assert_eq!(nic.ip, "127.0.0.1");
    assert_eq!(nic.port, 9000);
}

#[test]
fn nic_cidr_without_match_fails() {
    // TEST-NET-3 should not be configured on any interface here.
    assert!(analyse_nic("tcp://203.0.113.0/24:9000").is_err());
}

#[test]
fn worker_session_roundtrip() {
    let session = WorkerSession::parse("127.0.0.1:5321").expect("parse");
    assert_eq!(session.address, 0x7F00_0001);
    assert_eq!(session.port, 5321);
    assert_eq!(session.reserved, 0);

    let bytes = session.to_bytes();
    let back = WorkerSession::from_bytes(&bytes).expect("from bytes");
    assert_eq!(back, session);
    assert_eq!(back.session_id(), session.session_id());
}

#[test]
fn worker_session_distinct_ids() {
    let a = WorkerSession::parse("127.0.0.1:5321").expect("a");
    let b = WorkerSession::parse("127.0.0.1:5322").expect("b");
    let c = WorkerSession::parse("127.0.0.2:5321").expect("c");
    assert_ne!(a.session_id(), b.session_id());
    assert_ne!(a.session_id(), c.session_id());
}

#[test]
fn worker_session_rejects_bad_names() {
    assert!(WorkerSession::parse("").is_err());
    assert!(WorkerSession::parse("nohost:1").is_err());
    assert!(WorkerSession::parse("1.2.3.4").is_err());
}
