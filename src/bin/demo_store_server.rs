// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Standalone rendezvous store server.
//
// Usage:
//   demo_store_server [listen_ip] [port]
//
// Runs until interrupted. Log verbosity follows RUST_LOG (or
// SHMEM_LOG_LEVEL / ASCEND_MF_LOG_LEVEL, 0..3 = debug/info/warn/error).

use std::thread;
use std::time::Duration;

use libsmem::StoreServer;

fn log_filter() -> String {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return filter;
    }
    let numeric = std::env::var("SHMEM_LOG_LEVEL")
        .or_else(|_| std::env::var("ASCEND_MF_LOG_LEVEL"))
        .ok();
    match numeric.as_deref() {
        Some("0") => "debug",
        Some("2") => "warn",
        Some("3") => "error",
        _ => "info",
    }
    .to_string()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_filter()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let ip = args.get(1).map(String::as_str).unwrap_or("0.0.0.0");
    let port: u16 = args
        .get(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(5432);

    let server = match StoreServer::start(ip, port, u32::MAX) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("start store server on {ip}:{port} failed: {e}");
            std::process::exit(1);
        }
    };
    println!("store server listening on {ip}:{}", server.port());

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
