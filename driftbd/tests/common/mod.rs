//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;

use driftbd::{Config, DeviceConfig, TimeoutConfig, WireConfig};

pub fn make_backing_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents).unwrap();
    path
}

/// Deadlines shrunk so failure paths resolve in test time rather than
/// operator time.
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        connect_ms: 1_000,
        hello_ms: 1_000,
        request_ms: 2_000,
        retry_delay_ms: 25,
        rebind_retry_ms: 25,
        upstream_ms: 1_000,
    }
}

/// A config over `path` with fast timeouts and small copy chunks, so a
/// tiny device still exercises multi-chunk bulk copies.
pub fn test_config(path: PathBuf) -> Config {
    Config {
        device: DeviceConfig { path },
        serve: Default::default(),
        socket: PathBuf::from("/tmp/driftbd-test-unused.sock"),
        wire: WireConfig {
            max_chunk_bytes: 16 * 1024,
            ..Default::default()
        },
        timeouts: fast_timeouts(),
    }
}
