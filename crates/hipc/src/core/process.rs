// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Process-level helpers: host name, process id, clocks.

use std::time::{SystemTime, UNIX_EPOCH};

/// Host name of this machine.
///
/// Cached after the first call; falls back to `"localhost"` when the
/// system refuses to tell us.
pub fn host_name() -> String {
    use std::sync::OnceLock;
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(read_host_name).clone()
}

#[cfg(unix)]
fn read_host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of 256 bytes; gethostname
    // null-terminates on success and returns -1 on failure (checked below).
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
fn read_host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Operating system process id.
pub fn process_id() -> i32 {
    std::process::id() as i32
}

/// Short name of the running executable.
pub fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| format!("pid-{}", process_id()))
}

/// Microseconds since the Unix epoch.
pub fn clock_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Sleep the calling thread.
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_is_stable() {
        let a = host_name();
        let b = host_name();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn clock_is_monotonic_enough() {
        let a = clock_micros();
        sleep_ms(2);
        let b = clock_micros();
        assert!(b > a);
    }
}
