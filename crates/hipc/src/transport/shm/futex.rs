// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Linux futex wrapper for inter-process synchronization.
//!
//! Uses `FUTEX_WAIT` and `FUTEX_WAKE` (NOT the `_PRIVATE` variants): the
//! private variants only work within a single process and silently fail to
//! wake waiters in other processes mapped to the same memfile.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1;

/// Wait until `*addr != expected`, a wake arrives, or the timeout expires.
///
/// Returns 0 on wake (or spurious wakeup), -1 with `EAGAIN` when the value
/// already differs, -1 with `ETIMEDOUT` on timeout.
///
/// For inter-process use `addr` must live in shared memory.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(d.subsec_nanos()),
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the call;
    // FUTEX_WAIT (shared, not private) with a null or valid timespec.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            std::ptr::from_ref(addr).cast::<u32>(),
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on `addr`.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: addr is a live reference; FUTEX_WAKE takes no timeout.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            std::ptr::from_ref(addr).cast::<u32>(),
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake every waiter.
#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}

// Non-Linux fallback: bounded sleep instead of a real wait.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> i32 {
    let sleep_time = timeout.unwrap_or(Duration::from_millis(1));
    std::thread::sleep(sleep_time.min(Duration::from_millis(10)));
    0
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_all(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wake_without_waiters_is_harmless() {
        let val = AtomicU32::new(0);
        assert!(futex_wake(&val, 1) >= 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_returns_on_value_mismatch() {
        let val = AtomicU32::new(42);
        let result = futex_wait(&val, 0, Some(Duration::from_millis(100)));
        assert_eq!(result, -1);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_times_out() {
        let val = AtomicU32::new(7);
        let start = std::time::Instant::now();
        let _ = futex_wait(&val, 7, Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wake_releases_waiter() {
        let val = Arc::new(AtomicU32::new(0));
        let val_clone = Arc::clone(&val);

        let handle = thread::spawn(move || {
            while val_clone.load(Ordering::Acquire) == 0 {
                futex_wait(&val_clone, 0, Some(Duration::from_secs(1)));
            }
            val_clone.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(10));
        val.store(9, Ordering::Release);
        futex_wake_all(&val);

        assert_eq!(handle.join().expect("waiter thread"), 9);
    }
}
