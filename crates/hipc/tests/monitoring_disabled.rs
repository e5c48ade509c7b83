// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! With the monitoring component not selected, snapshots are refused.
//! Kept in its own binary: component selection is fixed at the first
//! initialize of a process.

use hipc::Error;

#[test]
fn monitoring_disabled_returns_not_available() {
    // Default components: pubsub + service, no monitoring.
    hipc::initialize("monitoring_disabled_test");

    match hipc::get_monitoring() {
        Err(Error::ComponentNotAvailable(which)) => assert_eq!(which, "monitoring"),
        other => panic!("expected ComponentNotAvailable, got {other:?}"),
    }

    hipc::finalize();
}

#[test]
fn monitoring_requires_initialization() {
    // This test may run before or after its sibling; when the runtime is
    // down, the error is NotInitialized instead.
    if !hipc::is_initialized() {
        assert!(matches!(hipc::get_monitoring(), Err(Error::NotInitialized)));
    }
}
