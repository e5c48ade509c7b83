// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Service plane end-to-end tests: mirror echo/reverse semantics,
//! timeout behavior of the blocking and callback call variants, unknown
//! methods, and instance discovery.

use hipc::service::ServiceEvent;
use hipc::{CallState, MethodInformation, ServiceClient, ServiceServer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn unique_service(tag: &str) -> String {
    format!("{}_{}_{}", tag, std::process::id(), fastrand::u32(..))
}

fn wait_until(pred: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

/// Mirror server: echo returns the request verbatim, reverse reverses it.
fn start_mirror(service_name: &str) -> ServiceServer {
    let server = ServiceServer::new(service_name).expect("server");
    server.set_method_callback(
        MethodInformation::untyped("echo"),
        Arc::new(|request| Ok(request.to_vec())),
    );
    server.set_method_callback(
        MethodInformation::untyped("reverse"),
        Arc::new(|request| {
            let mut reversed = request.to_vec();
            reversed.reverse();
            Ok(reversed)
        }),
    );
    server
}

#[test]
fn mirror_echo_and_reverse() {
    hipc::initialize("clientserver_mirror");

    let service = unique_service("mirror");
    let _server = start_mirror(&service);

    let client = ServiceClient::new(&service).expect("client");
    assert!(wait_until(|| client.is_connected(), Duration::from_secs(2)));

    let instances = client.client_instances();
    assert_eq!(instances.len(), 1);

    let echoed = instances[0].call_with_response("echo", b"stressed", Some(Duration::from_secs(5)));
    assert_eq!(echoed.call_state, CallState::Executed);
    assert_eq!(echoed.response, b"stressed");
    assert!(echoed.error_msg.is_empty());

    let reversed =
        instances[0].call_with_response("reverse", b"stressed", Some(Duration::from_secs(5)));
    assert_eq!(reversed.call_state, CallState::Executed);
    assert_eq!(reversed.response, b"desserts");

    hipc::finalize();
}

#[test]
fn blocking_call_times_out_and_discards_late_response() {
    hipc::initialize("clientserver_timeout");

    let service = unique_service("sleeper");
    let server = ServiceServer::new(&service).expect("server");
    server.set_method_callback(
        MethodInformation::untyped("sleep"),
        Arc::new(|_request| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(b"late".to_vec())
        }),
    );
    server.set_method_callback(
        MethodInformation::untyped("echo"),
        Arc::new(|request| Ok(request.to_vec())),
    );

    let client = ServiceClient::new(&service).expect("client");
    assert!(wait_until(|| client.is_connected(), Duration::from_secs(2)));
    let instances = client.client_instances();

    // Deadline elapses while the server still sleeps.
    let start = Instant::now();
    let response =
        instances[0].call_with_response("sleep", b"x", Some(Duration::from_millis(100)));
    let elapsed = start.elapsed();
    assert_eq!(response.call_state, CallState::Timeouted);
    assert!(
        elapsed >= Duration::from_millis(80) && elapsed <= Duration::from_millis(300),
        "timeout returned after {elapsed:?}"
    );

    // Wait past the server's sleep: its late response must be discarded,
    // not delivered to the next call on the same session.
    std::thread::sleep(Duration::from_millis(600));
    let echoed = instances[0].call_with_response("echo", b"ok", Some(Duration::from_secs(5)));
    assert_eq!(echoed.call_state, CallState::Executed);
    assert_eq!(echoed.response, b"ok");

    hipc::finalize();
}

#[test]
fn callback_variant_reports_timeout() {
    hipc::initialize("clientserver_cb_timeout");

    let service = unique_service("cb_sleeper");
    let server = ServiceServer::new(&service).expect("server");
    server.set_method_callback(
        MethodInformation::untyped("sleep"),
        Arc::new(|_request| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        }),
    );

    let client = ServiceClient::new(&service).expect("client");
    assert!(wait_until(|| client.is_connected(), Duration::from_secs(2)));

    // The callback still runs for a timed-out call.
    let states: Arc<Mutex<Vec<CallState>>> = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&states);
    client
        .call_with_callback(
            "sleep",
            b"x",
            move |response| {
                store.lock().push(response.call_state);
            },
            Some(Duration::from_millis(100)),
        )
        .expect("call");

    assert_eq!(*states.lock(), vec![CallState::Timeouted]);

    hipc::finalize();
}

#[test]
fn timeout_event_fires_once_per_request() {
    hipc::initialize("clientserver_timeout_event");

    let service = unique_service("ev_sleeper");
    let server = ServiceServer::new(&service).expect("server");
    server.set_method_callback(
        MethodInformation::untyped("sleep"),
        Arc::new(|_request| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Vec::new())
        }),
    );

    let client = ServiceClient::new(&service).expect("client");
    assert!(wait_until(|| client.is_connected(), Duration::from_secs(2)));

    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&timeouts);
    client.add_event_callback(Arc::new(move |event| {
        if matches!(event, ServiceEvent::Timeout(_)) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let instances = client.client_instances();
    let response = instances[0].call_with_response("sleep", b"x", Some(Duration::from_millis(50)));
    assert_eq!(response.call_state, CallState::Timeouted);

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);

    hipc::finalize();
}

#[test]
fn unknown_method_fails() {
    hipc::initialize("clientserver_unknown");

    let service = unique_service("mirror2");
    let _server = start_mirror(&service);

    let client = ServiceClient::new(&service).expect("client");
    assert!(wait_until(|| client.is_connected(), Duration::from_secs(2)));

    let response = client.client_instances()[0].call_with_response(
        "does_not_exist",
        b"",
        Some(Duration::from_secs(5)),
    );
    assert_eq!(response.call_state, CallState::Failed);
    assert!(response.error_msg.contains("not found"));

    hipc::finalize();
}

#[test]
fn client_level_call_aggregates_instances() {
    hipc::initialize("clientserver_aggregate");

    let service = unique_service("multi_mirror");
    let _server_a = start_mirror(&service);
    let _server_b = start_mirror(&service);

    let client = ServiceClient::new(&service).expect("client");
    assert!(wait_until(
        || client.client_instances().len() == 2,
        Duration::from_secs(2)
    ));

    let responses = client
        .call_with_response("echo", b"fanout", Some(Duration::from_secs(5)))
        .expect("aggregate call");
    assert_eq!(responses.len(), 2);
    for response in &responses {
        assert_eq!(response.call_state, CallState::Executed);
        assert_eq!(response.response, b"fanout");
    }

    hipc::finalize();
}

#[test]
fn call_without_server_is_unavailable() {
    hipc::initialize("clientserver_unavailable");

    let service = unique_service("nobody_home");
    let client = ServiceClient::new(&service).expect("client");

    assert!(client.client_instances().is_empty());
    assert!(client
        .call_with_response("echo", b"x", Some(Duration::from_millis(100)))
        .is_err());

    hipc::finalize();
}

#[test]
fn async_callback_runs_on_pool_worker() {
    hipc::initialize("clientserver_async");

    let service = unique_service("async_mirror");
    let _server = start_mirror(&service);

    let client = ServiceClient::new(&service).expect("client");
    assert!(wait_until(|| client.is_connected(), Duration::from_secs(2)));

    let results: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&results);
    let start = Instant::now();
    client.client_instances()[0].call_with_callback_async("echo", b"later", move |response| {
        store.lock().push(response.response.clone());
    });
    // Returned immediately, well before the response can be in.
    assert!(start.elapsed() < Duration::from_millis(50));

    assert!(wait_until(|| !results.lock().is_empty(), Duration::from_secs(5)));
    assert_eq!(results.lock()[0], b"later");

    hipc::finalize();
}
