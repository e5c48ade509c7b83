// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Runtime lifecycle: explicit runtime value plus the process-local cell.
//!
//! The [`Runtime`] owns the DescGate, the registration bus and the worker
//! pools; every entity holds an `Arc<Runtime>` (no global singletons in
//! the object graph). The classic `initialize`/`finalize` API is a thin
//! reference-counted wrapper storing the runtime in a process-local cell:
//! double-initialize reports "already initialized" and never aborts; the
//! final finalize stops the bus and joins every executor.

use crate::config::Configuration;
use crate::core::process;
use crate::core::threadpool::DynamicThreadPool;
use crate::error::{Error, Result};
use crate::registration::{DescGate, RegistrationBus, RegistrationProvider};
use parking_lot::Mutex;
use std::sync::Arc;

/// Subsystems started at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Components {
    pub pubsub: bool,
    pub service: bool,
    pub monitoring: bool,
}

impl Default for Components {
    fn default() -> Self {
        Self {
            pubsub: true,
            service: true,
            monitoring: false,
        }
    }
}

impl Components {
    pub fn all() -> Self {
        Self {
            pubsub: true,
            service: true,
            monitoring: true,
        }
    }
}

/// Explicit runtime value owning all process-wide communication state.
pub struct Runtime {
    unit_name: String,
    config: Configuration,
    components: Components,
    descgate: Arc<DescGate>,
    bus: RegistrationBus,
    /// Service dispatch and async call execution.
    service_pool: Arc<DynamicThreadPool>,
    /// TCP reader executors (bounded by configuration).
    reader_pool: Arc<DynamicThreadPool>,
    /// TCP writer executors (bounded by configuration).
    writer_pool: Arc<DynamicThreadPool>,
    host_name: String,
    process_id: i32,
}

impl Runtime {
    /// Build and start a runtime. Fails on invalid configuration only;
    /// registration transports that cannot start disable themselves.
    pub fn new(unit_name: &str, components: Components, config: Configuration) -> Result<Arc<Self>> {
        config.validate()?;

        let unit_name = if unit_name.is_empty() {
            process::process_name()
        } else {
            unit_name.to_string()
        };

        let descgate = Arc::new(DescGate::new());
        let bus = RegistrationBus::start(Arc::clone(&descgate), &config);

        let reader_pool =
            DynamicThreadPool::with_max_size(config.transport.tcp.number_executor_reader);
        let writer_pool =
            DynamicThreadPool::with_max_size(config.transport.tcp.number_executor_writer);

        log::info!("[RT] runtime initialized, unit {:?}", unit_name);
        Ok(Arc::new(Self {
            unit_name,
            config,
            components,
            descgate,
            bus,
            service_pool: DynamicThreadPool::new(),
            reader_pool,
            writer_pool,
            host_name: process::host_name(),
            process_id: process::process_id(),
        }))
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn components(&self) -> Components {
        self.components
    }

    pub fn descgate(&self) -> &Arc<DescGate> {
        &self.descgate
    }

    pub fn provider(&self) -> &Arc<RegistrationProvider> {
        self.bus.provider()
    }

    pub fn service_pool(&self) -> &Arc<DynamicThreadPool> {
        &self.service_pool
    }

    pub fn reader_pool(&self) -> &Arc<DynamicThreadPool> {
        &self.reader_pool
    }

    pub fn writer_pool(&self) -> &Arc<DynamicThreadPool> {
        &self.writer_pool
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Stop the registration bus and join every executor. In-flight
    /// callbacks finish before this returns.
    pub fn shutdown(&self) {
        self.bus.stop();
        self.service_pool.shutdown();
        self.reader_pool.shutdown();
        self.writer_pool.shutdown();
        self.service_pool.join();
        self.reader_pool.join();
        self.writer_pool.join();
        log::info!("[RT] runtime finalized, unit {:?}", self.unit_name);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Shutdown is idempotent; this covers runtimes that never went
        // through finalize (explicit Runtime values in tests).
        self.shutdown();
    }
}

// =======================================================================
// Process-local cell (classic Initialize/Finalize surface)
// =======================================================================

struct ProcessContext {
    runtime: Arc<Runtime>,
    ref_count: usize,
}

static CONTEXT: Mutex<Option<ProcessContext>> = Mutex::new(None);

/// Initialize the process-local runtime with defaults.
///
/// Returns false when the runtime was already initialized (the reference
/// count still goes up) or when construction failed.
pub fn initialize(unit_name: &str) -> bool {
    initialize_with(unit_name, Components::default(), Configuration::default())
}

/// Initialize with explicit components and configuration.
pub fn initialize_with(unit_name: &str, components: Components, config: Configuration) -> bool {
    let mut context = CONTEXT.lock();
    if let Some(ctx) = context.as_mut() {
        ctx.ref_count += 1;
        log::debug!("[RT] already initialized (ref count {})", ctx.ref_count);
        return false;
    }
    match Runtime::new(unit_name, components, config) {
        Ok(runtime) => {
            *context = Some(ProcessContext {
                runtime,
                ref_count: 1,
            });
            true
        }
        Err(e) => {
            log::error!("[RT] initialization failed: {}", e);
            false
        }
    }
}

/// Decrement the reference count; the last finalize shuts the runtime
/// down. Returns false when nothing was initialized.
pub fn finalize() -> bool {
    let runtime = {
        let mut context = CONTEXT.lock();
        let Some(ctx) = context.as_mut() else {
            return false;
        };
        ctx.ref_count -= 1;
        if ctx.ref_count > 0 {
            return true;
        }
        context.take().map(|c| c.runtime)
    };
    if let Some(runtime) = runtime {
        runtime.shutdown();
    }
    true
}

/// Whether the process-local runtime is up.
pub fn is_initialized() -> bool {
    CONTEXT.lock().is_some()
}

/// Health check: initialized and not shutting down.
pub fn ok() -> bool {
    is_initialized()
}

/// Unit name passed to (or derived at) initialization.
pub fn unit_name() -> Option<String> {
    CONTEXT
        .lock()
        .as_ref()
        .map(|c| c.runtime.unit_name().to_string())
}

/// The current runtime, for entity construction.
pub(crate) fn current_runtime() -> Result<Arc<Runtime>> {
    CONTEXT
        .lock()
        .as_ref()
        .map(|c| Arc::clone(&c.runtime))
        .ok_or(Error::NotInitialized)
}
