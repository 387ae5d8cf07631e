// Copyright 2025 the workhost authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-worker bootstrap and shared state: the plugin registry, the cleanup
//! registry, and the shutting-down flag the HTTP surface consults before
//! accepting new work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};

use crate::cleanup_registry::CleanupRegistry;
use crate::config::WorkerConfig;
use crate::dispatcher::{self, Command, DispatchOutcome};
use crate::error::{Result, WorkhostError};
use crate::plugin::PluginLoader;

const EPHEMERAL_RANGE_LOW: u16 = 9000;
const EPHEMERAL_RANGE_HIGH: u32 = 65535;

pub struct WorkerRuntime {
    pub config: WorkerConfig,
    loader: RwLock<PluginLoader>,
    cleanup_registry: CleanupRegistry,
    shutting_down: AtomicBool,
    pub shutdown_notify: Notify,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        let cleanup_registry = CleanupRegistry::new();
        let loader = PluginLoader::new(config.storage.clone(), cleanup_registry.clone());
        Arc::new(Self {
            config,
            loader: RwLock::new(loader),
            cleanup_registry,
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    pub fn cleanup_registry(&self) -> &CleanupRegistry {
        &self.cleanup_registry
    }

    pub async fn init_plugins(&self) -> Result<()> {
        self.loader.write().await.init().await
    }

    pub async fn is_ready(&self) -> bool {
        self.loader.read().await.is_initialized()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flips the shutting-down flag and wakes the graceful-shutdown future
    /// driving `axum::serve(...).with_graceful_shutdown(...)`.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    pub async fn execute_command(&self, cmd: Command) -> Result<DispatchOutcome> {
        let loader = self.loader.read().await;
        dispatcher::execute_command(&loader, cmd).await
    }

    pub async fn get_public_methods(&self, plugin_name: &str) -> Option<Vec<String>> {
        self.loader.read().await.get_public_methods(plugin_name)
    }

    pub async fn restart(&self, env: Option<std::collections::HashMap<String, String>>) -> Result<()> {
        self.loader.write().await.restart(env).await
    }
}

/// Binds `config.host:config.port`, falling back to a random ephemeral port
/// in `[9000, 65535)` on address-in-use when `config.dynamic_port` allows it.
pub async fn bind_listener(config: &mut WorkerConfig) -> Result<TcpListener> {
    match TcpListener::bind((config.host.as_str(), config.port)).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && config.dynamic_port.is_enabled() => {
            bind_dynamic_port(config).await
        }
        Err(e) => Err(WorkhostError::Io(e)),
    }
}

async fn bind_dynamic_port(config: &mut WorkerConfig) -> Result<TcpListener> {
    loop {
        if !config.dynamic_port.tick() {
            return Err(WorkhostError::Config(
                "dynamic port attempts exhausted".to_string(),
            ));
        }

        let candidate = rand::thread_rng().gen_range(EPHEMERAL_RANGE_LOW as u32..EPHEMERAL_RANGE_HIGH) as u16;
        match TcpListener::bind((config.host.as_str(), candidate)).await {
            Ok(listener) => {
                config.port = candidate;
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(WorkhostError::Io(e)),
        }
    }
}
