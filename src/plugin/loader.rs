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

//! Discovers plugin modules under `<storage>/plugins/`, dependency-sorts
//! them, and instantiates them in that order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cleanup_registry::CleanupRegistry;
use crate::config::WebhookConfig;
use crate::dependency_sort;
use crate::error::{Result, WorkhostError};
use crate::plugin::declaration::{Plugin, PluginContext, PluginFactory, PLUGIN_ENTRY_SYMBOL};

#[cfg(target_os = "macos")]
const MODULE_EXT: &str = "dylib";
#[cfg(target_os = "windows")]
const MODULE_EXT: &str = "dll";
#[cfg(all(unix, not(target_os = "macos")))]
const MODULE_EXT: &str = "so";

struct PendingPlugin {
    name: String,
    dependencies: Vec<String>,
    factory: Box<dyn PluginFactory>,
}

pub struct PluginLoader {
    storage: PathBuf,
    cleanup_registry: CleanupRegistry,
    pending: HashMap<String, PendingPlugin>,
    plugins: HashMap<String, Box<dyn Plugin>>,
    order: Vec<String>,
    restarting: AtomicBool,
    initialized: AtomicBool,
    // Keeps the dynamic libraries mapped for as long as their plugin
    // instances are alive; dropping this before the plugins would be UB.
    _libraries: Vec<libloading::Library>,
}

impl PluginLoader {
    /// `cleanup_registry` is the process-wide registry, stable across
    /// restarts; it's handed to every plugin's factory via [`PluginContext`]
    /// rather than read from an ambient global.
    pub fn new(storage: impl Into<PathBuf>, cleanup_registry: CleanupRegistry) -> Self {
        Self {
            storage: storage.into(),
            cleanup_registry,
            pending: HashMap::new(),
            plugins: HashMap::new(),
            order: Vec::new(),
            restarting: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            _libraries: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub fn load_order(&self) -> &[String] {
        &self.order
    }

    /// Loads a single plugin module at `path` and registers its declaration
    /// (dependencies + factory) for the next `init`/`restart` pass.
    /// Instantiation happens later, in dependency order.
    pub fn register_plugin(&mut self, name: &str, path: &Path) -> Result<()> {
        if self.pending.contains_key(name) {
            return Err(WorkhostError::Duplicate(name.to_string()));
        }

        // SAFETY: plugin modules are trusted build artifacts produced by
        // the same toolchain as this binary; this is the documented caveat
        // of using `libloading` for a same-process-version plugin ABI.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| WorkhostError::Config(format!("failed to load plugin {name}: {e}")))?;

        let factory = unsafe {
            let entry: libloading::Symbol<unsafe extern "C" fn() -> *mut dyn PluginFactory> =
                library
                    .get(PLUGIN_ENTRY_SYMBOL)
                    .map_err(|e| WorkhostError::Config(format!("plugin {name} missing entry point: {e}")))?;
            Box::from_raw(entry())
        };

        let dependencies = factory.dependencies();
        self.pending.insert(
            name.to_string(),
            PendingPlugin {
                name: name.to_string(),
                dependencies,
                factory,
            },
        );
        self._libraries.push(library);
        Ok(())
    }

    /// Enumerates `<storage>/plugins/*.<module-ext>`, registers each, sorts
    /// by declared dependency, and instantiates in that order.
    pub async fn init(&mut self) -> Result<()> {
        let plugins_dir = self.storage.join("plugins");
        let mut discovered = Vec::new();

        match std::fs::read_dir(&plugins_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some(MODULE_EXT) {
                        discovered.push(path);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(dir = %plugins_dir.display(), error = %e, "could not read plugins directory");
            }
        }

        if discovered.is_empty() {
            tracing::warn!(dir = %plugins_dir.display(), "no plugin modules found");
        }

        discovered.sort();
        for path in &discovered {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| WorkhostError::Config(format!("invalid plugin filename: {}", path.display())))?
                .to_string();
            self.register_plugin(&name, path)?;
        }

        self.instantiate_in_order().await
    }

    async fn instantiate_in_order(&mut self) -> Result<()> {
        let names: Vec<String> = self.pending.keys().cloned().collect();
        let mut names_sorted = names.clone();
        names_sorted.sort();
        let names = names_sorted;

        let edges: HashMap<String, Vec<String>> = self
            .pending
            .iter()
            .map(|(name, p)| (name.clone(), p.dependencies.clone()))
            .collect();

        let order = dependency_sort::sort(&names, &edges)?;

        // Webhook config is environment-derived and re-read here rather
        // than cached across restarts, per the design's "env vars are read
        // during bootstrap and before each restart" rule; the cleanup
        // registry stays the same instance for the worker's whole life.
        let context = PluginContext {
            cleanup_registry: self.cleanup_registry.clone(),
            webhook_config: WebhookConfig::from_env().ok(),
        };

        for name in &order {
            if self.plugins.contains_key(name) {
                return Err(WorkhostError::Duplicate(name.clone()));
            }
            let pending = self
                .pending
                .get(name)
                .expect("name came from pending map's own keys");
            tracing::info!(plugin = %name, "instantiating plugin");
            let instance = pending.factory.instance(&context).await?;
            self.plugins.insert(name.clone(), instance);
        }

        self.order = order;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins.get(name).map(|b| b.as_ref())
    }

    pub fn get_public_methods(&self, name: &str) -> Option<Vec<String>> {
        self.plugins.get(name).map(|p| p.public_methods())
    }

    /// Shuts every plugin down in load order, clears the registry, merges
    /// `env` into the process environment, then re-runs `init`.
    pub async fn restart(&mut self, env: Option<HashMap<String, String>>) -> Result<()> {
        self.restarting.store(true, Ordering::SeqCst);
        let result = self.restart_inner(env).await;
        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn restart_inner(&mut self, env: Option<HashMap<String, String>>) -> Result<()> {
        for name in self.order.clone() {
            if let Some(plugin) = self.plugins.get(&name) {
                if let Err(e) = plugin.shutdown().await {
                    tracing::error!(plugin = %name, error = %e, "plugin shutdown failed during restart");
                }
            }
        }

        self.plugins.clear();
        self.pending.clear();
        self.order.clear();
        self._libraries.clear();
        self.initialized.store(false, Ordering::SeqCst);

        if let Some(env) = env {
            for (k, v) in env {
                std::env::set_var(k, v);
            }
        }

        self.init().await
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn insert_instance_for_test(&mut self, name: &str, plugin: Box<dyn Plugin>) {
        self.plugins.insert(name.to_string(), plugin);
        self.order.push(name.to_string());
        self.initialized.store(true, Ordering::SeqCst);
    }
}
