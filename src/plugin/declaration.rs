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

//! Plugin contract: what a `<storage>/plugins/*.{so,dylib,dll}` module must
//! export, and the in-process types that result from loading one.

use async_trait::async_trait;
use serde_json::Value;

use crate::cleanup_registry::CleanupRegistry;
use crate::config::WebhookConfig;

/// Explicit collaborators handed to a plugin factory at instantiation time,
/// per the design's "process-wide singletons become explicit collaborators"
/// note: the process-wide [`CleanupRegistry`] (stable across restarts) and
/// the webhook configuration resolved from the environment for this
/// init/restart pass (`None` if `INTERNAL_WEBHOOK_URL` isn't set — a plugin
/// that never creates a delayed response doesn't need it; one that does
/// surfaces the `CONFIG` error itself at that point).
#[derive(Clone)]
pub struct PluginContext {
    pub cleanup_registry: CleanupRegistry,
    pub webhook_config: Option<WebhookConfig>,
}

/// An externally-callable operation plus the authorization predicate the
/// dispatcher consults before invoking it.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// `allow(forWhom, email, operation, args) -> bool`. A strict `false`
    /// return denies the call; anything else (including an error) permits.
    async fn allow(&self, for_whom: &str, email: Option<&str>, operation: &str, args: &[Value]) -> bool;

    /// Invokes `operation` with `args`, returning the raw JSON result the
    /// dispatcher will classify. `Err(NoMethod)` if `operation` isn't known.
    async fn call(&self, operation: &str, args: &[Value]) -> crate::error::Result<Value>;

    /// Operations externally reachable via `GET /getPublicMethods/:plugin`.
    fn public_methods(&self) -> Vec<String> {
        Vec::new()
    }

    /// Best-effort teardown, called during `restart`. Errors are logged and
    /// do not stop the remaining plugins from shutting down.
    async fn shutdown(&self) -> crate::error::Result<()> {
        Ok(())
    }
}

/// Declares a plugin's identity and dependency edges, as extracted from a
/// loaded module before instantiation.
pub struct PluginDeclaration {
    pub name: String,
    pub dependencies: Vec<String>,
}

/// The factory a plugin module exports. `libloading` hands us one of these
/// per `<name>.{so,dylib,dll}`, via the module's
/// `workhost_plugin_entry` symbol.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Builds the live instance. May perform async I/O (e.g. connecting to
    /// a backing store), hence `async`. `ctx` carries the shared cleanup
    /// registry and the resolved webhook configuration, so a plugin that
    /// creates delayed responses never has to reach for a process-wide
    /// global to get them.
    async fn instance(&self, ctx: &PluginContext) -> crate::error::Result<Box<dyn Plugin>>;
}

pub type PluginEntryFn = unsafe extern "C" fn() -> *mut dyn PluginFactory;
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"workhost_plugin_entry";
