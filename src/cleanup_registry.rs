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

//! Process-wide registry of cleanup callbacks keyed by call-id.
//!
//! One instance lives inside each worker process's [`crate::worker::runtime::WorkerRuntime`]
//! rather than behind a language-level global, per the Design Notes' guidance
//! that ambient singletons become explicit collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

pub type CleanupCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<HashMap<String, Vec<CleanupCallback>>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a callback for `call_id`.
    pub async fn register(&self, call_id: &str, callback: CleanupCallback) {
        let mut guard = self.inner.lock().await;
        guard.entry(call_id.to_string()).or_default().push(callback);
    }

    /// Pops all callbacks for `call_id` and invokes them in order, logging
    /// (and swallowing) any panic so one bad callback can't block the rest.
    pub async fn execute(&self, call_id: &str) {
        let callbacks = {
            let mut guard = self.inner.lock().await;
            guard.remove(call_id).unwrap_or_default()
        };

        for callback in callbacks {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
                tracing::error!(call_id, ?panic, "cleanup callback panicked");
            }
        }
    }

    /// Discards any callbacks for `call_id` without invoking them.
    pub async fn remove(&self, call_id: &str) {
        self.inner.lock().await.remove(call_id);
    }

    /// Snapshot of the currently-registered keys.
    pub async fn list(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn execute_runs_callbacks_in_order_and_removes_entry() {
        let registry = CleanupRegistry::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let calls = calls.clone();
            registry
                .register(
                    "call-1",
                    Box::new(move || {
                        calls.lock().unwrap().push(i);
                    }),
                )
                .await;
        }

        registry.execute("call-1").await;

        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn remove_discards_without_invoking() {
        let registry = CleanupRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();

        registry
            .register("call-1", Box::new(move || { counter2.fetch_add(1, Ordering::SeqCst); }))
            .await;
        registry.remove("call-1").await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn execute_on_unknown_key_is_a_no_op() {
        let registry = CleanupRegistry::new();
        registry.execute("never-registered").await;
        assert!(registry.list().await.is_empty());
    }
}
