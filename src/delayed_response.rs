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

//! The four response flavors a plugin method can return instead of a
//! synchronous value, their shared progress/completion/expiry lifecycle, and
//! the CMB poll loop.
//!
//! The expiry timer resets on every `progress`/`end` via a `watch` channel
//! carrying the current deadline; the CMB poll loop cancels on a
//! `tokio::sync::Notify` fired at terminal completion, stopping on whichever
//! comes first — the owning response completing, or the external webhook
//! itself reporting completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use rand::RngCore;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;

use crate::cleanup_registry::{CleanupCallback, CleanupRegistry};
use crate::dispatcher::{DelayedKind, DelayedMarker};
use crate::error::{Result, WorkhostError};
use crate::webhook::WebhookClient;

fn generate_call_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

type ErrorListener = Box<dyn FnOnce(&WorkhostError) + Send + 'static>;

/// Shared lifecycle state behind all four response flavors.
struct ResponseCore {
    call_id: String,
    webhook: WebhookClient,
    cleanup_registry: CleanupRegistry,
    external_url: Option<String>,
    completed: AtomicBool,
    error_listeners: Mutex<Vec<ErrorListener>>,
    deadline_tx: watch::Sender<Instant>,
    cancel_timer: Notify,
    cancel_poll: Notify,
}

impl ResponseCore {
    /// Claims the one-way completion transition. Returns `true` exactly
    /// once across the lifetime of a response.
    fn claim_completion(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn resource_cleanup_key(&self) -> &str {
        &self.call_id
    }

    fn expiry_cleanup_key(&self) -> String {
        format!("{}:expiry", self.call_id)
    }

    async fn fire_error_listeners(&self, error: &WorkhostError) {
        let listeners = std::mem::take(&mut *self.error_listeners.lock().await);
        for listener in listeners {
            listener(error);
        }
    }

    fn reset_expiry(&self, expiry: Duration) {
        let _ = self.deadline_tx.send(Instant::now() + expiry);
    }

    fn stop_expiry_timer(&self) {
        self.cancel_timer.notify_one();
    }

    fn stop_polling(&self) {
        self.cancel_poll.notify_one();
    }

    /// Network failure in `progress`/`end`: terminal, but distinct from
    /// expiry — only the resource-cleanup list fires, per the design's
    /// "addResourceCleanupCallback runs on explicit end or error" rule.
    async fn fail(&self, error: WorkhostError) -> Result<()> {
        if !self.claim_completion() {
            return Ok(());
        }
        self.stop_expiry_timer();
        self.stop_polling();
        self.fire_error_listeners(&error).await;
        self.cleanup_registry.execute(self.resource_cleanup_key()).await;
        self.cleanup_registry.remove(&self.expiry_cleanup_key()).await;
        Err(error)
    }

    /// Expiry firing is terminal too, but only the plain cleanup-callback
    /// list (registered via `add_cleanup_callback`) fires — expiry is not
    /// an "explicit end", so resource-cleanup callbacks are discarded
    /// unrun, matching the design's "Runs on expiry" vs "Runs on explicit
    /// end or error" split.
    async fn expire(&self) {
        if !self.claim_completion() {
            return;
        }
        self.stop_polling();
        let error = WorkhostError::Expired {
            call_id: self.call_id.clone(),
            elapsed_ms: 0,
        };
        self.fire_error_listeners(&error).await;
        self.cleanup_registry.execute(&self.expiry_cleanup_key()).await;
        self.cleanup_registry.remove(self.resource_cleanup_key()).await;
    }
}

async fn run_expiry_timer(core: Arc<ResponseCore>, mut deadline_rx: watch::Receiver<Instant>) {
    loop {
        let deadline = *deadline_rx.borrow();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if *deadline_rx.borrow() <= Instant::now() {
                    core.expire().await;
                    return;
                }
            }
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = core.cancel_timer.notified() => {
                return;
            }
        }
    }
}

async fn run_cmb_poll(core: Arc<ResponseCore>, on_complete: Box<dyn FnOnce(Value) + Send>) {
    let Some(external_url) = core.external_url.clone() else {
        return;
    };
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match core.webhook.poll_external_once(&external_url).await {
                    Ok(Some(data)) => {
                        if core.claim_completion() {
                            core.stop_expiry_timer();
                            core.cleanup_registry.execute(core.resource_cleanup_key()).await;
                            core.cleanup_registry.remove(&core.expiry_cleanup_key()).await;
                            on_complete(data);
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(call_id = %core.call_id, error = %e, "cmb poll failed, retrying");
                    }
                }
            }
            _ = core.cancel_poll.notified() => {
                return;
            }
        }
    }
}

fn spawn_core(
    webhook: WebhookClient,
    cleanup_registry: CleanupRegistry,
    expiry: Duration,
    external_url: Option<String>,
) -> Arc<ResponseCore> {
    let call_id = generate_call_id();
    let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + expiry);

    let core = Arc::new(ResponseCore {
        call_id,
        webhook,
        cleanup_registry,
        external_url,
        completed: AtomicBool::new(false),
        error_listeners: Mutex::new(Vec::new()),
        deadline_tx,
        cancel_timer: Notify::new(),
        cancel_poll: Notify::new(),
    });

    tokio::spawn(run_expiry_timer(core.clone(), deadline_rx));
    core
}

/// Registers the cleanup-on-forced-teardown callback and, if a
/// `serverless_id` is configured, fires the non-fatal `registerMapping`
/// call. Shared by all four `create*` constructors.
async fn finish_creation(core: &Arc<ResponseCore>, serverless_id: Option<&str>) {
    let core_for_cleanup = core.clone();
    core.cleanup_registry
        .register(
            core.resource_cleanup_key(),
            Box::new(move || {
                core_for_cleanup.stop_expiry_timer();
                core_for_cleanup.stop_polling();
            }) as CleanupCallback,
        )
        .await;

    if let Some(serverless_id) = serverless_id {
        core.webhook.register_mapping(&core.call_id, serverless_id).await;
    }
}

macro_rules! response_flavor {
    ($name:ident, $kind:expr) => {
        #[derive(Clone)]
        pub struct $name {
            core: Arc<ResponseCore>,
        }

        impl $name {
            pub fn call_id(&self) -> &str {
                &self.core.call_id
            }

            pub fn to_marker(&self) -> Value {
                DelayedMarker::to_value($kind, &self.core.call_id)
            }

            pub async fn progress(&self, data: Value, expiry: Duration) -> Result<()> {
                if self.core.completed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                self.core.reset_expiry(expiry);
                if let Err(e) = self.core.webhook.put_progress(&self.core.call_id, &data).await {
                    return self.core.fail(e).await;
                }
                Ok(())
            }

            pub async fn on_error<F>(&self, callback: F)
            where
                F: FnOnce(&WorkhostError) + Send + 'static,
            {
                self.core.error_listeners.lock().await.push(Box::new(callback));
            }

            pub async fn add_cleanup_callback(&self, callback: CleanupCallback) {
                self.core
                    .cleanup_registry
                    .register(&self.core.expiry_cleanup_key(), callback)
                    .await;
            }

            pub async fn add_resource_cleanup_callback(&self, callback: CleanupCallback) {
                self.core
                    .cleanup_registry
                    .register(self.core.resource_cleanup_key(), callback)
                    .await;
            }
        }
    };
}

response_flavor!(SlowResponse, DelayedKind::Slow);
response_flavor!(ObservableResponse, DelayedKind::Observable);
response_flavor!(CmbSlowResponse, DelayedKind::CmbSlow);
response_flavor!(CmbObservableResponse, DelayedKind::CmbObservable);

impl SlowResponse {
    pub async fn create(
        webhook: WebhookClient,
        cleanup_registry: CleanupRegistry,
        expiry: Duration,
        serverless_id: Option<&str>,
    ) -> Self {
        let core = spawn_core(webhook, cleanup_registry, expiry, None);
        finish_creation(&core, serverless_id).await;
        Self { core }
    }

    pub async fn end(&self, result: Value) -> Result<()> {
        end_with(&self.core, Some(result)).await
    }
}

impl ObservableResponse {
    pub async fn create(
        webhook: WebhookClient,
        cleanup_registry: CleanupRegistry,
        expiry: Duration,
        serverless_id: Option<&str>,
    ) -> Self {
        let core = spawn_core(webhook, cleanup_registry, expiry, None);
        finish_creation(&core, serverless_id).await;
        Self { core }
    }

    pub async fn end(&self) -> Result<()> {
        end_with(&self.core, None).await
    }
}

impl CmbSlowResponse {
    pub async fn create(
        webhook: WebhookClient,
        cleanup_registry: CleanupRegistry,
        expiry: Duration,
        external_url: String,
        serverless_id: Option<&str>,
        on_external_complete: Box<dyn FnOnce(Value) + Send>,
    ) -> Self {
        let core = spawn_core(
            webhook,
            cleanup_registry,
            expiry,
            Some(external_url),
        );
        finish_creation(&core, serverless_id).await;
        tokio::spawn(run_cmb_poll(core.clone(), on_external_complete));
        Self { core }
    }

    pub async fn end(&self, result: Value) -> Result<()> {
        end_with(&self.core, Some(result)).await
    }
}

impl CmbObservableResponse {
    pub async fn create(
        webhook: WebhookClient,
        cleanup_registry: CleanupRegistry,
        expiry: Duration,
        external_url: String,
        serverless_id: Option<&str>,
        on_external_complete: Box<dyn FnOnce(Value) + Send>,
    ) -> Self {
        let core = spawn_core(
            webhook,
            cleanup_registry,
            expiry,
            Some(external_url),
        );
        finish_creation(&core, serverless_id).await;
        tokio::spawn(run_cmb_poll(core.clone(), on_external_complete));
        Self { core }
    }

    pub async fn end(&self) -> Result<()> {
        end_with(&self.core, None).await
    }
}

async fn end_with(core: &Arc<ResponseCore>, result: Option<Value>) -> Result<()> {
    if !core.claim_completion() {
        return Ok(());
    }
    core.stop_expiry_timer();
    core.stop_polling();

    match core.webhook.put_result(&core.call_id, result.as_ref()).await {
        Ok(()) => {
            core.cleanup_registry.execute(core.resource_cleanup_key()).await;
            core.cleanup_registry.remove(&core.expiry_cleanup_key()).await;
            Ok(())
        }
        Err(e) => {
            core.fire_error_listeners(&e).await;
            core.cleanup_registry.execute(core.resource_cleanup_key()).await;
            core.cleanup_registry.remove(&core.expiry_cleanup_key()).await;
            Err(e)
        }
    }
}
