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

//! Entry point for a forked worker process. Connects back to the
//! supervisor over the IPC socket named by `WORKHOST_IPC_SOCKET`,
//! waits for `{type:"start", config}`, brings up the plugin registry and
//! HTTP surface, and reports `{type:"ready", url, port}`.
//!
//! Logging setup follows the usual `tracing_subscriber::fmt` + `EnvFilter`
//! pattern, reading verbosity from `RUST_LOG` since a worker process has no
//! command-line arguments of its own.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use workhost::ipc::{IpcChannel, SupervisorMessage, WorkerMessage};
use workhost::worker::routes::build_router;
use workhost::worker::runtime::{bind_listener, WorkerRuntime};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    // `run` surfaces `anyhow::Error` at this one edge so context attached
    // along the way (e.g. the IPC-connect step below) prints as a full
    // chain; everything inside the crate itself stays typed as `WorkhostError`.
    if let Err(e) = run().await {
        tracing::error!(error = ?e, "worker exiting after fatal error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut channel = IpcChannel::connect_from_env()
        .await
        .context("failed to connect back to the supervisor over the IPC socket")?;

    let config = match channel.recv_from_supervisor().await? {
        Some(SupervisorMessage::Start { config }) => config,
        Some(SupervisorMessage::Shutdown) | None => {
            tracing::info!("shutdown requested before start, exiting");
            return Ok(());
        }
    };

    let report_error = |channel: &mut IpcChannel, error: &workhost::WorkhostError| {
        let _ = channel;
        tracing::error!(error = %error, "bootstrap failed");
    };

    let mut bind_config = config.clone();
    let listener = match bind_listener(&mut bind_config).await {
        Ok(listener) => listener,
        Err(e) => {
            report_error(&mut channel, &e);
            let _ = channel
                .send_to_supervisor(&WorkerMessage::Error { error: e.to_string() })
                .await;
            return Err(e.into());
        }
    };
    let bound_port = listener.local_addr()?.port();

    let runtime = WorkerRuntime::new(bind_config);
    if let Err(e) = runtime.init_plugins().await {
        report_error(&mut channel, &e);
        let _ = channel
            .send_to_supervisor(&WorkerMessage::Error { error: e.to_string() })
            .await;
        return Err(e.into());
    }

    let url = format!("http://{}:{}", runtime.config.host, bound_port);
    let app = build_router(runtime.clone());

    channel
        .send_to_supervisor(&WorkerMessage::Ready { url, port: bound_port })
        .await?;

    serve_until_shutdown(runtime, channel, app, listener)
        .await
        .map_err(Into::into)
}

async fn serve_until_shutdown(
    runtime: Arc<WorkerRuntime>,
    mut channel: IpcChannel,
    app: axum::Router,
    listener: tokio::net::TcpListener,
) -> workhost::Result<()> {
    let shutdown_runtime = runtime.clone();

    let ipc_watcher = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            loop {
                match channel.recv_from_supervisor().await {
                    Ok(Some(SupervisorMessage::Shutdown)) | Ok(None) => {
                        runtime.begin_shutdown();
                        return;
                    }
                    Ok(Some(SupervisorMessage::Start { .. })) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "ipc read failed, treating as shutdown");
                        runtime.begin_shutdown();
                        return;
                    }
                }
            }
        })
    };

    let signal_watcher = tokio::spawn({
        let runtime = runtime.clone();
        async move {
            wait_for_sigterm().await;
            runtime.begin_shutdown();
        }
    });

    let graceful = async move {
        shutdown_runtime.shutdown_notify.notified().await;
        tracing::info!("shutting down");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await
        .map_err(workhost::WorkhostError::Io)?;

    ipc_watcher.abort();
    signal_watcher.abort();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
