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

//! Crate-wide error type, covering every error kind from the design's
//! error-handling table.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkhostError {
    #[error("missing configuration: {0}")]
    Config(String),

    #[error("bad command: {0}")]
    BadCommand(String),

    #[error("no such plugin: {0}")]
    NoPlugin(String),

    #[error("plugin {0} exposes no allow predicate")]
    NoAllow(String),

    #[error("plugin {0} exposes no method {1}")]
    NoMethod(String, String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("Circular dependency at {0}")]
    Cycle(String),

    #[error("duplicate plugin registration: {0}")]
    Duplicate(String),

    #[error("worker did not become ready in time")]
    ReadyTimeout,

    #[error("call {call_id} expired after {elapsed_ms}ms")]
    Expired { call_id: String, elapsed_ms: u64 },

    #[error("webhook delivery failed: {0}")]
    WebhookIo(String),

    #[error("restart already in progress for {0}")]
    RestartBusy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkhostError>;
