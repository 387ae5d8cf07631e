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

//! Supervisor for forked worker processes that load dependency-ordered
//! plugins behind a command-dispatch HTTP endpoint.
//!
//! The crate splits along the same seam the worker/supervisor process
//! boundary does: [`supervisor`] runs in the parent process and owns
//! forking, restarting, and terminating workers; [`worker`] runs inside
//! each forked child and owns the plugin registry and HTTP surface;
//! [`plugin`], [`dispatcher`], [`delayed_response`], and [`webhook`] are
//! shared building blocks used from the worker side; [`ipc`] is the
//! protocol connecting the two.

pub mod cleanup_registry;
pub mod config;
pub mod delayed_response;
pub mod dependency_sort;
pub mod dispatcher;
pub mod error;
pub mod ipc;
pub mod plugin;
pub mod supervisor;
pub mod webhook;
pub mod worker;

pub use config::{DynamicPortPolicy, WebhookConfig, WorkerConfig};
pub use error::{Result, WorkhostError};
