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

//! Configuration types: the per-worker fork config from the data model, and
//! the environment-variable keys the design's ambient-stack section
//! prescribes for webhook delivery.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, WorkhostError};

/// Whether a worker may fall back to an ephemeral port when its requested
/// port is already bound.
///
/// Wire shape per the data model is `false | true | <remaining-attempts
/// integer>`, which `#[serde(untagged)]` can't express over unit variants
/// (those would round-trip as JSON `null`, not a bool) — hence the
/// hand-written `Serialize`/`Deserialize` below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicPortPolicy {
    Disabled,
    Enabled,
    RemainingAttempts(u32),
}

impl Serialize for DynamicPortPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DynamicPortPolicy::Disabled => serializer.serialize_bool(false),
            DynamicPortPolicy::Enabled => serializer.serialize_bool(true),
            DynamicPortPolicy::RemainingAttempts(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for DynamicPortPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PolicyVisitor;

        impl<'de> Visitor<'de> for PolicyVisitor {
            type Value = DynamicPortPolicy;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("false, true, or a remaining-attempts integer")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Self::Value, E> {
                Ok(if v { DynamicPortPolicy::Enabled } else { DynamicPortPolicy::Disabled })
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(DynamicPortPolicy::RemainingAttempts(v as u32))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v < 0 {
                    return Err(de::Error::custom("remaining-attempts must not be negative"));
                }
                Ok(DynamicPortPolicy::RemainingAttempts(v as u32))
            }
        }

        deserializer.deserialize_any(PolicyVisitor)
    }
}

impl DynamicPortPolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, DynamicPortPolicy::Disabled)
    }

    /// Decrements a remaining-attempts budget; no-op for the other variants.
    /// Returns `false` once an integer budget is exhausted.
    pub fn tick(&mut self) -> bool {
        match self {
            DynamicPortPolicy::Disabled => false,
            DynamicPortPolicy::Enabled => true,
            DynamicPortPolicy::RemainingAttempts(n) => {
                if *n == 0 {
                    false
                } else {
                    *n -= 1;
                    true
                }
            }
        }
    }
}

impl Default for DynamicPortPolicy {
    fn default() -> Self {
        DynamicPortPolicy::Disabled
    }
}

/// Immutable record supplied at fork time (data model §3 `WorkerConfig`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub url_prefix: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub dynamic_port: DynamicPortPolicy,
    pub storage: PathBuf,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.storage.as_os_str().is_empty() {
            return Err(WorkhostError::Config("storage must be set".into()));
        }
        Ok(())
    }
}

/// Parsed form of the webhook-related environment keys.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub expiry: Duration,
    pub internal_url: String,
    pub external_url: Option<String>,
    pub serverless_id: Option<String>,
}

const DEFAULT_EXPIRY_MS: u64 = 300_000;

impl WebhookConfig {
    /// Reads `WEBHOOK_EXPIRY_TIME`, `INTERNAL_WEBHOOK_URL`,
    /// `EXTERNAL_WEBHOOK_URL`, and `SERVERLESS_ID` from the process
    /// environment. `INTERNAL_WEBHOOK_URL`'s absence is a `CONFIG` error;
    /// the others default sensibly.
    pub fn from_env() -> Result<Self> {
        let internal_url = std::env::var("INTERNAL_WEBHOOK_URL")
            .map_err(|_| WorkhostError::Config("INTERNAL_WEBHOOK_URL is required".into()))?;

        let expiry_ms = std::env::var("WEBHOOK_EXPIRY_TIME")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_EXPIRY_MS);

        Ok(Self {
            expiry: Duration::from_millis(expiry_ms),
            internal_url,
            external_url: std::env::var("EXTERNAL_WEBHOOK_URL").ok(),
            serverless_id: std::env::var("SERVERLESS_ID").ok(),
        })
    }
}
