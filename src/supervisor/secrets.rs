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

//! The environment-resolution collaborator a `ProcessSupervisor` consults
//! when `createWorker`/`restart` are called without an explicit `env` map.
//! Kept as an explicit `#[async_trait]` collaborator rather than a concrete
//! lookup, the same way `CleanupRegistry` is an explicit per-worker object
//! instead of a global.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait SecretsLoader: Send + Sync {
    async fn load(&self, id: &str, storage: &Path) -> Result<HashMap<String, String>>;
}

/// The default collaborator: no external secret source configured, so
/// forked workers get no extra environment beyond what the caller passed.
pub struct NoSecrets;

#[async_trait]
impl SecretsLoader for NoSecrets {
    async fn load(&self, _id: &str, _storage: &Path) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_secrets_loader_returns_empty_map() {
        let loader = NoSecrets;
        let env = loader.load("w1", Path::new("/tmp")).await.unwrap();
        assert!(env.is_empty());
    }
}
