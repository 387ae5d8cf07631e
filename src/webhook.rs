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

//! Thin HTTP client wrapper around the internal/external webhook contracts:
//! `PUT .../progress`, `PUT .../result`, `PUT .../registerMapping`, and the
//! CMB `GET` poll.

use serde_json::Value;

use crate::error::{Result, WorkhostError};

const SERVERLESS_ID_HEADER: &str = "x-serverless-id";

#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    internal_url: String,
    serverless_id: Option<String>,
}

impl WebhookClient {
    pub fn new(internal_url: String, serverless_id: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            internal_url,
            serverless_id,
        }
    }

    fn apply_serverless_header(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.serverless_id {
            Some(id) => builder.header(SERVERLESS_ID_HEADER, id),
            None => builder,
        }
    }

    pub async fn put_progress(&self, call_id: &str, progress: &Value) -> Result<()> {
        let body = serde_json::json!({
            "callId": call_id,
            "status": "pending",
            "progress": progress,
        });
        self.put(&format!("{}/progress", self.internal_url), &body).await
    }

    pub async fn put_result(&self, call_id: &str, result: Option<&Value>) -> Result<()> {
        let mut body = serde_json::json!({
            "callId": call_id,
            "status": "completed",
        });
        if let Some(result) = result {
            body["result"] = result.clone();
        }
        self.put(&format!("{}/result", self.internal_url), &body).await
    }

    /// Non-fatal: failures are logged, never surfaced.
    pub async fn register_mapping(&self, call_id: &str, serverless_id: &str) {
        let body = serde_json::json!({ "callId": call_id, "serverlessId": serverless_id });
        if let Err(e) = self.put(&format!("{}/registerMapping", self.internal_url), &body).await {
            tracing::warn!(call_id, error = %e, "registerMapping webhook call failed");
        }
    }

    async fn put(&self, url: &str, body: &Value) -> Result<()> {
        let builder = self.apply_serverless_header(self.http.put(url).json(body));
        let response = builder.send().await.map_err(|e| WorkhostError::WebhookIo(e.to_string()))?;
        if !response.status().is_success() {
            return Err(WorkhostError::WebhookIo(format!("webhook returned {}", response.status())));
        }
        Ok(())
    }

    /// Polls `external_url` once; returns `Some(data)` once the peer reports
    /// `{"status":"completed", ...}`.
    pub async fn poll_external_once(&self, external_url: &str) -> Result<Option<Value>> {
        let response = self
            .http
            .get(external_url)
            .send()
            .await
            .map_err(|e| WorkhostError::WebhookIo(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| WorkhostError::WebhookIo(e.to_string()))?;

        if body.get("status").and_then(|s| s.as_str()) == Some("completed") {
            Ok(Some(body))
        } else {
            Ok(None)
        }
    }
}
