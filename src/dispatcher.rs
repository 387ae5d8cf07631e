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

//! Validates, authorizes, and classifies `executeCommand` invocations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, WorkhostError};
use crate::plugin::loader::PluginLoader;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommandOptions {
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Command {
    #[serde(rename = "forWhom")]
    pub for_whom: String,
    pub name: String,
    #[serde(rename = "pluginName")]
    pub plugin_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub options: CommandOptions,
}

impl Command {
    /// Structural validation per the data model: every field non-empty.
    fn validate(&self) -> Result<()> {
        if self.for_whom.trim().is_empty() {
            return Err(WorkhostError::BadCommand("forWhom must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(WorkhostError::BadCommand("name must not be empty".into()));
        }
        if self.plugin_name.trim().is_empty() {
            return Err(WorkhostError::BadCommand("pluginName must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Restart,
    Sync,
    SlowLambda,
    ObservableLambda,
    CmbSlowLambda,
    CmbObservableLambda,
}

#[derive(Debug, Serialize)]
pub struct DispatchOutcome {
    pub operation_type: Option<OperationType>,
    pub result: Value,
}

/// Return-value marker a plugin method can embed in its JSON result to
/// signal "this call completes asynchronously" instead of returning a value
/// synchronously. Plugin authors construct one via the delayed-response
/// engine's `*Response::create` and return `DelayedMarker::into_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedKind {
    Slow,
    Observable,
    CmbSlow,
    CmbObservable,
}

impl DelayedKind {
    fn operation_type(self) -> OperationType {
        match self {
            DelayedKind::Slow => OperationType::SlowLambda,
            DelayedKind::Observable => OperationType::ObservableLambda,
            DelayedKind::CmbSlow => OperationType::CmbSlowLambda,
            DelayedKind::CmbObservable => OperationType::CmbObservableLambda,
        }
    }
}

/// Runs the dispatch pipeline described in the design's Command Dispatcher
/// section against `loader`.
pub async fn execute_command(loader: &PluginLoader, cmd: Command) -> Result<DispatchOutcome> {
    if loader.is_restarting() {
        return Ok(DispatchOutcome {
            operation_type: Some(OperationType::Restart),
            result: Value::Null,
        });
    }

    cmd.validate()?;

    let plugin = loader
        .get(&cmd.plugin_name)
        .ok_or_else(|| WorkhostError::NoPlugin(cmd.plugin_name.clone()))?;

    // `options.extra` (data model §3 supplement) rides along as the last
    // argument slot when the caller supplied any, for both the allow check
    // and the call itself; the dispatcher never interprets its contents.
    let mut args = cmd.args.clone();
    if !cmd.options.extra.is_empty() {
        args.push(Value::Object(cmd.options.extra.clone()));
    }

    let allowed = plugin
        .allow(&cmd.for_whom, cmd.options.email.as_deref(), &cmd.name, &args)
        .await;
    if !allowed {
        return Err(WorkhostError::Unauthorized);
    }

    let raw = plugin.call(&cmd.name, &args).await?;
    Ok(classify(raw))
}

fn classify(raw: Value) -> DispatchOutcome {
    if let Some(marker) = DelayedMarker::from_value(&raw) {
        return DispatchOutcome {
            operation_type: Some(marker.kind.operation_type()),
            result: Value::String(marker.call_id),
        };
    }

    DispatchOutcome {
        operation_type: Some(OperationType::Sync),
        result: raw,
    }
}

/// Wire shape a plugin embeds in its `call` return value to signal an
/// asynchronous result: a plain JSON object carrying a `__workhostDelayedResponse`
/// tag and `callId`, rather than a Rust enum crossing the plugin ABI
/// boundary, since plugins are dynamically loaded libraries.
pub struct DelayedMarker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ParsedMarker {
    kind: DelayedKind,
    call_id: String,
}

impl DelayedKind {
    fn wire_tag(self) -> &'static str {
        match self {
            DelayedKind::Slow => "slowLambda",
            DelayedKind::Observable => "observableLambda",
            DelayedKind::CmbSlow => "cmbSlowLambda",
            DelayedKind::CmbObservable => "cmbObservableLambda",
        }
    }
}

impl DelayedMarker {
    /// Builds the JSON value a plugin method returns to signal an
    /// asynchronous result.
    pub fn to_value(kind: DelayedKind, call_id: &str) -> Value {
        serde_json::json!({
            "__workhostDelayedResponse": kind.wire_tag(),
            "callId": call_id,
        })
    }

    fn from_value(raw: &Value) -> Option<ParsedMarker> {
        let obj = raw.as_object()?;
        let tag = obj.get("__workhostDelayedResponse")?.as_str()?;
        let call_id = obj.get("callId")?.as_str()?.to_string();
        let kind = match tag {
            "slowLambda" => DelayedKind::Slow,
            "observableLambda" => DelayedKind::Observable,
            "cmbSlowLambda" => DelayedKind::CmbSlow,
            "cmbObservableLambda" => DelayedKind::CmbObservable,
            _ => return None,
        };
        Some(ParsedMarker { kind, call_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup_registry::CleanupRegistry;
    use crate::plugin::declaration::Plugin;
    use async_trait::async_trait;

    struct Always(bool);

    #[async_trait]
    impl Plugin for Always {
        async fn allow(&self, _: &str, _: Option<&str>, _: &str, _: &[Value]) -> bool {
            self.0
        }

        async fn call(&self, operation: &str, _: &[Value]) -> Result<Value> {
            Ok(Value::String(format!("Hello from {operation}")))
        }
    }

    fn loader_with(name: &str, plugin: Always) -> PluginLoader {
        let tmp = tempfile::tempdir().unwrap();
        let mut loader = PluginLoader::new(tmp.path(), CleanupRegistry::new());
        loader.insert_instance_for_test(name, Box::new(plugin));
        loader
    }

    #[tokio::test]
    async fn sync_call_returns_plugin_value() {
        let loader = loader_with("A", Always(true));
        let cmd = Command {
            for_whom: "t".into(),
            name: "testMethod".into(),
            plugin_name: "A".into(),
            args: vec![],
            options: CommandOptions::default(),
        };

        let outcome = execute_command(&loader, cmd).await.unwrap();
        assert_eq!(outcome.operation_type, Some(OperationType::Sync));
        assert_eq!(outcome.result, Value::String("Hello from A".into()));
    }

    #[tokio::test]
    async fn disallowed_call_never_invokes_method() {
        let loader = loader_with("A", Always(false));
        let cmd = Command {
            for_whom: "t".into(),
            name: "testMethod".into(),
            plugin_name: "A".into(),
            args: vec![],
            options: CommandOptions::default(),
        };

        let err = execute_command(&loader, cmd).await.unwrap_err();
        assert!(matches!(err, WorkhostError::Unauthorized));
    }

    #[tokio::test]
    async fn missing_plugin_is_no_plugin_error() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = PluginLoader::new(tmp.path(), CleanupRegistry::new());
        let cmd = Command {
            for_whom: "t".into(),
            name: "x".into(),
            plugin_name: "ghost".into(),
            args: vec![],
            options: CommandOptions::default(),
        };

        let err = execute_command(&loader, cmd).await.unwrap_err();
        assert!(matches!(err, WorkhostError::NoPlugin(ref n) if n == "ghost"));
    }

    #[tokio::test]
    async fn bad_command_rejects_empty_fields() {
        let cmd = Command {
            for_whom: "".into(),
            name: "x".into(),
            plugin_name: "A".into(),
            args: vec![],
            options: CommandOptions::default(),
        };
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn classify_recognizes_delayed_marker() {
        let raw = serde_json::json!({
            "__workhostDelayedResponse": "slowLambda",
            "callId": "abc123",
        });
        let outcome = classify(raw);
        assert_eq!(outcome.operation_type, Some(OperationType::SlowLambda));
        assert_eq!(outcome.result, Value::String("abc123".into()));
    }

    #[test]
    fn classify_plain_value_is_sync() {
        let outcome = classify(Value::Null);
        assert_eq!(outcome.operation_type, Some(OperationType::Sync));
        assert_eq!(outcome.result, Value::Null);
    }

    struct EchoLastArg;

    #[async_trait]
    impl Plugin for EchoLastArg {
        async fn allow(&self, _: &str, _: Option<&str>, _: &str, args: &[Value]) -> bool {
            // Denies unless the extra bag rode along, so the test can
            // observe that `allow` actually saw it.
            args.last().and_then(|v| v.get("locale")).is_some()
        }

        async fn call(&self, _: &str, args: &[Value]) -> Result<Value> {
            Ok(args.last().cloned().unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn command_options_extra_rides_as_the_last_argument() {
        let tmp = tempfile::tempdir().unwrap();
        let mut loader = PluginLoader::new(tmp.path(), CleanupRegistry::new());
        loader.insert_instance_for_test("A", Box::new(EchoLastArg));

        let mut extra = Map::new();
        extra.insert("locale".to_string(), Value::String("en-US".into()));
        let cmd = Command {
            for_whom: "t".into(),
            name: "testMethod".into(),
            plugin_name: "A".into(),
            args: vec![Value::from(1)],
            options: CommandOptions { email: None, extra },
        };

        let outcome = execute_command(&loader, cmd).await.unwrap();
        assert_eq!(outcome.result["locale"], "en-US");
    }

    #[tokio::test]
    async fn command_without_extra_does_not_append_an_argument() {
        let tmp = tempfile::tempdir().unwrap();
        let mut loader = PluginLoader::new(tmp.path(), CleanupRegistry::new());
        loader.insert_instance_for_test("A", Box::new(EchoLastArg));

        let cmd = Command {
            for_whom: "t".into(),
            name: "testMethod".into(),
            plugin_name: "A".into(),
            args: vec![Value::from(1)],
            options: CommandOptions::default(),
        };

        // `EchoLastArg::allow` denies when there's no trailing extra bag.
        let err = execute_command(&loader, cmd).await.unwrap_err();
        assert!(matches!(err, WorkhostError::Unauthorized));
    }
}
