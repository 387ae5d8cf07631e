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

//! JSON-Lines control protocol between the supervisor and a forked worker,
//! carried over a private Unix domain socket. The socket path is handed to
//! the worker through the `WORKHOST_IPC_SOCKET` environment variable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::config::WorkerConfig;
use crate::error::{Result, WorkhostError};

pub const SOCKET_ENV_VAR: &str = "WORKHOST_IPC_SOCKET";

/// Messages the supervisor sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisorMessage {
    Start { config: WorkerConfig },
    Shutdown,
}

/// Messages a worker sends back to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Ready { url: String, port: u16 },
    Error { error: String },
}

/// One end of the JSON-Lines channel: a single line of text per message,
/// `\n`-terminated.
pub struct IpcChannel {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl IpcChannel {
    fn from_stream(stream: UnixStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Supervisor side: binds a fresh socket at `path` and waits for the
    /// worker process to connect.
    pub async fn accept(path: &std::path::Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        let (stream, _) = listener.accept().await?;
        Ok(Self::from_stream(stream))
    }

    /// Worker side: connects to the socket path named by `WORKHOST_IPC_SOCKET`.
    pub async fn connect_from_env() -> Result<Self> {
        let path = std::env::var(SOCKET_ENV_VAR)
            .map_err(|_| WorkhostError::Config(format!("{SOCKET_ENV_VAR} is not set")))?;
        let stream = UnixStream::connect(&path).await?;
        Ok(Self::from_stream(stream))
    }

    async fn send_line(&mut self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<Option<Value>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(line.trim_end())?;
        Ok(Some(value))
    }

    pub async fn send_to_worker(&mut self, message: &SupervisorMessage) -> Result<()> {
        self.send_line(&serde_json::to_value(message)?).await
    }

    pub async fn recv_from_supervisor(&mut self) -> Result<Option<SupervisorMessage>> {
        match self.recv_line().await? {
            Some(raw) => Ok(Some(parse_supervisor_message(raw)?)),
            None => Ok(None),
        }
    }

    pub async fn send_to_supervisor(&mut self, message: &WorkerMessage) -> Result<()> {
        self.send_line(&serde_json::to_value(message)?).await
    }

    pub async fn recv_from_worker(&mut self) -> Result<Option<WorkerMessage>> {
        match self.recv_line().await? {
            Some(raw) => Ok(Some(parse_worker_message(raw)?)),
            None => Ok(None),
        }
    }
}

fn parse_supervisor_message(raw: Value) -> Result<SupervisorMessage> {
    serde_json::from_value(raw)
        .map_err(|e| WorkhostError::Config(format!("unrecognized supervisor message: {e}")))
}

fn parse_worker_message(raw: Value) -> Result<WorkerMessage> {
    serde_json::from_value(raw)
        .map_err(|e| WorkhostError::Config(format!("unrecognized worker message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicPortPolicy;
    use std::path::PathBuf;

    fn sample_config() -> WorkerConfig {
        WorkerConfig {
            id: "w1".into(),
            url_prefix: "api".into(),
            host: "127.0.0.1".into(),
            port: 4000,
            dynamic_port: DynamicPortPolicy::Disabled,
            storage: PathBuf::from("/tmp/w1"),
            env: None,
        }
    }

    #[tokio::test]
    async fn round_trips_start_and_ready_over_a_real_socket() {
        // Exercise the missing-env-var error first, in the same test, so
        // this check can't race against another test's `set_var` — the
        // environment is process-global and tests run concurrently.
        std::env::remove_var(SOCKET_ENV_VAR);
        let err = IpcChannel::connect_from_env().await.unwrap_err();
        assert!(matches!(err, WorkhostError::Config(_)));

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ipc.sock");

        let accept_path = socket_path.clone();
        let acceptor = tokio::spawn(async move { IpcChannel::accept(&accept_path).await });

        // Give the listener a moment to bind before the worker connects.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::env::set_var(SOCKET_ENV_VAR, socket_path.to_str().unwrap());
        let mut worker_channel = IpcChannel::connect_from_env().await.unwrap();
        let mut supervisor_channel = acceptor.await.unwrap().unwrap();

        supervisor_channel
            .send_to_worker(&SupervisorMessage::Start { config: sample_config() })
            .await
            .unwrap();
        let received = worker_channel.recv_from_supervisor().await.unwrap().unwrap();
        assert!(matches!(received, SupervisorMessage::Start { config } if config.id == "w1"));

        worker_channel
            .send_to_supervisor(&WorkerMessage::Ready { url: "http://127.0.0.1:4000".into(), port: 4000 })
            .await
            .unwrap();
        let received = supervisor_channel.recv_from_worker().await.unwrap().unwrap();
        assert!(matches!(received, WorkerMessage::Ready { port, .. } if port == 4000));
    }
}
