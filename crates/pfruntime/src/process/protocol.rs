//! JSON-lines messages exchanged between the pool and its worker processes.

use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use pfcore::{Connection, Flow, LineResult, ProcessError, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

/// Pool to worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Build the executor; answered with `Ready` or `InitFailed`.
    Init {
        flow: Box<Flow>,
        connections: HashMap<String, Connection>,
        working_dir: PathBuf,
        line_timeout_secs: u64,
    },
    ExecLine {
        run_id: String,
        line_number: usize,
        inputs: IndexMap<String, Value>,
    },
    Shutdown,
}

/// Worker to pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// First message on every connection
    Hello { index: usize, pid: u32 },
    Ready,
    InitFailed { error: serde_json::Value },
    LineResult { result: Box<LineResult> },
}

/// A framed connection to one worker
pub struct WorkerChannel {
    framed: Framed<TcpStream, LinesCodec>,
}

impl WorkerChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    pub async fn connect(address: &str) -> Result<Self, ProcessError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ProcessError::Protocol(format!("failed to connect to {}: {}", address, e)))?;
        Ok(Self::new(stream))
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProcessError> {
        let line = serde_json::to_string(message).map_err(|e| ProcessError::Protocol(e.to_string()))?;
        self.framed
            .send(line)
            .await
            .map_err(|e| ProcessError::Protocol(e.to_string()))
    }

    /// Next message, or `None` once the peer closed the connection.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProcessError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Ok(line)) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| ProcessError::Protocol(e.to_string())),
            Some(Err(e)) => Err(ProcessError::Protocol(e.to_string())),
        }
    }
}
