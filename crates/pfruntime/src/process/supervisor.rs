use super::manager::{terminate_child, worker_command, ControlSignal, SupervisorEvent};
use pfcore::ProcessError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::process::Child;

const CONTROL_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_END_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker lifecycle requested by a `SupervisedProcessManager`.
///
/// Reads control lines from stdin and reports `started`/`exited` events
/// on stdout. Exits on `spawned_manager_end` or when stdin closes.
pub struct Supervisor {
    worker_bin: PathBuf,
    address: String,
    log_dir: PathBuf,
    end_timeout: Duration,
    workers: HashMap<usize, Child>,
    stdout: Stdout,
}

impl Supervisor {
    pub fn new(worker_bin: PathBuf, address: impl Into<String>, log_dir: PathBuf) -> Self {
        Self {
            worker_bin,
            address: address.into(),
            log_dir,
            end_timeout: DEFAULT_END_TIMEOUT,
            workers: HashMap::new(),
            stdout: tokio::io::stdout(),
        }
    }

    /// How long an ended worker gets to exit before it is killed.
    pub fn with_end_timeout(mut self, timeout: Duration) -> Self {
        self.end_timeout = timeout;
        self
    }

    pub fn end_timeout(&self) -> Duration {
        self.end_timeout
    }

    pub async fn run(mut self) -> Result<(), ProcessError> {
        tracing::info!("Supervisor started, workers connect to {}", self.address);
        let mut control = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.reap_exited().await?;
            let line = match tokio::time::timeout(CONTROL_POLL_TIMEOUT, control.next_line()).await {
                Err(_) => continue,
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) | Ok(Err(_)) => {
                    tracing::warn!("Control pipe closed, ending all workers.");
                    break;
                }
            };
            match ControlSignal::parse(&line) {
                Some(ControlSignal::Start(index)) => self.start(index).await?,
                Some(ControlSignal::Restart(index)) => {
                    self.end(index).await?;
                    self.start(index).await?;
                }
                Some(ControlSignal::End(index)) => self.end(index).await?,
                Some(ControlSignal::SpawnedManagerEnd) => break,
                None => tracing::warn!("Unknown control message: {}", line),
            }
        }

        let indexes: Vec<usize> = self.workers.keys().copied().collect();
        for index in indexes {
            self.end(index).await?;
        }
        tracing::info!("Supervisor exits.");
        Ok(())
    }

    async fn start(&mut self, index: usize) -> Result<(), ProcessError> {
        let mut command = worker_command(&self.worker_bin, index, &self.address, &self.log_dir)?;
        let child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
            index,
            error: e.to_string(),
        })?;
        let pid = child.id().unwrap_or_default();
        self.workers.insert(index, child);
        self.report(SupervisorEvent::Started { index, pid }).await
    }

    async fn end(&mut self, index: usize) -> Result<(), ProcessError> {
        if let Some(mut child) = self.workers.remove(&index) {
            terminate_child(&mut child, self.end_timeout).await?;
        }
        self.report(SupervisorEvent::Exited { index }).await
    }

    /// Report workers that exited on their own.
    async fn reap_exited(&mut self) -> Result<(), ProcessError> {
        let mut exited = Vec::new();
        for (index, child) in self.workers.iter_mut() {
            if !matches!(child.try_wait(), Ok(None)) {
                exited.push(*index);
            }
        }
        for index in exited {
            tracing::info!("Process {} exited.", index);
            self.workers.remove(&index);
            self.report(SupervisorEvent::Exited { index }).await?;
        }
        Ok(())
    }

    async fn report(&mut self, event: SupervisorEvent) -> Result<(), ProcessError> {
        let line = format!("{}\n", event.to_line());
        self.stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProcessError::Protocol(e.to_string()))?;
        self.stdout
            .flush()
            .await
            .map_err(|e| ProcessError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_timeout_defaults_and_overrides() {
        let supervisor = Supervisor::new(PathBuf::from("pf"), "127.0.0.1:1", PathBuf::from("logs"));
        assert_eq!(supervisor.end_timeout(), DEFAULT_END_TIMEOUT);
        let supervisor = supervisor.with_end_timeout(Duration::from_millis(2500));
        assert_eq!(supervisor.end_timeout(), Duration::from_millis(2500));
    }
}
