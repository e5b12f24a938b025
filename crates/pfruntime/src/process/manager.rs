use super::protocol::{WorkerChannel, WorkerResponse};
use crate::config::RuntimeConfig;
use async_trait::async_trait;
use pfcore::ProcessError;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MANAGER_LOG_FILE: &str = "manager_process_stderr.log";
// Time for the supervisor to kill a worker and report the exit.
const EXIT_REPORT_GRACE: Duration = Duration::from_secs(1);

pub fn worker_log_file(log_dir: &Path, index: usize) -> PathBuf {
    log_dir.join(format!("process_stderr{}.log", index))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Identity of a connected worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub index: usize,
    pub process_id: u32,
    pub process_name: String,
}

/// Accepts worker connections and keeps them until their slot claims them.
///
/// A worker becomes known once it has connected and sent `Hello`.
pub struct WorkerRegistry {
    address: String,
    process_info: Mutex<HashMap<usize, ProcessInfo>>,
    channels: Mutex<HashMap<usize, WorkerChannel>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerRegistry {
    pub async fn bind() -> Result<Arc<Self>, ProcessError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ProcessError::Protocol(format!("failed to bind worker listener: {}", e)))?;
        let address = listener
            .local_addr()
            .map_err(|e| ProcessError::Protocol(e.to_string()))?
            .to_string();
        let registry = Arc::new(Self {
            address,
            process_info: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&registry);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    let mut channel = WorkerChannel::new(stream);
                    match channel.recv::<WorkerResponse>().await {
                        Ok(Some(WorkerResponse::Hello { index, pid })) => registry.register(index, pid, channel),
                        other => tracing::warn!("Dropping worker connection from {}: {:?}", peer, other.err()),
                    }
                });
            }
        });
        *lock(&registry.accept_task) = Some(task);
        Ok(registry)
    }

    /// Address workers connect to
    pub fn address(&self) -> &str {
        &self.address
    }

    fn register(&self, index: usize, pid: u32, channel: WorkerChannel) {
        tracing::info!("Process {} (pid {}) connected.", index, pid);
        lock(&self.channels).insert(index, channel);
        lock(&self.process_info).insert(
            index,
            ProcessInfo {
                index,
                process_id: pid,
                process_name: format!("pf-worker-{}", index),
            },
        );
    }

    pub fn process_info(&self, index: usize) -> Option<ProcessInfo> {
        lock(&self.process_info).get(&index).cloned()
    }

    pub fn take_channel(&self, index: usize) -> Option<WorkerChannel> {
        lock(&self.channels).remove(&index)
    }

    /// Close any parked connection of `index`, which tells the worker to exit.
    fn close_channel(&self, index: usize) {
        lock(&self.channels).remove(&index);
    }

    fn forget(&self, index: usize) {
        lock(&self.process_info).remove(&index);
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
    }
}

/// Settings shared by the process managers
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    pub worker_bin: PathBuf,
    pub log_dir: PathBuf,
    pub process_info_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl ProcessManagerConfig {
    pub fn from_runtime(config: &RuntimeConfig, log_dir: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let worker_bin = config.worker_executable().map_err(|e| ProcessError::SpawnFailed {
            index: 0,
            error: e.to_string(),
        })?;
        Ok(Self {
            worker_bin,
            log_dir: log_dir.into(),
            process_info_timeout: config.process_info_timeout,
            terminate_timeout: config.terminate_timeout,
        })
    }
}

/// Command line of one worker process
pub(crate) fn worker_command(bin: &Path, index: usize, address: &str, log_dir: &Path) -> Result<Command, ProcessError> {
    let spawn_failed = |e: std::io::Error| ProcessError::SpawnFailed {
        index,
        error: e.to_string(),
    };
    std::fs::create_dir_all(log_dir).map_err(spawn_failed)?;
    let stderr = File::create(worker_log_file(log_dir, index)).map_err(spawn_failed)?;
    let mut command = Command::new(bin);
    command
        .arg("worker")
        .arg("--index")
        .arg(index.to_string())
        .arg("--address")
        .arg(address)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    Ok(command)
}

/// Command line of the supervisor process. Workers it ends get the
/// configured terminate timeout before they are killed.
pub(crate) fn supervisor_command(config: &ProcessManagerConfig, address: &str) -> Command {
    let mut command = Command::new(&config.worker_bin);
    command
        .arg("supervisor")
        .arg("--address")
        .arg(address)
        .arg("--log-dir")
        .arg(&config.log_dir)
        .arg("--terminate-timeout-ms")
        .arg(config.terminate_timeout.as_millis().to_string());
    command
}

/// Wait for `child` to exit, killing it once `timeout` has passed.
pub(crate) async fn terminate_child(child: &mut Child, timeout: Duration) -> Result<(), ProcessError> {
    if tokio::time::timeout(timeout, child.wait()).await.is_ok() {
        return Ok(());
    }
    tracing::warn!("Process {:?} did not exit in {:?}, killing it.", child.id(), timeout);
    child.kill().await.map_err(|_| ProcessError::ProcessTerminatedTimeout {
        timeout: timeout.as_secs(),
    })
}

/// Starts, restarts and ends the worker process of each pool slot.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    fn registry(&self) -> &Arc<WorkerRegistry>;

    fn config(&self) -> &ProcessManagerConfig;

    async fn new_process(&self, index: usize) -> Result<(), ProcessError>;

    /// Ask the worker to exit, wait a bounded time, then kill it. The
    /// process info is dropped only after the exit is confirmed.
    async fn end_process(&self, index: usize) -> Result<(), ProcessError>;

    /// Fail when the manager itself can no longer start workers.
    fn ensure_healthy(&self) -> Result<(), ProcessError>;

    /// End every worker and release the manager.
    async fn shutdown(&self) -> Result<(), ProcessError>;

    async fn restart_process(&self, index: usize) -> Result<(), ProcessError> {
        tracing::info!("Restarting process {}.", index);
        self.end_process(index).await?;
        self.new_process(index).await
    }

    /// Wait until the worker of `index` has connected.
    async fn get_process_info(&self, index: usize) -> Result<ProcessInfo, ProcessError> {
        let timeout = self.config().process_info_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(info) = self.registry().process_info(index) {
                return Ok(info);
            }
            self.ensure_healthy()?;
            if Instant::now() >= deadline {
                log_process_files(&self.config().log_dir, index);
                return Err(ProcessError::ProcessInfoObtainedTimeout {
                    timeout: timeout.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn log_process_files(log_dir: &Path, index: usize) {
    for path in [worker_log_file(log_dir, index), log_dir.join(MANAGER_LOG_FILE)] {
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.is_empty() => {
                tracing::error!("Process log {}:\n{}", path.display(), content)
            }
            _ => tracing::warn!("Process log {} is empty or missing.", path.display()),
        }
    }
}

/// Starts each worker directly from the pool process
pub struct SpawnProcessManager {
    config: ProcessManagerConfig,
    registry: Arc<WorkerRegistry>,
    children: tokio::sync::Mutex<HashMap<usize, Child>>,
}

impl SpawnProcessManager {
    pub fn new(config: ProcessManagerConfig, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            config,
            registry,
            children: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProcessManager for SpawnProcessManager {
    fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    async fn new_process(&self, index: usize) -> Result<(), ProcessError> {
        let mut command = worker_command(&self.config.worker_bin, index, self.registry.address(), &self.config.log_dir)?;
        let child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
            index,
            error: e.to_string(),
        })?;
        tracing::info!("Process {} started with pid {:?}.", index, child.id());
        self.children.lock().await.insert(index, child);
        Ok(())
    }

    async fn end_process(&self, index: usize) -> Result<(), ProcessError> {
        self.registry.close_channel(index);
        let child = self.children.lock().await.remove(&index);
        if let Some(mut child) = child {
            terminate_child(&mut child, self.config.terminate_timeout).await?;
            tracing::info!("Process {} terminated.", index);
        }
        self.registry.forget(index);
        Ok(())
    }

    fn ensure_healthy(&self) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ProcessError> {
        let indexes: Vec<usize> = self.children.lock().await.keys().copied().collect();
        for index in indexes {
            self.end_process(index).await?;
        }
        Ok(())
    }
}

/// Event reported by the supervisor on its stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { index: usize, pid: u32 },
    Exited { index: usize },
}

impl SupervisorEvent {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let event = parts.next()?;
        let index = parts.next()?.parse().ok()?;
        match event {
            "started" => Some(SupervisorEvent::Started {
                index,
                pid: parts.next()?.parse().ok()?,
            }),
            "exited" => Some(SupervisorEvent::Exited { index }),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            SupervisorEvent::Started { index, pid } => format!("started {} {}", index, pid),
            SupervisorEvent::Exited { index } => format!("exited {}", index),
        }
    }
}

/// Control message accepted by the supervisor on its stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Start(usize),
    Restart(usize),
    End(usize),
    SpawnedManagerEnd,
}

impl ControlSignal {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let signal = parts.next()?;
        if signal == "spawned_manager_end" {
            return Some(ControlSignal::SpawnedManagerEnd);
        }
        let index = parts.next()?.parse().ok()?;
        match signal {
            "start" => Some(ControlSignal::Start(index)),
            "restart" => Some(ControlSignal::Restart(index)),
            "end" => Some(ControlSignal::End(index)),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            ControlSignal::Start(i) => format!("start {}", i),
            ControlSignal::Restart(i) => format!("restart {}", i),
            ControlSignal::End(i) => format!("end {}", i),
            ControlSignal::SpawnedManagerEnd => "spawned_manager_end".to_string(),
        }
    }
}

/// Delegates worker lifecycle to a long-lived supervisor process
pub struct SupervisedProcessManager {
    config: ProcessManagerConfig,
    registry: Arc<WorkerRegistry>,
    supervisor: Mutex<Child>,
    control: tokio::sync::Mutex<ChildStdin>,
    exited: Arc<Mutex<HashMap<usize, bool>>>,
    exit_notify: Arc<Notify>,
    events_task: JoinHandle<()>,
}

impl SupervisedProcessManager {
    pub async fn start(config: ProcessManagerConfig, registry: Arc<WorkerRegistry>) -> Result<Self, ProcessError> {
        let spawn_failed = |e: std::io::Error| ProcessError::SpawnedForkProcessManagerStartFailure { log: e.to_string() };
        std::fs::create_dir_all(&config.log_dir).map_err(spawn_failed)?;
        let stderr = File::create(config.log_dir.join(MANAGER_LOG_FILE)).map_err(spawn_failed)?;
        let mut child = supervisor_command(&config, registry.address())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;
        let missing_pipe = || ProcessError::SpawnedForkProcessManagerStartFailure {
            log: "supervisor pipes are unavailable".to_string(),
        };
        let control = child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        tracing::info!("Supervisor process started with pid {:?}.", child.id());

        let exited: Arc<Mutex<HashMap<usize, bool>>> = Arc::new(Mutex::new(HashMap::new()));
        let exit_notify = Arc::new(Notify::new());
        let events_task = {
            let exited = exited.clone();
            let exit_notify = exit_notify.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match SupervisorEvent::parse(&line) {
                        Some(SupervisorEvent::Started { index, pid }) => {
                            tracing::info!("Process {} started with pid {}.", index, pid);
                            lock(&exited).insert(index, false);
                        }
                        Some(SupervisorEvent::Exited { index }) => {
                            tracing::info!("Process {} exited.", index);
                            lock(&exited).insert(index, true);
                            exit_notify.notify_waiters();
                        }
                        None => tracing::debug!("Ignoring supervisor output: {}", line),
                    }
                }
            })
        };

        Ok(Self {
            config,
            registry,
            supervisor: Mutex::new(child),
            control: tokio::sync::Mutex::new(control),
            exited,
            exit_notify,
            events_task,
        })
    }

    async fn send(&self, signal: ControlSignal) -> Result<(), ProcessError> {
        let mut control = self.control.lock().await;
        let line = format!("{}\n", signal.to_line());
        let written = control.write_all(line.as_bytes()).await;
        if written.is_err() || control.flush().await.is_err() {
            self.ensure_healthy()?;
            return Err(ProcessError::Protocol(format!("failed to send '{}' to supervisor", signal.to_line())));
        }
        Ok(())
    }

    async fn wait_exited(&self, index: usize) -> bool {
        loop {
            let notified = self.exit_notify.notified();
            if lock(&self.exited).get(&index).copied().unwrap_or(true) {
                return true;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ProcessManager for SupervisedProcessManager {
    fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    async fn new_process(&self, index: usize) -> Result<(), ProcessError> {
        lock(&self.exited).insert(index, false);
        self.send(ControlSignal::Start(index)).await
    }

    async fn end_process(&self, index: usize) -> Result<(), ProcessError> {
        self.registry.close_channel(index);
        self.send(ControlSignal::End(index)).await?;
        let timeout = self.config.terminate_timeout;
        if tokio::time::timeout(timeout + EXIT_REPORT_GRACE, self.wait_exited(index))
            .await
            .is_err()
        {
            return Err(ProcessError::ProcessTerminatedTimeout {
                timeout: timeout.as_secs(),
            });
        }
        self.registry.forget(index);
        Ok(())
    }

    fn ensure_healthy(&self) -> Result<(), ProcessError> {
        let status = lock(&self.supervisor).try_wait();
        if let Ok(None) = status {
            return Ok(());
        }
        let log = std::fs::read_to_string(self.config.log_dir.join(MANAGER_LOG_FILE)).unwrap_or_default();
        tracing::error!("The supervisor process exited unexpectedly.");
        Err(ProcessError::SpawnedForkProcessManagerStartFailure { log })
    }

    async fn shutdown(&self) -> Result<(), ProcessError> {
        if self.send(ControlSignal::SpawnedManagerEnd).await.is_err() {
            return Ok(());
        }
        let timeout = self.config.terminate_timeout;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !matches!(lock(&self.supervisor).try_wait(), Ok(None)) {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(ProcessError::ProcessTerminatedTimeout {
            timeout: timeout.as_secs(),
        })
    }
}

impl Drop for SupervisedProcessManager {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_and_event_lines() {
        for signal in [
            ControlSignal::Start(1),
            ControlSignal::Restart(2),
            ControlSignal::End(0),
            ControlSignal::SpawnedManagerEnd,
        ] {
            assert_eq!(ControlSignal::parse(&signal.to_line()), Some(signal));
        }
        assert_eq!(ControlSignal::parse("stop 1"), None);
        assert_eq!(
            SupervisorEvent::parse("started 3 4242"),
            Some(SupervisorEvent::Started { index: 3, pid: 4242 })
        );
        assert_eq!(SupervisorEvent::parse("exited x"), None);
    }

    #[test]
    fn test_supervisor_command_carries_terminate_timeout() {
        let config = ProcessManagerConfig {
            worker_bin: PathBuf::from("pf"),
            log_dir: PathBuf::from("logs"),
            process_info_timeout: Duration::from_secs(1),
            terminate_timeout: Duration::from_millis(2500),
        };
        let command = supervisor_command(&config, "127.0.0.1:9");
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "supervisor",
                "--address",
                "127.0.0.1:9",
                "--log-dir",
                "logs",
                "--terminate-timeout-ms",
                "2500"
            ]
        );
    }

    #[tokio::test]
    async fn test_registry_tracks_hello() {
        let registry = WorkerRegistry::bind().await.unwrap();
        assert!(registry.process_info(0).is_none());

        let mut worker = WorkerChannel::connect(registry.address()).await.unwrap();
        worker.send(&WorkerResponse::Hello { index: 0, pid: 77 }).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.process_info(0).is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.process_info(0).unwrap().process_id, 77);
        assert!(registry.take_channel(0).is_some());
        assert!(registry.take_channel(0).is_none());
    }

    struct NeverConnects {
        registry: Arc<WorkerRegistry>,
        config: ProcessManagerConfig,
    }

    #[async_trait]
    impl ProcessManager for NeverConnects {
        fn registry(&self) -> &Arc<WorkerRegistry> {
            &self.registry
        }

        fn config(&self) -> &ProcessManagerConfig {
            &self.config
        }

        async fn new_process(&self, _index: usize) -> Result<(), ProcessError> {
            Ok(())
        }

        async fn end_process(&self, _index: usize) -> Result<(), ProcessError> {
            Ok(())
        }

        fn ensure_healthy(&self) -> Result<(), ProcessError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_process_info_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = NeverConnects {
            registry: WorkerRegistry::bind().await.unwrap(),
            config: ProcessManagerConfig {
                worker_bin: PathBuf::from("unused"),
                log_dir: dir.path().to_path_buf(),
                process_info_timeout: Duration::from_millis(300),
                terminate_timeout: Duration::from_secs(1),
            },
        };
        let err = manager.get_process_info(0).await.unwrap_err();
        assert_eq!(err, ProcessError::ProcessInfoObtainedTimeout { timeout: 0 });
    }
}
