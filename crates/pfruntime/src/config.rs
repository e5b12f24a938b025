use std::path::PathBuf;
use std::time::Duration;

/// How worker processes are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMethod {
    /// The pool starts each worker itself.
    #[default]
    Spawn,
    /// A long-lived supervisor process starts and reaps workers on request.
    Fork,
}

impl BatchMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "spawn" => Some(BatchMethod::Spawn),
            "fork" => Some(BatchMethod::Fork),
            _ => None,
        }
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_count: usize,
    pub batch_method: BatchMethod,
    pub line_timeout: Duration,
    pub home_dir: PathBuf,
    /// Executable started as `<bin> worker ...`; defaults to the current executable.
    pub worker_bin: Option<PathBuf>,
    pub process_info_timeout: Duration,
    pub terminate_timeout: Duration,
    pub health_check_attempts: u32,
    pub health_check_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_method: BatchMethod::Spawn,
            line_timeout: Duration::from_secs(600),
            home_dir: default_home_dir(),
            worker_bin: None,
            process_info_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::from_secs(60),
            health_check_attempts: 20,
            health_check_interval: Duration::from_secs(1),
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from `PF_*` environment variables; unset or invalid
    /// values keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("PF_WORKER_COUNT").filter(|n| *n > 0) {
            config.worker_count = n;
        }
        if let Some(method) = std::env::var("PF_BATCH_METHOD").ok().and_then(|v| BatchMethod::parse(&v)) {
            config.batch_method = method;
        }
        if let Some(secs) = env_parse::<u64>("PF_LINE_TIMEOUT_SEC") {
            config.line_timeout = Duration::from_secs(secs);
        }
        if let Ok(home) = std::env::var("PF_HOME_DIR") {
            config.home_dir = PathBuf::from(home);
        }
        if let Ok(bin) = std::env::var("PF_WORKER_BIN") {
            config.worker_bin = Some(PathBuf::from(bin));
        }
        config
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn with_batch_method(mut self, method: BatchMethod) -> Self {
        self.batch_method = method;
        self
    }

    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    pub fn with_worker_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.worker_bin = Some(bin.into());
        self
    }

    /// Executable used for worker and supervisor processes.
    pub fn worker_executable(&self) -> std::io::Result<PathBuf> {
        match &self.worker_bin {
            Some(bin) => Ok(bin.clone()),
            None => std::env::current_exe(),
        }
    }

    /// Directory holding local runs: `<home>/.runs`.
    pub fn runs_dir(&self) -> PathBuf {
        self.home_dir.join(".runs")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn default_home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".promptflow")
}
