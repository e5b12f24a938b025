use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use pfcore::{Connection, ConnectionProvider, ConnectionStore, Flow, Value};
use pfruntime::executor::LineOptions;
use pfruntime::proxy::startup_error_file;
use pfruntime::storage::LOG_FILE;
use pfruntime::{
    load_and_exec_node, run_worker, ApiBasedExecutorProxy, BatchEngine, BatchMethod, ExecutorOptions, ExecutorProxy,
    FlowExecutor, FlowValidator, RuntimeConfig, Supervisor, ToolsManager,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "pf")]
#[command(about = "Prompt flow CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow over every line of a data file
    Run {
        /// Flow file (flow.dag.yaml)
        #[arg(short, long)]
        flow: PathBuf,

        /// Input data: a .jsonl/.json file or a directory of them
        #[arg(short, long)]
        data: PathBuf,

        /// Outputs of a previous run, referenced as `${run.outputs.<name>}`
        #[arg(long)]
        run: Option<PathBuf>,

        /// Flow input mapping, e.g. `question=${data.q}`
        #[arg(long = "column-mapping", value_parser = parse_key_value)]
        column_mapping: Vec<(String, String)>,

        /// YAML or JSON list of connections
        #[arg(long)]
        connections: Option<PathBuf>,

        #[arg(long)]
        name: Option<String>,

        /// Run directory; defaults to `<home>/.runs/<name>`
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        worker_count: Option<usize>,

        /// `spawn` or `fork`
        #[arg(long)]
        batch_method: Option<String>,

        #[arg(long)]
        line_timeout: Option<u64>,

        /// Execute lines on a running executor service instead of worker processes
        #[arg(long, conflicts_with = "executor_bin")]
        executor_url: Option<String>,

        /// Start this executor service binary for the run
        #[arg(long)]
        executor_bin: Option<PathBuf>,
    },

    /// Execute one line of a flow, or a single node
    Test {
        #[arg(short, long)]
        flow: PathBuf,

        /// Inputs as a JSON object
        #[arg(short, long)]
        inputs: Option<String>,

        /// Only run this node; its dependencies' outputs come from `--inputs`
        #[arg(long)]
        node: Option<String>,

        /// Node variant, e.g. `${summarize.variant_1}`
        #[arg(long)]
        variant: Option<String>,

        #[arg(long)]
        connections: Option<PathBuf>,
    },

    /// Validate a flow file
    Validate {
        flow: PathBuf,
    },

    /// List available tools
    Tools,

    /// Serve one slot of a line process pool
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        index: usize,

        #[arg(long)]
        address: String,
    },

    /// Start and end pool workers on request
    #[command(hide = true)]
    Supervisor {
        #[arg(long)]
        address: String,

        #[arg(long)]
        log_dir: PathBuf,

        /// Milliseconds an ended worker gets before it is killed
        #[arg(long, default_value_t = 10_000)]
        terminate_timeout_ms: u64,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected <key>=<value>, got '{}'", s))
}

/// Parse `${node.variant_id}`.
fn parse_variant(variant: &str) -> Result<(String, String)> {
    variant
        .trim()
        .strip_prefix("${")
        .and_then(|v| v.strip_suffix('}'))
        .and_then(|v| v.split_once('.'))
        .map(|(node, id)| (node.to_string(), id.to_string()))
        .ok_or_else(|| anyhow!("Invalid variant format: {}, expected ${{node_name.variant_name}}", variant))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr and, when given, to `<log_dir>/logs.txt`.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr = fmt::layer().with_writer(std::io::stderr);
    match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
            tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(env_filter()).with(stderr).init();
            None
        }
    }
}

fn tools_manager() -> Arc<RwLock<ToolsManager>> {
    let mut manager = ToolsManager::new();
    pftools::register_all(&mut manager);
    Arc::new(RwLock::new(manager))
}

fn load_connections(path: Option<&Path>) -> Result<HashMap<String, Connection>> {
    match path {
        Some(path) => Ok(ConnectionStore::load(path)
            .with_context(|| format!("Failed to load connections from {}", path.display()))?
            .to_map()),
        None => Ok(HashMap::new()),
    }
}

fn parse_inputs(inputs: Option<&str>) -> Result<IndexMap<String, Value>> {
    let Some(inputs) = inputs else {
        return Ok(IndexMap::new());
    };
    match serde_json::from_str::<serde_json::Value>(inputs)? {
        serde_json::Value::Object(obj) => Ok(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        _ => Err(anyhow!("Inputs must be a JSON object")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            flow,
            data,
            run,
            column_mapping,
            connections,
            name,
            output,
            worker_count,
            batch_method,
            line_timeout,
            executor_url,
            executor_bin,
        } => {
            let mut config = RuntimeConfig::from_env();
            if let Some(n) = worker_count {
                config = config.with_worker_count(n);
            }
            if let Some(method) = batch_method {
                let method =
                    BatchMethod::parse(&method).ok_or_else(|| anyhow!("Unknown batch method: {}", method))?;
                config = config.with_batch_method(method);
            }
            if let Some(secs) = line_timeout {
                config = config.with_line_timeout(Duration::from_secs(secs));
            }
            let name = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let output = output.unwrap_or_else(|| config.runs_dir().join(&name));
            std::fs::create_dir_all(&output)?;
            let _guard = init_logging(Some(&output));

            let mut input_dirs = IndexMap::from([("data".to_string(), data)]);
            if let Some(run) = run {
                input_dirs.insert("run.outputs".to_string(), run);
            }
            let inputs_mapping: IndexMap<String, Value> =
                column_mapping.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
            let proxy = match (executor_url, executor_bin) {
                (Some(url), _) => {
                    let proxy = ApiBasedExecutorProxy::new(url)
                        .with_flow(&Flow::load(&flow, None)?)
                        .with_line_timeout(config.line_timeout);
                    proxy.ensure_executor_health().await?;
                    Some(Arc::new(proxy))
                }
                (None, Some(bin)) => {
                    let working_dir = flow
                        .parent()
                        .filter(|p| !p.as_os_str().is_empty())
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."));
                    let loaded = Flow::load(&flow, None)?;
                    let error_file = startup_error_file(&output);
                    let proxy =
                        ApiBasedExecutorProxy::launch(&bin, &loaded, &flow, &working_dir, &error_file, &config).await?;
                    Some(Arc::new(proxy))
                }
                (None, None) => None,
            };

            let mut engine = BatchEngine::new(&flow, None, load_connections(connections.as_deref())?, config)
                .with_executor_options(ExecutorOptions::default().with_tools_manager(tools_manager()));
            if let Some(proxy) = &proxy {
                engine = engine.with_proxy(proxy.clone());
            }
            let result = engine.run(&input_dirs, &inputs_mapping, &output, Some(&name)).await;
            if let Some(proxy) = &proxy {
                proxy.destroy().await?;
            }
            let result = result?;
            tracing::info!(
                "Run {} finished with status {:?}: {}/{} lines completed",
                name,
                result.status,
                result.completed_lines,
                result.total_lines
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
            println!("Run {} written to {}", name, output.display());
        }

        Commands::Test {
            flow,
            inputs,
            node,
            variant,
            connections,
        } => {
            let _guard = init_logging(None);
            let inputs = parse_inputs(inputs.as_deref())?;
            let connections: Arc<dyn ConnectionProvider> = Arc::new(load_connections(connections.as_deref())?);
            let mut options = ExecutorOptions::default().with_tools_manager(tools_manager());
            if let Some(variant) = variant {
                let (node, variant_id) = parse_variant(&variant)?;
                options = options.with_variant(node, variant_id);
            }

            if let Some(node) = node {
                let run_info =
                    load_and_exec_node(&flow, &node, inputs.clone(), inputs, connections, None, options).await?;
                println!("{}", serde_json::to_string_pretty(&run_info.output)?);
                return Ok(());
            }

            let executor = FlowExecutor::create(&flow, connections, None, options).await?;
            let line_options = LineOptions {
                allow_generator_output: true,
                ..Default::default()
            };
            let result = executor.exec_line_with_options(inputs, None, None, line_options).await?;
            let mut stdout = std::io::stdout();
            for value in result.output.values() {
                if let Value::Stream(generator) = value {
                    while let Some(chunk) = generator.next().await {
                        write!(stdout, "{}", chunk)?;
                        stdout.flush()?;
                    }
                    writeln!(stdout)?;
                }
            }
            let output: serde_json::Map<String, serde_json::Value> =
                result.output.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Validate { flow } => {
            let _guard = init_logging(None);
            let loaded = Flow::load(&flow, None)?;
            FlowValidator::validate(&loaded)?;
            println!("Flow {} is valid: {} nodes", flow.display(), loaded.nodes.len());
        }

        Commands::Tools => {
            let manager = tools_manager();
            let manager = manager.read().unwrap_or_else(|e| e.into_inner());
            for (id, tool) in manager.list_tools() {
                let description = tool.description.unwrap_or_default();
                println!("{} ({})  {}", id, tool.tool_type.as_str(), description);
            }
        }

        Commands::Worker { index, address } => {
            let _guard = init_logging(None);
            run_worker(index, &address, tools_manager()).await?;
        }

        Commands::Supervisor {
            address,
            log_dir,
            terminate_timeout_ms,
        } => {
            let _guard = init_logging(None);
            let worker_bin = RuntimeConfig::from_env().worker_executable()?;
            Supervisor::new(worker_bin, address, log_dir)
                .with_end_timeout(Duration::from_millis(terminate_timeout_ms))
                .run()
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variant() {
        assert_eq!(
            parse_variant("${summarize.variant_1}").unwrap(),
            ("summarize".to_string(), "variant_1".to_string())
        );
        assert!(parse_variant("summarize.variant_1").is_err());
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("question=${data.q}").unwrap(),
            ("question".to_string(), "${data.q}".to_string())
        );
        assert!(parse_key_value("question").is_err());
    }

    #[test]
    fn test_supervisor_terminate_timeout_arg() {
        let cli = Cli::try_parse_from([
            "pf",
            "supervisor",
            "--address",
            "127.0.0.1:9",
            "--log-dir",
            "logs",
            "--terminate-timeout-ms",
            "2500",
        ])
        .unwrap();
        match cli.command {
            Commands::Supervisor {
                terminate_timeout_ms, ..
            } => assert_eq!(terminate_timeout_ms, 2500),
            _ => panic!("expected the supervisor command"),
        }

        let cli = Cli::try_parse_from(["pf", "supervisor", "--address", "a", "--log-dir", "l"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Supervisor {
                terminate_timeout_ms: 10_000,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_inputs_requires_object() {
        let inputs = parse_inputs(Some(r#"{"count": 2}"#)).unwrap();
        assert_eq!(inputs["count"], Value::Int(2));
        assert!(parse_inputs(Some("[1]")).is_err());
    }
}
