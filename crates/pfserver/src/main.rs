use actix_web::{web, App, HttpServer};
use clap::Parser;
use pfcore::{ConnectionProvider, ConnectionStore, FlowError};
use pfruntime::{ExecutorOptions, FlowExecutor, ToolsManager};
use pfserver::{configure, AppState};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pfserver")]
#[command(about = "Executor service for a single flow", long_about = None)]
struct Args {
    /// Flow file (flow.dag.yaml)
    #[arg(long)]
    flow: PathBuf,

    /// Directory that relative paths in the flow resolve against
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Where a startup failure is written as an error dict
    #[arg(long)]
    error_file: Option<PathBuf>,

    /// YAML or JSON list of connections; falls back to PF_CONNECTIONS_FILE
    #[arg(long)]
    connections: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("Starting executor service for {}", args.flow.display());

    let executor = match create_executor(&args).await {
        Ok(executor) => executor,
        Err(e) => {
            error!("Failed to create the flow executor: {}", e);
            if let Some(error_file) = &args.error_file {
                write_error_file(error_file, &e);
            }
            return Err(e.into());
        }
    };

    let app_state = web::Data::new(AppState::new(executor));
    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}

async fn create_executor(args: &Args) -> Result<FlowExecutor, FlowError> {
    let mut manager = ToolsManager::new();
    pftools::register_all(&mut manager);

    let connections_file = args
        .connections
        .clone()
        .or_else(|| std::env::var("PF_CONNECTIONS_FILE").ok().map(PathBuf::from));
    let connections: Arc<dyn ConnectionProvider> = match connections_file {
        Some(path) => Arc::new(ConnectionStore::load(&path)?),
        None => Arc::new(ConnectionStore::new()),
    };

    let options = ExecutorOptions::default()
        .with_raise_ex(false)
        .with_tools_manager(Arc::new(RwLock::new(manager)));
    FlowExecutor::create(&args.flow, connections, args.working_dir.as_deref(), options).await
}

fn write_error_file(path: &Path, e: &FlowError) {
    let content = match serde_json::to_string_pretty(&e.to_error_dict()) {
        Ok(content) => content,
        Err(err) => {
            error!("Failed to serialize the startup error: {}", err);
            return;
        }
    };
    if let Err(err) = std::fs::write(path, content) {
        error!("Failed to write the startup error to {}: {}", path.display(), err);
    }
}
