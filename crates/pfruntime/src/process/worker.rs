use super::protocol::{WorkerChannel, WorkerRequest, WorkerResponse};
use crate::executor::{ExecutorOptions, FlowExecutor};
use crate::tools_manager::ToolsManager;
use chrono::Utc;
use indexmap::IndexMap;
use pfcore::{ConnectionStore, FlowError, FlowRunInfo, LineResult};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Serve one pool slot: connect back to the pool, build the executor from
/// the `Init` message, then execute lines until the connection closes or
/// `Shutdown` arrives.
pub async fn run_worker(
    index: usize,
    address: &str,
    tools_manager: Arc<RwLock<ToolsManager>>,
) -> Result<(), FlowError> {
    let mut channel = WorkerChannel::connect(address).await?;
    channel
        .send(&WorkerResponse::Hello {
            index,
            pid: std::process::id(),
        })
        .await?;

    let Some(WorkerRequest::Init {
        flow,
        connections,
        working_dir,
        line_timeout_secs,
    }) = channel.recv::<WorkerRequest>().await?
    else {
        tracing::info!("Process {} exits before initialization.", index);
        return Ok(());
    };

    let options = ExecutorOptions::default()
        .with_raise_ex(false)
        .with_line_timeout(Duration::from_secs(line_timeout_secs))
        .with_tools_manager(tools_manager);
    let connections = Arc::new(ConnectionStore::from_connections(connections.into_values()));
    let executor = match FlowExecutor::create_from_flow(*flow, connections, &working_dir, options).await {
        Ok(executor) => executor,
        Err(e) => {
            tracing::error!("Process {} failed to create the flow executor: {}", index, e);
            channel
                .send(&WorkerResponse::InitFailed {
                    error: e.to_error_dict(),
                })
                .await?;
            return Err(e);
        }
    };
    channel.send(&WorkerResponse::Ready).await?;
    tracing::info!("Process {} is ready to execute lines.", index);

    loop {
        let request = channel.recv::<WorkerRequest>().await?;
        let (run_id, line_number, inputs) = match request {
            Some(WorkerRequest::ExecLine {
                run_id,
                line_number,
                inputs,
            }) => (run_id, line_number, inputs),
            Some(WorkerRequest::Init { .. }) => {
                tracing::warn!("Process {} is already initialized.", index);
                continue;
            }
            Some(WorkerRequest::Shutdown) | None => break,
        };

        let start_time = Utc::now();
        let line = executor.exec_line_async(inputs.clone(), Some(line_number), Some(&run_id));
        // The pool closes the connection to stop a running line
        let outcome = tokio::select! {
            result = line => Some(result),
            _ = channel.recv::<WorkerRequest>() => None,
        };
        let Some(result) = outcome else {
            tracing::warn!("Connection closed while executing line {}.", line_number);
            break;
        };
        let result = result.unwrap_or_else(|e| LineResult {
            output: IndexMap::new(),
            aggregation_inputs: IndexMap::new(),
            run_info: FlowRunInfo::create_with_error(
                start_time,
                inputs,
                Some(line_number),
                &run_id,
                e.to_error_dict(),
            ),
            node_run_infos: IndexMap::new(),
        });
        channel
            .send(&WorkerResponse::LineResult {
                result: Box::new(result),
            })
            .await?;
    }
    tracing::info!("Process {} exits.", index);
    Ok(())
}
