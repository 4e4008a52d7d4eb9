//! Flowdeck command line tool.
//!
//! Starts workflow runs and follows their live event stream in the
//! terminal. All protocol work happens in the sync engine; this binary only
//! reads store snapshots and issues commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowdeck_sync::approval::ApprovalCommand;
use flowdeck_sync::{
    ApprovalDecision, ConnectionState, ControlPlaneClient, EventStreamClient, ExecutionEvent,
    SyncConfig, WorkflowStateStore,
};

#[derive(Parser)]
#[command(name = "flowdeck")]
#[command(version, about = "Flowdeck workflow run monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Control plane base URL (overrides FLOWDECK_SERVER_URL)
    #[arg(long)]
    server_url: Option<String>,

    /// Event channel base URL (overrides FLOWDECK_WS_URL)
    #[arg(long)]
    ws_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run of a workflow
    Run {
        /// Workflow id
        workflow_id: String,

        /// Run input as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,

        /// Follow the run's event stream until it finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Follow the live event stream of a run
    Watch {
        /// Execution id
        execution_id: String,

        /// Workflow id, used to load node definitions for status tracking
        #[arg(long)]
        workflow_id: Option<String>,
    },

    /// Approve the pending approval gate of a run
    Approve {
        /// Execution id
        execution_id: String,

        #[arg(long, default_value = "flowdeck-cli")]
        approver: String,

        #[arg(long, default_value = "")]
        comment: String,
    },

    /// Reject the pending approval gate of a run
    Reject {
        /// Execution id
        execution_id: String,

        #[arg(long, default_value = "flowdeck-cli")]
        approver: String,

        #[arg(long, default_value = "")]
        comment: String,
    },

    /// Print the persisted event log of a run
    Replay {
        /// Execution id
        execution_id: String,

        /// Only events at or after this epoch-seconds timestamp
        #[arg(long)]
        from: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,flowdeck_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(url) = cli.server_url {
        config.server_url = url;
    }
    if let Some(url) = cli.ws_url {
        config.ws_url = url;
    }

    let api = ControlPlaneClient::new(&config.server_url, config.request_timeout);

    match cli.command {
        Commands::Run {
            workflow_id,
            input,
            watch,
        } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let response = api.start_run(&workflow_id, input).await?;
            println!("execution started: {}", response.execution_id);
            if watch {
                watch_run(&config, &api, Some(&workflow_id), &response.execution_id).await?;
            }
        }
        Commands::Watch {
            execution_id,
            workflow_id,
        } => {
            watch_run(&config, &api, workflow_id.as_deref(), &execution_id).await?;
        }
        Commands::Approve {
            execution_id,
            approver,
            comment,
        } => {
            resolve(
                &api,
                &execution_id,
                ApprovalDecision::Approve,
                &approver,
                &comment,
            )
            .await?;
        }
        Commands::Reject {
            execution_id,
            approver,
            comment,
        } => {
            resolve(
                &api,
                &execution_id,
                ApprovalDecision::Reject,
                &approver,
                &comment,
            )
            .await?;
        }
        Commands::Replay { execution_id, from } => {
            replay(&api, &execution_id, from).await?;
        }
    }

    Ok(())
}

/// Follow a run until it finishes, the connection is lost, or ctrl-c.
async fn watch_run(
    config: &SyncConfig,
    api: &ControlPlaneClient,
    workflow_id: Option<&str>,
    execution_id: &str,
) -> Result<()> {
    let store = WorkflowStateStore::new(config.dedup_capacity);

    // When only the execution id is known, the execution snapshot names the
    // workflow it runs.
    let workflow_id = match workflow_id {
        Some(id) => Some(id.to_string()),
        None => match api.fetch_execution(execution_id).await {
            Ok(snapshot) => snapshot
                .get("workflow_id")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            Err(err) => {
                tracing::debug!(error = %err, "No execution snapshot available");
                None
            }
        },
    };

    if let Some(workflow_id) = &workflow_id {
        match api.fetch_workflow(workflow_id).await {
            Ok(definition) => {
                println!(
                    "workflow: {} ({} nodes)",
                    definition.name,
                    definition.nodes.len()
                );
                store
                    .set_definition(&definition.id, definition.nodes, definition.edges)
                    .await;
            }
            Err(err) => {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    error = %err,
                    "Could not load workflow definition, node statuses will not be tracked"
                );
            }
        }
    }
    store.begin_run(execution_id).await;

    let client = EventStreamClient::new(config.clone(), store.clone(), api.clone());

    // Subscribe before connecting so a fast-finishing run cannot slip
    // between the first snapshot and the first change notification.
    let mut revisions = store.subscribe();
    let mut connection = client.subscribe_connection();
    client.connect(execution_id).await;
    let mut printed = 0usize;
    let mut notified_approval: Option<String> = None;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("stopping");
                break Ok(());
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snapshot = store.snapshot().await;

                for event in &snapshot.events[printed..] {
                    print_event(event);
                }
                printed = snapshot.events.len();

                if let Some(approval) = &snapshot.active_approval {
                    if notified_approval.as_deref() != Some(approval.id.as_str()) {
                        println!(
                            "approval required on node {}: {}",
                            approval.node_id, approval.title
                        );
                        println!(
                            "  resolve with: flowdeck approve {execution_id}  (or: flowdeck reject {execution_id})"
                        );
                        notified_approval = Some(approval.id.clone());
                    }
                }

                if snapshot.mode.is_terminal() {
                    match &snapshot.output {
                        Some(output) => println!("run {}: {}", snapshot.mode, output.result),
                        None => println!("run {}", snapshot.mode),
                    }
                    break Ok(());
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *connection.borrow();
                if state == ConnectionState::Disconnected && !store.mode().await.is_terminal() {
                    break Err(anyhow::anyhow!(
                        "connection lost; re-run `flowdeck watch {execution_id}` to retry"
                    ));
                }
            }
        }
    };

    client.disconnect().await;
    outcome
}

async fn resolve(
    api: &ControlPlaneClient,
    execution_id: &str,
    decision: ApprovalDecision,
    approver: &str,
    comment: &str,
) -> Result<()> {
    let command = ApprovalCommand {
        action: decision,
        approver: approver.to_string(),
        comment: comment.to_string(),
    };
    let outcome = api.resolve_approval(execution_id, &command).await?;
    println!("approval {}", outcome.status);
    Ok(())
}

async fn replay(api: &ControlPlaneClient, execution_id: &str, from: Option<f64>) -> Result<()> {
    let events = api.replay_events(execution_id, from).await?;
    if events.is_empty() {
        println!("no events recorded");
        return Ok(());
    }
    for replay_event in events {
        match replay_event.into_event() {
            Ok(event) => print_event(&event),
            Err(err) => {
                tracing::warn!(error = %err, "Skipping undecodable event");
            }
        }
    }
    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    let time = event.timestamp.format("%H:%M:%S");
    let node = event.node_id.as_deref().unwrap_or("-");
    match &event.error {
        Some(error) => println!("{time}  {:<24} {node}  {error}", event.event_type),
        None => println!("{time}  {:<24} {node}", event.event_type),
    }
}
