use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use caption_fleet::api::{DeleteResponse, SubmitRequest, SubmitResponse};
use caption_fleet::config::{FleetConfig, NodeConfig};
use caption_fleet::lifecycle::install_shutdown_handler;
use caption_fleet::monitor::MonitorEvent;
use caption_fleet::node::Node;
use caption_fleet::scheduler::SchedulingPolicy;

#[derive(Parser, Debug)]
#[command(name = "caption-fleet")]
#[command(version)]
#[command(about = "Multi-tenant captioning and embedding worker fleet")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node: HTTP API, monitor and workers
    Server(ServerArgs),

    /// Task management commands
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Show a tenant's queue, processing and done sets
    Status {
        #[command(flatten)]
        client: ClientArgs,

        /// Tenant to inspect
        tenant: String,
    },

    /// Show or clear the monitor's recovery events
    Events {
        #[command(flatten)]
        client: ClientArgs,

        /// Maximum number of events to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Clear the event feed instead of showing it
        #[arg(long)]
        clear: bool,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP API
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Directory resource paths are resolved against
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for per-tenant artifacts (default: <data-dir>/artifacts)
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    /// Number of workers to run in this process (0 for none)
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Prefix for worker names; must be unique per process in a shared fleet
    /// (default: "worker", or "worker-<random>" with a shared store)
    #[arg(long)]
    worker_prefix: Option<String>,

    /// Coordination store shared by every node, e.g. redis://127.0.0.1:6379/0
    /// (default: a store inside this process)
    #[arg(long)]
    store_url: Option<String>,

    /// Do not serve the HTTP API from this node
    #[arg(long)]
    no_api: bool,

    /// Do not run the monitor in this node
    #[arg(long)]
    no_monitor: bool,

    /// Heartbeat interval in milliseconds; the heartbeat TTL is five intervals
    #[arg(long, default_value = "2000")]
    heartbeat_interval_ms: u64,

    /// Monitor sweep interval in milliseconds
    #[arg(long, default_value = "5000")]
    monitor_interval_ms: u64,

    /// Processing time after which a task is reclaimed, in milliseconds
    #[arg(long, default_value = "60000")]
    processing_timeout_ms: u64,

    /// How workers choose between tenants
    #[arg(long, value_enum, default_value = "depth-weighted")]
    policy: SchedulingPolicy,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Queue resource paths for a tenant
    Submit {
        tenant: String,
        #[arg(required = true)]
        resource_paths: Vec<String>,
    },
    /// Remove a still-queued task
    Delete { tenant: String, resource_path: String },
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let fleet = FleetConfig::default()
        .with_heartbeat_interval(args.heartbeat_interval_ms)
        .with_monitor_interval(args.monitor_interval_ms)
        .with_processing_timeout(args.processing_timeout_ms)
        .with_scheduling_policy(args.policy);

    let mut config = NodeConfig::new(listen_addr, args.data_dir)
        .with_workers(args.workers)
        .with_roles(!args.no_api, !args.no_monitor)
        .with_fleet(fleet);
    if let Some(artifact_dir) = args.artifact_dir {
        config.artifact_dir = artifact_dir;
    }
    match (args.worker_prefix, &args.store_url) {
        (Some(prefix), _) => config.worker_prefix = prefix,
        (None, Some(_)) => {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            config.worker_prefix = format!("worker-{}", &suffix[..8]);
        }
        (None, None) => {}
    }
    if let Some(url) = args.store_url {
        config = config.with_store_url(url);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        workers = config.worker_count,
        worker_prefix = %config.worker_prefix,
        shared_store = config.store_url.is_some(),
        api = config.run_api,
        monitor = config.run_monitor,
        policy = ?config.fleet.scheduling_policy,
        "Starting caption-fleet node"
    );

    let shutdown = install_shutdown_handler();
    Node::connect(config).await?.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn tenant_url(&self, tenant: &str, rest: &str) -> String {
        self.url(&format!("/api/tenants/{}/{}", urlencoding::encode(tenant), rest))
    }

    async fn read<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body["error"].as_str().unwrap_or("request failed");
            return Err(format!("{}: {}", status, message).into());
        }
        Ok(response.json().await?)
    }
}

/// Encode a resource path for use as a URL path tail, keeping `/` between
/// segments.
fn encode_path(raw: &str) -> String {
    raw.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn handle_task_submit(
    client: &ApiClient,
    tenant: &str,
    resource_paths: Vec<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .http
        .post(client.tenant_url(tenant, "tasks"))
        .json(&SubmitRequest { resource_paths })
        .send()
        .await?;
    let resp: SubmitResponse = ApiClient::read(response).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
        OutputFormat::Table => println!("Queued {} task(s) for tenant {}", resp.queued, tenant),
    }
    Ok(())
}

async fn handle_task_delete(
    client: &ApiClient,
    tenant: &str,
    resource_path: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .http
        .delete(client.tenant_url(
            tenant,
            &format!("queue/{}", encode_path(resource_path)),
        ))
        .send()
        .await?;
    let resp: DeleteResponse = ApiClient::read(response).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
        OutputFormat::Table => println!("Removed {} queued occurrence(s)", resp.removed),
    }
    Ok(())
}

async fn handle_status(
    client: &ApiClient,
    tenant: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .http
        .get(client.tenant_url(tenant, "status"))
        .send()
        .await?;
    let status: Value = ApiClient::read(response).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => {
            println!("Tenant:     {}", tenant);
            println!("Queued:     {}", status["queue"]);
            println!(
                "Processing: {}",
                status["processing"].as_array().map(Vec::len).unwrap_or(0)
            );
            println!(
                "Done:       {}",
                status["done"].as_array().map(Vec::len).unwrap_or(0)
            );

            if let Some(workers) = status["processing_workers"].as_object() {
                if !workers.is_empty() {
                    println!();
                    println!("{:<40} WORKER", "PROCESSING");
                    println!("{}", "-".repeat(60));
                    for (path, worker) in workers {
                        println!("{:<40} {}", path, worker.as_str().unwrap_or("-"));
                    }
                }
            }

            if let Some(errors) = status["errors"].as_object() {
                if !errors.is_empty() {
                    println!();
                    println!("{:<40} {:<8} ERROR", "RESOURCE", "RETRIES");
                    println!("{}", "-".repeat(78));
                    for (path, error) in errors {
                        let retries = status["retries"][path].as_u64().unwrap_or(0);
                        println!(
                            "{:<40} {:<8} {}",
                            path,
                            retries,
                            error.as_str().unwrap_or("")
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_events(
    client: &ApiClient,
    limit: usize,
    clear: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if clear {
        let response = client
            .http
            .post(client.url("/api/monitor/events/reset"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(format!("{}: failed to clear events", response.status()).into());
        }
        println!("Monitor events cleared");
        return Ok(());
    }

    let response = client
        .http
        .get(client.url("/api/monitor/events"))
        .query(&[("limit", limit)])
        .send()
        .await?;
    let events: Vec<MonitorEvent> = ApiClient::read(response).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
        OutputFormat::Table => {
            if events.is_empty() {
                println!("No monitor events.");
            } else {
                println!("{:<26} {:<14} {:<16} TASKS", "TIME", "TYPE", "WORKER");
                println!("{}", "-".repeat(78));
                for event in &events {
                    let worker = event
                        .worker
                        .as_ref()
                        .map(|w| w.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let tasks: Vec<String> = event.tasks.iter().map(|t| t.to_string()).collect();
                    println!(
                        "{:<26} {:<14} {:<16} {}",
                        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                        event.kind,
                        worker,
                        tasks.join(", ")
                    );
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Task { client, command } => {
            let api = ApiClient::new(&client.addr);
            match command {
                TaskCommands::Submit {
                    tenant,
                    resource_paths,
                } => {
                    handle_task_submit(&api, &tenant, resource_paths, &client.output).await?;
                }
                TaskCommands::Delete {
                    tenant,
                    resource_path,
                } => {
                    handle_task_delete(&api, &tenant, &resource_path, &client.output).await?;
                }
            }
        }
        Commands::Status { client, tenant } => {
            let api = ApiClient::new(&client.addr);
            handle_status(&api, &tenant, &client.output).await?;
        }
        Commands::Events {
            client,
            limit,
            clear,
        } => {
            let api = ApiClient::new(&client.addr);
            handle_events(&api, limit, clear, &client.output).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_paths_keep_their_separators() {
        assert_eq!(encode_path("dir/a b.png"), "dir/a%20b.png");
        assert_eq!(encode_path("100%/x?.png"), "100%25/x%3F.png");
    }

    #[test]
    fn tenant_segment_is_encoded() {
        let client = ApiClient::new("http://localhost:8000/");
        assert_eq!(
            client.tenant_url("a/b", "status"),
            "http://localhost:8000/api/tenants/a%2Fb/status"
        );
    }
}
