use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ipnetwork::Ipv4Network;
use tracing_subscriber::EnvFilter;

use autod::client::AutodClient;
use autod::config::{
    generate_node_id, DispatchConfig, ExecConfig, NodeConfig, RegistrarConfig, Role, ScanConfig,
};
use autod::discovery::ScanStatus;
use autod::exec::{ExecRequest, ExecResponse};
use autod::node::Node;
use autod::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "autod")]
#[command(version)]
#[command(about = "Control plane for a fleet of embedded network nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start an autod node
    Server(ServerArgs),

    /// List nodes known to a node
    Nodes {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Scan control (coordinator)
    Scan {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ScanCommands,
    },

    /// Slot routing (coordinator)
    Slot {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: SlotCommands,
    },

    /// Run a command directly on one node
    Exec {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        exec: ExecArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node id; defaults to "<hostname>-<random>"
    #[arg(long, env = "AUTOD_NODE_ID")]
    node_id: Option<String>,

    #[arg(long, env = "AUTOD_ROLE", value_enum, default_value = "worker")]
    role: Role,

    #[arg(long, env = "AUTOD_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// host:port other nodes use to reach this one
    #[arg(long, env = "AUTOD_ADVERTISE")]
    advertise: Option<String>,

    /// Slots served by this node (comma-separated)
    #[arg(long = "slot", env = "AUTOD_SLOTS", value_delimiter = ',')]
    slots: Vec<String>,

    #[arg(long, env = "AUTOD_DEVICE")]
    device: Option<String>,

    /// Capabilities reported on /caps (comma-separated)
    #[arg(long, env = "AUTOD_CAPS", value_delimiter = ',')]
    caps: Vec<String>,

    // === Execution ===
    /// Program that receives every execution request
    #[arg(long, env = "AUTOD_EXEC_HANDLER", default_value = "/usr/bin/exec-handler.sh")]
    exec_handler: PathBuf,

    #[arg(long, env = "AUTOD_EXEC_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    exec_timeout: Duration,

    #[arg(long, env = "AUTOD_EXEC_MAX_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    exec_max_timeout: Duration,

    /// Cap applied to stdout and stderr separately
    #[arg(long, env = "AUTOD_MAX_OUTPUT_BYTES", default_value = "65536")]
    max_output_bytes: usize,

    #[arg(long, env = "AUTOD_KILL_GRACE", default_value = "200ms", value_parser = humantime::parse_duration)]
    kill_grace: Duration,

    // === Registration (worker) ===
    /// Coordinator base url, e.g. http://10.0.0.1:8080
    #[arg(long, env = "AUTOD_COORDINATOR_URL")]
    coordinator_url: Option<String>,

    #[arg(long, env = "AUTOD_REGISTER_INTERVAL", default_value = "15s", value_parser = humantime::parse_duration)]
    register_interval: Duration,

    // === Scanning (coordinator) ===
    /// Scan at startup and every --probe-interval
    #[arg(long, env = "AUTOD_SCAN")]
    scan: bool,

    /// Extra CIDR ranges to scan (comma-separated)
    #[arg(long = "scan-range", env = "AUTOD_SCAN_RANGES", value_delimiter = ',')]
    scan_ranges: Vec<Ipv4Network>,

    /// Do not sweep the subnets of local interfaces
    #[arg(long)]
    no_local_subnets: bool,

    /// Do not seed targets from the ARP cache
    #[arg(long)]
    no_arp: bool,

    #[arg(long, env = "AUTOD_PROBE_PORT", default_value = "8080")]
    probe_port: u16,

    #[arg(long, env = "AUTOD_PROBE_INTERVAL", default_value = "45s", value_parser = humantime::parse_duration)]
    probe_interval: Duration,

    #[arg(long, env = "AUTOD_SCAN_CONCURRENCY", default_value = "16")]
    scan_concurrency: usize,

    #[arg(long, env = "AUTOD_SCAN_MAX_TARGETS", default_value = "1024")]
    scan_max_targets: usize,

    // === Dispatch / registry ===
    #[arg(long, env = "AUTOD_DISPATCH_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    dispatch_timeout: Duration,

    /// Bind a slot to a node when it registers, as slot=node_id (comma-separated)
    #[arg(long = "slot-prefer", env = "AUTOD_SLOT_PREFER", value_delimiter = ',', value_parser = parse_slot_preference)]
    slot_preferences: Vec<(String, String)>,

    /// Forget nodes not seen for this long (never, if unset)
    #[arg(long, env = "AUTOD_NODE_TTL", value_parser = humantime::parse_duration)]
    node_ttl: Option<Duration>,

    #[arg(long, env = "AUTOD_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn parse_slot_preference(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((slot, node_id)) if !slot.trim().is_empty() && !node_id.trim().is_empty() => {
            Ok((slot.trim().to_string(), node_id.trim().to_string()))
        }
        _ => Err(format!("expected slot=node_id, got '{}'", s)),
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl ServerArgs {
    fn into_config(self) -> NodeConfig {
        let scan_defaults = ScanConfig::default();
        NodeConfig {
            node_id: self.node_id.unwrap_or_else(generate_node_id),
            role: self.role,
            listen_addr: self.listen,
            advertise: self.advertise,
            slots: self.slots,
            device: self.device,
            version: env!("CARGO_PKG_VERSION").to_string(),
            caps: self.caps,
            node_ttl: self.node_ttl,
            slot_preferences: self.slot_preferences.into_iter().collect(),
            exec: ExecConfig {
                handler: self.exec_handler,
                default_timeout: self.exec_timeout,
                max_timeout: self.exec_max_timeout,
                max_output_bytes: self.max_output_bytes,
                kill_grace: self.kill_grace,
            },
            scan: ScanConfig {
                enabled: self.scan,
                ranges: self.scan_ranges,
                include_local_subnets: !self.no_local_subnets,
                include_arp_cache: !self.no_arp,
                probe_port: self.probe_port,
                interval: self.probe_interval,
                concurrency: self.scan_concurrency,
                max_targets: self.scan_max_targets,
                ..scan_defaults
            },
            registrar: RegistrarConfig {
                coordinator_url: self.coordinator_url,
                interval: self.register_interval,
                ..RegistrarConfig::default()
            },
            dispatch: DispatchConfig {
                timeout: self.dispatch_timeout,
                ..DispatchConfig::default()
            },
        }
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Node address
    #[arg(long, short = 'a', env = "AUTOD_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Request timeout
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Target path passed to the handler
    command_path: String,

    /// Arguments after the target path
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Execution deadline in milliseconds (node default if unset)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl ExecArgs {
    fn into_request(self) -> ExecRequest {
        let mut request = ExecRequest::new(self.command_path, self.args);
        request.timeout_ms = self.timeout_ms;
        request
    }
}

#[derive(clap::Subcommand, Debug)]
enum ScanCommands {
    /// Start a scan in the background
    Start,
    /// Show scan progress
    Status,
}

#[derive(clap::Subcommand, Debug)]
enum SlotCommands {
    /// List slot bindings
    List,
    /// Bind a slot to a node
    Bind { slot: String, node_id: String },
    /// Remove a slot binding
    Unbind { slot: String },
    /// Run a command on the node bound to a slot
    Exec {
        slot: String,

        #[command(flatten)]
        exec: ExecArgs,
    },
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&args.log_format);

    let config = args.into_config();
    let shutdown = install_shutdown_handler()?;

    let node = Node::bind(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_nodes(
    client: &AutodClient,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = client.nodes().await?;
    match output {
        OutputFormat::Json => print_json(&body)?,
        OutputFormat::Table => {
            if body.nodes.is_empty() {
                println!("No nodes known.");
            } else {
                println!(
                    "{:<28} {:<22} {:<12} {:<11} {:<8} SLOTS",
                    "ID", "ADDRESS", "ROLE", "SOURCE", "HEALTH"
                );
                println!("{}", "-".repeat(92));
                for node in &body.nodes {
                    let health = if node.healthy { "[+]" } else { "[-]" };
                    let slots: Vec<&str> = node.slots.iter().map(String::as_str).collect();
                    println!(
                        "{:<28} {:<22} {:<12} {:<11} {:<8} {}",
                        node.id,
                        node.address,
                        node.role.to_string(),
                        node.source.to_string(),
                        health,
                        slots.join(",")
                    );
                }
            }
            if let Some(ref scan) = body.scan {
                println!();
                print_scan_table(scan);
            }
        }
    }
    Ok(())
}

fn print_scan_table(scan: &ScanStatus) {
    println!(
        "Scan: {:?} {}/{} ({}%)",
        scan.phase, scan.targets_done, scan.targets_total, scan.progress_pct
    );
    if let Some(started) = scan.started_at {
        println!("Started:  {}", started.to_rfc3339());
    }
    if let Some(finished) = scan.finished_at {
        println!("Finished: {}", finished.to_rfc3339());
    }
}

async fn handle_scan(
    client: &AutodClient,
    command: ScanCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ScanCommands::Start => {
            let body = client.start_scan().await?;
            match output {
                OutputFormat::Json => print_json(&body)?,
                OutputFormat::Table => {
                    if body.rescan == "started" {
                        println!("Scan started.");
                    } else {
                        println!("A scan is already running.");
                    }
                    print_scan_table(&body.scan);
                }
            }
        }
        ScanCommands::Status => {
            let scan = client.scan_status().await?;
            match output {
                OutputFormat::Json => print_json(&scan)?,
                OutputFormat::Table => print_scan_table(&scan),
            }
        }
    }
    Ok(())
}

async fn handle_slot(
    client: &AutodClient,
    command: SlotCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        SlotCommands::List => {
            let body = client.slots().await?;
            match output {
                OutputFormat::Json => print_json(&body)?,
                OutputFormat::Table => {
                    if body.slots.is_empty() {
                        println!("No slots bound.");
                    } else {
                        println!("{:<20} NODE", "SLOT");
                        println!("{}", "-".repeat(48));
                        for (slot, node_id) in &body.slots {
                            println!("{:<20} {}", slot, node_id);
                        }
                    }
                }
            }
        }
        SlotCommands::Bind { slot, node_id } => {
            let body = client.bind_slot(&slot, &node_id).await?;
            match output {
                OutputFormat::Json => print_json(&body)?,
                OutputFormat::Table => println!("Slot {} -> {}", body.slot, body.node_id),
            }
        }
        SlotCommands::Unbind { slot } => {
            let body = client.unbind_slot(&slot).await?;
            match output {
                OutputFormat::Json => print_json(&body)?,
                OutputFormat::Table if body.removed => println!("Slot {} unbound", body.slot),
                OutputFormat::Table => println!("Slot {} was not bound", body.slot),
            }
        }
        SlotCommands::Exec { slot, exec } => {
            let response = client.slot_exec(&slot, &exec.into_request()).await?;
            print_exec(&response, output)?;
        }
    }
    Ok(())
}

fn print_exec(
    response: &ExecResponse,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => print_json(response)?,
        OutputFormat::Table => {
            print!("{}", response.stdout);
            eprint!("{}", response.stderr);
            if let Some(ref error) = response.error {
                eprintln!("Error: {}", error);
            }
            if response.exit_code != 0 {
                std::process::exit(response.exit_code);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Nodes { client } => {
            let api = AutodClient::new(&client.addr, client.timeout)?;
            handle_nodes(&api, &client.output).await?;
        }
        Commands::Scan { client, command } => {
            let api = AutodClient::new(&client.addr, client.timeout)?;
            handle_scan(&api, command, &client.output).await?;
        }
        Commands::Slot { client, command } => {
            let api = AutodClient::new(&client.addr, client.timeout)?;
            handle_slot(&api, command, &client.output).await?;
        }
        Commands::Exec { client, exec } => {
            let api = AutodClient::new(&client.addr, client.timeout)?;
            let response = api.exec(&exec.into_request()).await?;
            print_exec(&response, &client.output)?;
        }
    }

    Ok(())
}
