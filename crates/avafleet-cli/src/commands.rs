use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::debug;

use crate::display::{ClusterInfo, LocalNodeRow, NodeStatusRow, ValidationRow, WhitelistRow};
use crate::http;
use crate::logging::{self, LogFormat};
use crate::output::{self, OutputFormat};
use crate::ui;

use avafleet_coordinator::chain::{ExternalSigner, HttpAggregator, PChainClient};
use avafleet_coordinator::fleet::{CreateRequest, Fleet, RegionRequest};
use avafleet_coordinator::local::LocalNetwork;
use avafleet_coordinator::transfer::{self, ClusterExport};
use avafleet_coordinator::validator::{ChainClients, L1Request, StakeRequest, ValidatorOrchestrator};
use avafleet_core::config::{Authorization, CommandOptions, FleetPaths, Settings};
use avafleet_core::error::FleetError;
use avafleet_core::network::NetworkIdentity;
use avafleet_core::node::{CloudService, Host, NodeRole};
use avafleet_runtime::cloud::pool::RegionPool;
use avafleet_runtime::gateway::{RemoteExecutor, SshExecutor};
use avafleet_runtime::prober::Prober;
use avafleet_runtime::registry::Registry;

#[derive(Parser)]
#[command(name = "avafleet", version, about = "Avalanche validator fleet manager")]
struct Cli {
    /// Output format: table, json, yaml
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: String,

    /// Log format: human, json
    #[arg(long, global = true, default_value = "human")]
    log_format: String,

    #[command(flatten)]
    flags: GlobalFlags,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default, Clone)]
struct GlobalFlags {
    /// Use cloud credentials without prompting
    #[arg(long, global = true)]
    authorize_access: bool,
    /// Remove node records and cloud resources without prompting
    #[arg(long, global = true)]
    authorize_remove: bool,
    /// Same as --authorize-access --authorize-remove
    #[arg(long, global = true)]
    authorize_all: bool,
    /// Overwrite existing clusters, node records or files
    #[arg(long, global = true)]
    force: bool,
    /// AWS profile to use
    #[arg(long, global = true)]
    profile: Option<String>,
    /// SSH private key for nodes without one on record
    #[arg(long, global = true)]
    ssh_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, tear down and inspect clusters
    Cluster {
        #[command(subcommand)]
        action: ClusterCmd,
    },
    /// Register cluster nodes as validators
    Validate {
        #[command(subcommand)]
        action: ValidateCmd,
    },
    /// Change what running nodes track
    Update {
        #[command(subcommand)]
        action: UpdateCmd,
    },
    /// Clusters of avalanchego processes on this machine
    Local {
        #[command(subcommand)]
        action: LocalCmd,
    },
    /// Allow an IP address to reach every node (SSH, API, Grafana)
    WhitelistIp {
        /// Cluster name
        cluster: String,
        /// IPv4 address to allow
        ip: Option<String>,
        /// Use this machine's public IP
        #[arg(long, conflicts_with = "ip")]
        current_ip: bool,
    },
    /// Authorize an SSH public key on every node
    WhitelistSsh {
        /// Cluster name
        cluster: String,
        /// Public key, or path to a .pub file
        key: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// --- Cluster subcommands ---

#[derive(Subcommand)]
enum ClusterCmd {
    /// Provision instances and register a new cluster
    Create {
        /// Cluster name
        name: String,
        /// Network: mainnet, fuji
        #[arg(long, default_value = "fuji")]
        network: String,
        /// Cloud provider: aws, gcp
        #[arg(long, default_value = "aws")]
        cloud: String,
        /// Regions (AWS) or zones (GCP), comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        regions: Vec<String>,
        /// Validators per region, one value for all or one per region
        #[arg(long, value_delimiter = ',', default_value = "1")]
        num_validators: Vec<usize>,
        /// API nodes per region, one value for all or one per region
        #[arg(long, value_delimiter = ',', default_value = "0")]
        num_apis: Vec<usize>,
        #[arg(long, default_value = "c5.2xlarge")]
        instance_type: String,
        /// Machine image; empty uses the provider default
        #[arg(long, default_value = "")]
        image: String,
        /// Give every node a static public IP
        #[arg(long)]
        use_static_ip: bool,
        /// AWS security group, or GCP network
        #[arg(long, default_value = "avafleet")]
        security_group: String,
        #[arg(long, default_value = "avafleet")]
        key_pair: String,
        /// Private key of the key pair
        #[arg(long)]
        key_path: String,
    },
    /// Terminate every instance and remove the cluster
    Destroy {
        name: String,
    },
    /// Stop every instance and remove the cluster
    Stop {
        name: String,
    },
    /// Register a cluster from an export file
    Import {
        /// Export file
        file: String,
        /// Name for the imported cluster
        name: String,
    },
    /// Write a cluster's records to a file or stdout
    Export {
        name: String,
        /// Output file; stdout when omitted
        #[arg(long)]
        file: Option<String>,
        /// Include private staking keys
        #[arg(long)]
        include_secrets: bool,
    },
    /// Run a command on every node
    Ssh {
        name: String,
        /// Command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Open an interactive SSH session on one node
    Shell {
        name: String,
        /// Node ID or inventory ID; the first node when omitted
        node: Option<String>,
    },
    /// Role, address, bootstrap and health of every node
    Status {
        name: String,
    },
}

// --- Validate subcommands ---

#[derive(Args, Debug, Clone)]
struct StakeArgs {
    /// Stake weight; defaults to the network minimum
    #[arg(long)]
    weight: Option<u64>,
    /// Stake duration in hours; defaults to the network default
    #[arg(long)]
    duration_hours: Option<u64>,
}

impl StakeArgs {
    fn request(&self) -> StakeRequest {
        StakeRequest {
            weight: self.weight,
            duration: self.duration_hours.map(|h| Duration::from_secs(h * 3600)),
        }
    }
}

#[derive(Subcommand)]
enum ValidateCmd {
    /// Make every validator node a Primary Network validator
    Primary {
        cluster: String,
        #[command(flatten)]
        stake: StakeArgs,
    },
    /// Make every validator node a validator of a subnet
    Subnet {
        cluster: String,
        #[arg(long)]
        subnet_id: String,
        #[arg(long)]
        blockchain_id: String,
        /// Subnet validator weight
        #[arg(long)]
        weight: Option<u64>,
        /// Primary Network stake weight
        #[arg(long)]
        primary_weight: Option<u64>,
        #[arg(long)]
        duration_hours: Option<u64>,
    },
    /// Register every validator node with an L1's validator manager
    L1 {
        cluster: String,
        #[arg(long)]
        subnet_id: String,
        #[arg(long)]
        blockchain_id: String,
        #[arg(long)]
        weight: Option<u64>,
        /// nAVAX deposited per validator for the continuous fee
        #[arg(long)]
        balance: u64,
    },
}

// --- Update subcommands ---

#[derive(Subcommand)]
enum UpdateCmd {
    /// Make every node track a subnet and restart it
    Subnet {
        cluster: String,
        subnet_id: String,
        /// Required RPC protocol version of the subnet's VM
        #[arg(long)]
        rpc_version: Option<u32>,
    },
}

// --- Local subcommands ---

#[derive(Subcommand)]
enum LocalCmd {
    /// Start a local cluster, creating it if needed
    Start {
        name: String,
        /// Nodes in a new cluster
        #[arg(long, default_value = "5")]
        nodes: usize,
    },
    /// Stop every node process
    Stop {
        name: String,
    },
    /// Stop the processes and delete all local data of a cluster
    Destroy {
        name: String,
    },
    /// Track a subnet on every node and restart them
    Track {
        name: String,
        subnet_id: String,
    },
    /// Process, bootstrap and health state of every node
    Status {
        name: String,
    },
    /// Make every local node a Primary Network validator
    Validate {
        name: String,
        #[command(flatten)]
        stake: StakeArgs,
    },
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_str_arg(&cli.log_format));
    let out_fmt = OutputFormat::from_str_arg(&cli.output);

    let result = dispatch(cli.command, &cli.flags, out_fmt);
    if let Err(e) = &result
        && let Some(FleetError::ExpiredCredentials { profile }) = FleetError::of(e)
    {
        ui::expired_credentials(profile);
    }
    result
}

fn dispatch(command: Commands, flags: &GlobalFlags, out_fmt: OutputFormat) -> Result<()> {
    if let Commands::Completions { shell } = command {
        return cmd_completions(shell);
    }
    let mut session = Session::load(flags)?;
    match command {
        Commands::Cluster { action } => cmd_cluster(action, &mut session, out_fmt),
        Commands::Validate { action } => cmd_validate(action, &session, out_fmt),
        Commands::Update { action } => cmd_update(action, &session),
        Commands::Local { action } => cmd_local(action, &mut session, out_fmt),
        Commands::WhitelistIp {
            cluster,
            ip,
            current_ip,
        } => cmd_whitelist_ip(&cluster, ip.as_deref(), current_ip, &mut session, out_fmt),
        Commands::WhitelistSsh { cluster, key } => cmd_whitelist_ssh(&cluster, &key, &session),
        Commands::Completions { .. } => Ok(()),
    }
}

/// Run an async fleet command to completion on a fresh runtime.
fn run_fleet_command<F, T>(f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    runtime.block_on(f)
}

/// Resolve per-invocation options from settings, then flags.
fn command_options(settings: &Settings, flags: &GlobalFlags) -> CommandOptions {
    let mut opts = CommandOptions::from_settings(settings);
    opts.authorize = Authorization {
        access: flags.authorize_access || flags.authorize_all,
        remove: flags.authorize_remove || flags.authorize_all,
    };
    opts.force = flags.force;
    if let Some(profile) = &flags.profile {
        opts.aws_profile = profile.clone();
    }
    if let Some(key) = &flags.ssh_key {
        opts.ssh_private_key = Some(key.clone());
    }
    opts
}

/// State root, settings and options for one invocation.
struct Session {
    paths: FleetPaths,
    settings: Settings,
    opts: CommandOptions,
}

impl Session {
    fn load(flags: &GlobalFlags) -> Result<Self> {
        let paths = FleetPaths::from_env()?;
        let settings = Settings::from_file(&paths.settings_file())?;
        let opts = command_options(&settings, flags);
        debug!(root = %paths.root().display(), "Loaded settings");
        Ok(Self {
            paths,
            settings,
            opts,
        })
    }

    fn registry(&self) -> Registry {
        Registry::new(self.paths.clone())
    }

    fn executor(&self) -> Arc<dyn RemoteExecutor> {
        Arc::new(SshExecutor::new(&self.opts))
    }

    fn fleet(&self) -> Fleet {
        Fleet::new(
            self.registry(),
            RegionPool::from_options(&self.opts),
            self.executor(),
            self.opts.clone(),
        )
    }

    fn local(&self) -> LocalNetwork {
        LocalNetwork::new(self.registry(), self.executor(), &self.settings.local, self.opts.clone())
    }

    fn orchestrator(&self, network: &NetworkIdentity) -> Result<ValidatorOrchestrator> {
        let signer = ExternalSigner::new(&self.settings.chain.signer_command, &network.name())?;
        let clients = ChainClients {
            chain: Arc::new(PChainClient::new(network.endpoint(), signer.clone())?),
            manager: Arc::new(signer),
            aggregator: Arc::new(HttpAggregator::new(&self.settings.chain.aggregator_url)?),
        };
        Ok(ValidatorOrchestrator::new(
            clients,
            Prober::new(self.executor()),
            network.clone(),
            &self.opts,
        ))
    }

    /// Grant a missing authorization by prompting, when there is someone to ask.
    fn authorize(&mut self, remove: bool, prompt: &str, flag: &str) -> Result<()> {
        let granted = if remove {
            self.opts.authorize.remove
        } else {
            self.opts.authorize.access
        };
        if granted {
            return Ok(());
        }
        if !std::io::stdin().is_terminal() {
            anyhow::bail!("Not authorized, use {}", flag);
        }
        if !ui::confirm(prompt) {
            anyhow::bail!("Aborted");
        }
        if remove {
            self.opts.authorize.remove = true;
        } else {
            self.opts.authorize.access = true;
        }
        Ok(())
    }
}

fn cmd_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "avafleet", &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Cluster
// ============================================================================

fn parse_cloud(s: &str) -> Result<CloudService> {
    match s.to_lowercase().as_str() {
        "aws" => Ok(CloudService::Aws),
        "gcp" => Ok(CloudService::Gcp),
        other => anyhow::bail!("Unknown cloud {:?}: expected aws or gcp", other),
    }
}

/// Per-region count from a list holding one value for all regions or one per region.
fn per_region(counts: &[usize], regions: usize, what: &str) -> Result<Vec<usize>> {
    match counts.len() {
        1 => Ok(vec![counts[0]; regions]),
        n if n == regions => Ok(counts.to_vec()),
        n => anyhow::bail!("--{} has {} values for {} regions", what, n, regions),
    }
}

fn cmd_cluster(action: ClusterCmd, session: &mut Session, out_fmt: OutputFormat) -> Result<()> {
    match action {
        ClusterCmd::Create {
            name,
            network,
            cloud,
            regions,
            num_validators,
            num_apis,
            instance_type,
            image,
            use_static_ip,
            security_group,
            key_pair,
            key_path,
        } => {
            let cloud = parse_cloud(&cloud)?;
            let network = NetworkIdentity::from_name(&network)?;
            let validators = per_region(&num_validators, regions.len(), "num-validators")?;
            let apis = per_region(&num_apis, regions.len(), "num-apis")?;
            session.authorize(
                false,
                &format!("Create instances for cluster {} with your {} credentials?", name, cloud),
                "--authorize-access",
            )?;

            let mut requests = Vec::new();
            for (i, region) in regions.iter().enumerate() {
                for (role, count) in [(NodeRole::Validator, validators[i]), (NodeRole::Api, apis[i])] {
                    if count == 0 {
                        continue;
                    }
                    requests.push(RegionRequest {
                        cloud,
                        region: region.clone(),
                        count,
                        role,
                        security_group: security_group.clone(),
                        key_pair: key_pair.clone(),
                        key_path: key_path.clone(),
                    });
                }
            }
            if requests.is_empty() {
                anyhow::bail!("Nothing to create: every region has zero nodes");
            }
            let request = CreateRequest {
                cluster: name.clone(),
                network,
                instance_type,
                image,
                use_static_ip,
                regions: requests,
            };

            let fleet = session.fleet();
            let pb = ui::spinner(&format!("Creating cluster {}...", name));
            let created = run_fleet_command(fleet.create(&request));
            pb.finish_and_clear();
            let config = created?;
            ui::success(&format!("Cluster '{}' created.", name));
            output::render_one(&ClusterInfo::new(&name, &config), out_fmt)
        }
        ClusterCmd::Destroy { name } => cmd_teardown(&name, true, session),
        ClusterCmd::Stop { name } => cmd_teardown(&name, false, session),
        ClusterCmd::Import { file, name } => {
            let export = ClusterExport::read(Path::new(&file))?;
            let config = transfer::import(&session.registry(), &export, &name, &session.opts)?;
            ui::success(&format!("Cluster '{}' imported.", name));
            output::render_one(&ClusterInfo::new(&name, &config), out_fmt)
        }
        ClusterCmd::Export {
            name,
            file,
            include_secrets,
        } => {
            let export = transfer::export(&session.registry(), &name, include_secrets)?;
            match file {
                Some(path) => {
                    export.write(Path::new(&path), session.opts.force)?;
                    if include_secrets {
                        ui::warn(&format!("{} contains private staking keys; keep it safe.", path));
                    }
                    ui::success(&format!("Cluster '{}' exported to {}.", name, path));
                }
                None => println!("{}", export.to_json()?),
            }
            Ok(())
        }
        ClusterCmd::Ssh { name, command } => {
            let command = command.join(" ");
            let fleet = session.fleet();
            let result = run_fleet_command(fleet.ssh(&name, &command))?;
            for (node_id, stdout) in result.values() {
                ui::info(&format!("{}:", node_id));
                print!("{}", stdout);
                if !stdout.ends_with('\n') && !stdout.is_empty() {
                    println!();
                }
            }
            for (node_id, reason) in result.failed() {
                ui::error(&format!("{}: {}", node_id, reason));
            }
            result.into_result("run command on")?;
            Ok(())
        }
        ClusterCmd::Shell { name, node } => {
            let host = session.fleet().shell_host(&name, node.as_deref())?;
            open_shell(&host, session.opts.ssh_connect_timeout)
        }
        ClusterCmd::Status { name } => {
            let fleet = session.fleet();
            let rows: Vec<NodeStatusRow> = run_fleet_command(fleet.status(&name))?
                .into_iter()
                .map(NodeStatusRow::from)
                .collect();
            output::render_list(&rows, out_fmt)
        }
    }
}

#[cfg(unix)]
fn open_shell(host: &Host, connect_timeout: Duration) -> Result<()> {
    avafleet_runtime::gateway::interactive_ssh(host, connect_timeout)
}

#[cfg(not(unix))]
fn open_shell(_host: &Host, _connect_timeout: Duration) -> Result<()> {
    anyhow::bail!("Interactive shells are only supported on unix")
}

fn cmd_teardown(name: &str, destroy: bool, session: &mut Session) -> Result<()> {
    let (verb, done) = if destroy {
        ("destroy", "destroyed")
    } else {
        ("stop", "stopped")
    };
    session.authorize(
        true,
        &format!("{} every node of cluster {} and delete their local records?", verb, name),
        "--authorize-remove",
    )?;
    let fleet = session.fleet();
    let pb = ui::spinner(&format!("Running {} on cluster {}...", verb, name));
    let result = if destroy {
        run_fleet_command(fleet.destroy(name))
    } else {
        run_fleet_command(fleet.stop(name))
    };
    pb.finish_and_clear();
    let result = result?;

    ui::node_outcomes(&result, done);
    for (node_id, warnings) in result.values() {
        for warning in warnings {
            ui::warn(&format!("{}: {}", node_id, warning));
        }
    }
    result.into_result(verb)?;
    ui::success(&format!("Cluster '{}' {}.", name, done));
    Ok(())
}

// ============================================================================
// Validators
// ============================================================================

fn cmd_validate(action: ValidateCmd, session: &Session, out_fmt: OutputFormat) -> Result<()> {
    let cluster = match &action {
        ValidateCmd::Primary { cluster, .. }
        | ValidateCmd::Subnet { cluster, .. }
        | ValidateCmd::L1 { cluster, .. } => cluster.clone(),
    };
    let fleet = session.fleet();
    let network = fleet.registry().cluster(&cluster)?.network;
    let hosts = fleet.validator_hosts(&cluster)?;
    let orchestrator = session.orchestrator(&network)?;

    match action {
        ValidateCmd::Primary { stake, .. } => validate_primary(&orchestrator, &hosts, &stake.request()),
        ValidateCmd::Subnet {
            subnet_id,
            blockchain_id,
            weight,
            primary_weight,
            duration_hours,
            ..
        } => {
            let duration = duration_hours.map(|h| Duration::from_secs(h * 3600));
            let primary = StakeRequest {
                weight: primary_weight,
                duration,
            };
            let subnet = StakeRequest { weight, duration };
            let pb = ui::spinner(&format!("Adding {} nodes as validators of {}...", hosts.len(), subnet_id));
            let result = run_fleet_command(orchestrator.validate_subnet(
                &hosts,
                &subnet_id,
                &blockchain_id,
                &primary,
                &subnet,
            ));
            pb.finish_and_clear();
            let result = result?;
            ui::node_outcomes(&result, "is validating the subnet");
            result.into_result("add subnet validator on")?;
            ui::success(&format!("All nodes of {} validate subnet {}.", cluster, subnet_id));
            Ok(())
        }
        ValidateCmd::L1 {
            subnet_id,
            blockchain_id,
            weight,
            balance,
            ..
        } => {
            let request = L1Request {
                subnet_id,
                blockchain_id,
                weight,
                balance,
            };
            let pb = ui::spinner(&format!("Registering {} nodes as L1 validators...", hosts.len()));
            let result = run_fleet_command(orchestrator.validate_l1(&hosts, &request));
            pb.finish_and_clear();
            let result = result?;
            ui::node_outcomes(&result, "registered");
            let rows: Vec<ValidationRow> = result
                .values()
                .map(|(node_id, id)| ValidationRow {
                    node_id: node_id.clone(),
                    validation_id: id.to_string(),
                })
                .collect();
            if !rows.is_empty() {
                output::render_list(&rows, out_fmt)?;
            }
            result.into_result("register L1 validator on")?;
            Ok(())
        }
    }
}

fn validate_primary(orchestrator: &ValidatorOrchestrator, hosts: &[Host], request: &StakeRequest) -> Result<()> {
    let pb = ui::spinner(&format!("Adding {} nodes as Primary Network validators...", hosts.len()));
    let result = run_fleet_command(orchestrator.validate_primary(hosts, request));
    pb.finish_and_clear();
    let result = result?;
    ui::node_outcomes(&result, "validation transaction issued");
    let skipped = result.values().filter(|(_, issued)| !**issued).count();
    if skipped > 0 {
        ui::info(&format!("{} node(s) were already Primary Network validators.", skipped));
    }
    result.into_result("add primary validator on")?;
    Ok(())
}

// ============================================================================
// Update
// ============================================================================

fn cmd_update(action: UpdateCmd, session: &Session) -> Result<()> {
    match action {
        UpdateCmd::Subnet {
            cluster,
            subnet_id,
            rpc_version,
        } => {
            let fleet = session.fleet();
            let pb = ui::spinner(&format!("Updating nodes of {} to track {}...", cluster, subnet_id));
            let result = run_fleet_command(fleet.update_subnet(&cluster, &subnet_id, rpc_version));
            pb.finish_and_clear();
            let result = result?;
            ui::node_outcomes(&result, "restarted");
            result.into_result("update subnet on")?;
            ui::success(&format!("Cluster '{}' tracks subnet {}.", cluster, subnet_id));
            Ok(())
        }
    }
}

// ============================================================================
// Local clusters
// ============================================================================

fn cmd_local(action: LocalCmd, session: &mut Session, out_fmt: OutputFormat) -> Result<()> {
    let local = session.local();
    match action {
        LocalCmd::Start { name, nodes } => {
            let config = run_fleet_command(local.start(&name, nodes))?;
            ui::success(&format!("Local cluster '{}' running.", name));
            output::render_one(&ClusterInfo::new(&name, &config), out_fmt)
        }
        LocalCmd::Stop { name } => {
            let result = run_fleet_command(local.stop(&name))?;
            ui::node_outcomes(&result, "stopped");
            result.into_result("stop")?;
            Ok(())
        }
        LocalCmd::Destroy { name } => {
            session.authorize(
                true,
                &format!("Delete all local data of cluster {}?", name),
                "--authorize-remove",
            )?;
            run_fleet_command(local.destroy(&name))?;
            ui::success(&format!("Local cluster '{}' destroyed.", name));
            Ok(())
        }
        LocalCmd::Track { name, subnet_id } => {
            let result = run_fleet_command(local.track(&name, &subnet_id))?;
            ui::node_outcomes(&result, "restarted");
            result.into_result("track subnet on")?;
            ui::success(&format!("Local cluster '{}' tracks subnet {}.", name, subnet_id));
            Ok(())
        }
        LocalCmd::Status { name } => {
            let rows: Vec<LocalNodeRow> = run_fleet_command(local.status(&name))?
                .into_iter()
                .map(LocalNodeRow::from)
                .collect();
            output::render_list(&rows, out_fmt)
        }
        LocalCmd::Validate { name, stake } => {
            let hosts = local.hosts(&name)?;
            let network = session.registry().cluster(&name)?.network;
            let orchestrator = session.orchestrator(&network)?;
            validate_primary(&orchestrator, &hosts, &stake.request())
        }
    }
}

// ============================================================================
// Whitelisting
// ============================================================================

fn cmd_whitelist_ip(
    cluster: &str,
    ip: Option<&str>,
    current_ip: bool,
    session: &mut Session,
    out_fmt: OutputFormat,
) -> Result<()> {
    let ip = match (ip, current_ip) {
        (Some(ip), _) => ip.to_string(),
        (None, true) => {
            let ip = http::current_ip()?;
            ui::info(&format!("Your public IP is {}", ip));
            ip.to_string()
        }
        (None, false) => anyhow::bail!("Pass an IP address or --current-ip"),
    };
    session.authorize(
        false,
        &format!("Open SSH, API and Grafana ports of cluster {} to {}?", cluster, ip),
        "--authorize-access",
    )?;

    let fleet = session.fleet();
    let result = run_fleet_command(fleet.whitelist_ip(cluster, &ip))?;
    let rows: Vec<WhitelistRow> = result
        .values()
        .map(|(target, outcome)| WhitelistRow::new(target, outcome))
        .collect();
    output::render_list(&rows, out_fmt)?;
    for (target, reason) in result.failed() {
        ui::error(&format!("{}: {}", target, reason));
    }
    result.into_result("whitelist ip on")?;
    Ok(())
}

/// The key itself, or the first line of a key file.
fn read_public_key(key: &str) -> Result<String> {
    let path = Path::new(key);
    if path.is_file() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read public key {}", path.display()))?;
        return content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .with_context(|| format!("{} is empty", path.display()));
    }
    Ok(key.trim().to_string())
}

fn cmd_whitelist_ssh(cluster: &str, key: &str, session: &Session) -> Result<()> {
    let key = read_public_key(key)?;
    let fleet = session.fleet();
    let result = run_fleet_command(fleet.whitelist_ssh(cluster, &key))?;
    ui::node_outcomes(&result, "authorized");
    result.into_result("whitelist ssh key on")?;
    ui::success(&format!("Key authorized on every node of {}.", cluster));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_authorize_all_grants_both() {
        let cli = parse(&["avafleet", "--authorize-all", "cluster", "status", "c"]);
        let opts = command_options(&Settings::default(), &cli.flags);
        assert!(opts.authorize.access);
        assert!(opts.authorize.remove);
        assert!(!opts.force);
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = parse(&[
            "avafleet",
            "cluster",
            "destroy",
            "c",
            "--force",
            "--profile",
            "ops",
            "--ssh-key",
            "/keys/k.pem",
        ]);
        let opts = command_options(&Settings::default(), &cli.flags);
        assert!(opts.force);
        assert_eq!(opts.aws_profile, "ops");
        assert_eq!(opts.ssh_private_key.as_deref(), Some("/keys/k.pem"));
        assert!(!opts.authorize.remove);
    }

    #[test]
    fn test_region_is_only_a_create_option() {
        assert!(Cli::try_parse_from(["avafleet", "cluster", "destroy", "c", "--region", "us-west-2"]).is_err());
        assert!(Cli::try_parse_from(["avafleet", "cluster", "status", "c", "--regions", "us-west-2"]).is_err());
    }

    #[test]
    fn test_create_parses_region_lists() {
        let cli = parse(&[
            "avafleet",
            "cluster",
            "create",
            "c",
            "--regions",
            "us-east-1,eu-west-1",
            "--num-validators",
            "2,3",
            "--key-path",
            "/k.pem",
        ]);
        match cli.command {
            Commands::Cluster {
                action:
                    ClusterCmd::Create {
                        regions,
                        num_validators,
                        num_apis,
                        ..
                    },
            } => {
                assert_eq!(regions, vec!["us-east-1", "eu-west-1"]);
                assert_eq!(num_validators, vec![2, 3]);
                assert_eq!(num_apis, vec![0]);
            }
            _ => panic!("expected cluster create"),
        }
    }

    #[test]
    fn test_ssh_takes_trailing_command() {
        let cli = parse(&["avafleet", "cluster", "ssh", "c", "uptime", "-p"]);
        match cli.command {
            Commands::Cluster {
                action: ClusterCmd::Ssh { command, .. },
            } => assert_eq!(command, vec!["uptime", "-p"]),
            _ => panic!("expected cluster ssh"),
        }
    }

    #[test]
    fn test_whitelist_ip_flags_conflict() {
        assert!(Cli::try_parse_from(["avafleet", "whitelist-ip", "c", "1.2.3.4", "--current-ip"]).is_err());
    }

    #[test]
    fn test_per_region_counts() {
        assert_eq!(per_region(&[2], 3, "n").unwrap(), vec![2, 2, 2]);
        assert_eq!(per_region(&[1, 2], 2, "n").unwrap(), vec![1, 2]);
        assert!(per_region(&[1, 2], 3, "n").is_err());
    }

    #[test]
    fn test_parse_cloud() {
        assert_eq!(parse_cloud("AWS").unwrap(), CloudService::Aws);
        assert_eq!(parse_cloud("gcp").unwrap(), CloudService::Gcp);
        assert!(parse_cloud("azure").is_err());
    }

    #[test]
    fn test_stake_args_request() {
        let args = StakeArgs {
            weight: Some(20),
            duration_hours: Some(48),
        };
        let request = args.request();
        assert_eq!(request.weight, Some(20));
        assert_eq!(request.duration, Some(Duration::from_secs(48 * 3600)));
    }

    #[test]
    fn test_read_public_key_from_file_or_literal() {
        let dir = std::env::temp_dir().join(format!("avafleet-key-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("id.pub");
        std::fs::write(&path, "\nssh-ed25519 AAAA me@host\n").unwrap();
        assert_eq!(read_public_key(path.to_str().unwrap()).unwrap(), "ssh-ed25519 AAAA me@host");
        assert_eq!(read_public_key(" ssh-rsa BBBB ").unwrap(), "ssh-rsa BBBB");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
