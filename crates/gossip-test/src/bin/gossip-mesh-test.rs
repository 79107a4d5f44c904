use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gossip_mesh_test::scenario::{DEFAULT_BIND_TIMEOUT, DEFAULT_STAGGER};
use gossip_mesh_test::{
    HarnessError, LaunchPolicy, LogVerifier, NodeId, Orchestrator, RunResult, Scenario,
    ScenarioSpec, VerificationReport,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "gossip-mesh-test")]
#[command(about = "Run a gossip node mesh and verify dissemination from its logs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Harness log filter (logs go to stderr)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the mesh, capture every node's output and verify it
    Run {
        /// Gossip node executable
        #[arg(long)]
        binary: PathBuf,

        #[command(flatten)]
        scenario: ScenarioArgs,

        /// Write each node's captured output to <DIR>/<node-id>.log
        #[arg(long, value_name = "DIR")]
        save_logs: Option<PathBuf>,
    },

    /// Verify previously captured node logs without launching anything
    Verify {
        #[command(flatten)]
        scenario: ScenarioArgs,

        /// Captured output of one node, as <node-id>=<path>
        #[arg(long = "log", value_parser = parse_log_arg, required = true)]
        logs: Vec<(NodeId, PathBuf)>,
    },

    /// Print the effective scenario as YAML
    Scenario {
        #[command(flatten)]
        scenario: ScenarioArgs,
    },
}

#[derive(Args)]
struct ScenarioArgs {
    /// Scenario file (defaults to the three-node reference chain)
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Observation window per node, in seconds
    #[arg(long)]
    window: Option<u64>,

    /// TLS certificate passed to every node
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key passed to every node
    #[arg(long)]
    key: Option<PathBuf>,

    /// RUST_LOG value for every node process
    #[arg(long)]
    node_log_filter: Option<String>,

    /// How consecutive launches are sequenced
    #[arg(long)]
    launch: Option<LaunchMode>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LaunchMode {
    /// Fixed short delay between launches
    Stagger,
    /// Wait for the previous node's bind line
    WaitForBind,
}

impl ScenarioArgs {
    fn load(&self) -> Result<ScenarioSpec> {
        let mut spec = match &self.scenario {
            Some(path) => ScenarioSpec::load(path).map_err(HarnessError::from)?,
            None => ScenarioSpec::reference(),
        };

        if let Some(window) = self.window {
            spec.window = Duration::from_secs(window);
        }
        if let Some(cert) = &self.cert {
            spec.tls.cert = cert.clone();
        }
        if let Some(key) = &self.key {
            spec.tls.key = key.clone();
        }
        if let Some(filter) = &self.node_log_filter {
            spec.node_log_filter = filter.clone();
        }
        match self.launch {
            Some(LaunchMode::Stagger) => {
                spec.launch = LaunchPolicy::Stagger {
                    delay: DEFAULT_STAGGER,
                };
            }
            Some(LaunchMode::WaitForBind) => {
                spec.launch = LaunchPolicy::WaitForBind {
                    timeout: DEFAULT_BIND_TIMEOUT,
                };
            }
            None => {}
        }
        Ok(spec)
    }

    fn build(&self) -> Result<Scenario> {
        Ok(self.load()?.build().map_err(HarnessError::from)?)
    }
}

fn parse_log_arg(value: &str) -> Result<(NodeId, PathBuf), String> {
    let (id, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <node-id>=<path>, got `{value}`"))?;
    if id.is_empty() || path.is_empty() {
        return Err(format!("expected <node-id>=<path>, got `{value}`"));
    }
    Ok((NodeId::from(id), PathBuf::from(path)))
}

async fn save_logs(dir: &Path, results: &BTreeMap<NodeId, RunResult>) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    for (id, result) in results {
        let path = dir.join(format!("{id}.log"));
        tokio::fs::write(&path, &result.output)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(node = %id, path = %path.display(), "saved node output");
    }
    Ok(())
}

fn log_report(report: &VerificationReport) {
    info!(scenario = %report.scenario, nodes = report.nodes, "verification passed");
    for outcome in &report.passed {
        info!(check = %outcome.check, "{}", outcome.detail);
    }
}

async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            binary,
            scenario,
            save_logs: save_dir,
        } => {
            let scenario = scenario.build()?;
            let results = Orchestrator::new(binary)
                .run_scenario(&scenario)
                .await?;

            if let Some(dir) = save_dir {
                save_logs(&dir, &results).await?;
            }

            let report = LogVerifier::for_scenario(&scenario)
                .verify(&results)
                .map_err(HarnessError::from)?;
            log_report(&report);
        }

        Commands::Verify { scenario, logs } => {
            let scenario = scenario.build()?;
            let mut results = BTreeMap::new();
            for (id, path) in logs {
                let Some(spec) = scenario.topology.node(&id) else {
                    anyhow::bail!("node `{id}` is not part of scenario `{}`", scenario.name);
                };
                let output = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                results.insert(id, RunResult::from_output(spec.clone(), output));
            }

            let report = LogVerifier::for_scenario(&scenario)
                .verify(&results)
                .map_err(HarnessError::from)?;
            log_report(&report);
        }

        Commands::Scenario { scenario } => {
            let spec = scenario.load()?;
            spec.clone().build().map_err(HarnessError::from)?;
            print!("{}", spec.to_yaml().map_err(HarnessError::from)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            let code = err
                .downcast_ref::<HarnessError>()
                .map_or(2, HarnessError::exit_code);
            ExitCode::from(code)
        }
    }
}
