//! Node process orchestration.
//!
//! The orchestrator launches one process per node, captures its merged
//! stdout/stderr, stops it with SIGTERM once its observation window has
//! elapsed and hands back the captured text. It never interprets the output
//! beyond spotting a node's own bind line when sequencing launches.
//!
//! # Timing
//!
//! ```text
//!   node1  |--launch--------------- window ---------------|SIGTERM
//!   node2     |--launch--------------- window ---------------|SIGTERM
//!   node3        |--launch--------------- window ---------------|SIGTERM
//!           ^  ^
//!           launch gap: fixed stagger, or until the previous node binds
//! ```
//!
//! Each node's window is measured from its own launch.

use crate::error::{EnvironmentError, HarnessError, LifecycleError};
use crate::events::{Event, parse_line};
use crate::scenario::{LaunchPolicy, Scenario};
use crate::topology::{NodeId, NodeSpec};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Environment variable carrying the node log filter.
pub const NODE_LOG_ENV: &str = "RUST_LOG";

/// Exact invocation of one node process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommand {
    /// Executable.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment set on top of the inherited one.
    pub env: Vec<(String, String)>,
}

impl NodeCommand {
    /// Build the invocation for `node` in `scenario`.
    pub fn for_node(binary: &Path, node: &NodeSpec, scenario: &Scenario) -> Self {
        Self {
            program: binary.to_path_buf(),
            args: node.args(&scenario.tls.cert, &scenario.tls.key),
            env: vec![(NODE_LOG_ENV.to_string(), scenario.node_log_filter.clone())],
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Captured outcome of running one node for its window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// The node that ran.
    pub spec: NodeSpec,
    /// Merged stdout and stderr, one line per emitted line, in arrival order.
    pub output: String,
    /// Time between launch and exit.
    pub alive_for: Duration,
}

impl RunResult {
    /// Wrap already-captured output, e.g. a saved log file.
    pub fn from_output(spec: NodeSpec, output: impl Into<String>) -> Self {
        Self {
            spec,
            output: output.into(),
            alive_for: Duration::ZERO,
        }
    }
}

/// A launched node that has not been handed to its supervisor yet.
struct LaunchedNode {
    child: Child,
    capture: JoinHandle<std::io::Result<String>>,
    bound: watch::Receiver<bool>,
    launched_at: Instant,
}

/// Runs a scenario's nodes as OS processes.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    binary: PathBuf,
}

impl Orchestrator {
    /// Orchestrator for the node executable at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Check everything the run needs before any process starts.
    ///
    /// The binary must be an executable file, the certificate and key must
    /// be readable and every listen address must be free.
    pub fn preflight(&self, scenario: &Scenario) -> Result<(), EnvironmentError> {
        let metadata = std::fs::metadata(&self.binary)
            .map_err(|_| EnvironmentError::BinaryNotFound(self.binary.clone()))?;
        if !metadata.is_file() || !is_executable(&metadata) {
            return Err(EnvironmentError::BinaryNotExecutable(self.binary.clone()));
        }

        for (what, path) in [
            ("certificate", &scenario.tls.cert),
            ("key", &scenario.tls.key),
        ] {
            std::fs::File::open(path).map_err(|source| EnvironmentError::Unreadable {
                what,
                path: path.clone(),
                source,
            })?;
        }

        for node in scenario.topology.nodes() {
            let address = node.address();
            std::net::TcpListener::bind(address).map_err(|source| {
                EnvironmentError::PortInUse {
                    node: node.id.clone(),
                    address,
                    source,
                }
            })?;
        }
        Ok(())
    }

    /// Run every node of `scenario` for its window and collect the output.
    ///
    /// Fails only when the environment cannot run the nodes or a node does
    /// not shut down; anything wrong with what the nodes logged is for the
    /// verifier to find.
    pub async fn run_scenario(
        &self,
        scenario: &Scenario,
    ) -> Result<BTreeMap<NodeId, RunResult>, HarnessError> {
        self.preflight(scenario)?;

        info!(
            scenario = %scenario.name,
            nodes = scenario.topology.nodes().len(),
            window = ?scenario.window,
            "running scenario"
        );

        let mut supervisors: Vec<(NodeId, JoinHandle<Result<RunResult, HarnessError>>)> =
            Vec::with_capacity(scenario.topology.nodes().len());
        let mut previous: Option<(NodeId, watch::Receiver<bool>)> = None;

        for node in scenario.topology.nodes() {
            if let Some((previous_id, bound)) = previous.take() {
                await_launch_gap(scenario.launch, &previous_id, bound).await;
            }

            let launched = match self.launch(node, scenario) {
                Ok(launched) => launched,
                Err(err) => {
                    // dropping the supervisors kills the nodes already running
                    for (_, handle) in &supervisors {
                        handle.abort();
                    }
                    return Err(err.into());
                }
            };

            previous = Some((node.id.clone(), launched.bound.clone()));
            let handle = tokio::spawn(supervise(
                node.clone(),
                launched,
                scenario.window,
                scenario.termination_grace,
            ));
            supervisors.push((node.id.clone(), handle));
        }

        let (ids, handles): (Vec<NodeId>, Vec<_>) = supervisors.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut results = BTreeMap::new();
        let mut first_error = None;
        for (id, joined) in ids.into_iter().zip(joined) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join) => Err(LifecycleError::Supervisor {
                    node: id.clone(),
                    reason: join.to_string(),
                }
                .into()),
            };
            match outcome {
                Ok(result) => {
                    results.insert(id, result);
                }
                Err(err) => {
                    warn!(node = %id, error = %err, "node run failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    fn launch(&self, node: &NodeSpec, scenario: &Scenario) -> Result<LaunchedNode, EnvironmentError> {
        let command = NodeCommand::for_node(&self.binary, node, scenario);
        debug!(node = %node.id, args = ?command.args, "launching node");

        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| EnvironmentError::Spawn {
                node: node.id.clone(),
                source,
            })?;
        let launched_at = Instant::now();

        let stdout = child.stdout.take().ok_or_else(|| EnvironmentError::Capture {
            node: node.id.clone(),
            source: std::io::Error::other("stdout pipe not available"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EnvironmentError::Capture {
            node: node.id.clone(),
            source: std::io::Error::other("stderr pipe not available"),
        })?;

        let (bound_tx, bound) = watch::channel(false);
        let capture = tokio::spawn(capture_output(
            stdout,
            stderr,
            node.address().to_string(),
            bound_tx,
        ));

        info!(node = %node.id, address = %node.address(), pid = ?child.id(), "node launched");
        Ok(LaunchedNode {
            child,
            capture,
            bound,
            launched_at,
        })
    }
}

/// Wait between launching `previous` and the next node.
async fn await_launch_gap(policy: LaunchPolicy, previous: &NodeId, mut bound: watch::Receiver<bool>) {
    match policy {
        LaunchPolicy::Stagger { delay } => tokio::time::sleep(delay).await,
        LaunchPolicy::WaitForBind { timeout } => {
            match tokio::time::timeout(timeout, bound.wait_for(|bound| *bound)).await {
                Ok(Ok(_)) => debug!(node = %previous, "node bound"),
                Ok(Err(_)) => warn!(node = %previous, "node output closed before it bound"),
                Err(_) => warn!(node = %previous, ?timeout, "node did not bind in time"),
            }
        }
    }
}

/// Merge stdout and stderr line by line into one text.
///
/// Bytes that are not UTF-8 are replaced, never fatal. Flags `bound` once the
/// node logs a bind on `address`.
async fn capture_output(
    stdout: impl AsyncRead + Unpin,
    stderr: impl AsyncRead + Unpin,
    address: String,
    bound: watch::Sender<bool>,
) -> std::io::Result<String> {
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    // read_until appends to these, so a read cancelled by select! resumes intact
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut text = String::new();

    while stdout_open || stderr_open {
        let line = tokio::select! {
            read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                stdout_open = read? > 0;
                take_line(&mut stdout_buf)
            }
            read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                stderr_open = read? > 0;
                take_line(&mut stderr_buf)
            }
        };
        let Some(line) = line else {
            continue;
        };

        if !*bound.borrow() {
            if let Ok(Some(Event::Bind { address: bound_on })) = parse_line(&line, 0) {
                if bound_on == address {
                    bound.send_replace(true);
                }
            }
        }
        text.push_str(&line);
        text.push('\n');
    }
    Ok(text)
}

/// Drain one line from `buf`, without its `\n` or `\r\n` terminator.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    if buf.is_empty() {
        return None;
    }
    let mut bytes = buf.as_slice();
    if let Some(rest) = bytes.strip_suffix(b"\n") {
        bytes = rest.strip_suffix(b"\r").unwrap_or(rest);
    }
    let line = String::from_utf8_lossy(bytes).into_owned();
    buf.clear();
    Some(line)
}

/// Let a node run out its window, stop it and collect its output.
async fn supervise(
    node: NodeSpec,
    mut launched: LaunchedNode,
    window: Duration,
    grace: Duration,
) -> Result<RunResult, HarnessError> {
    tokio::time::sleep_until(launched.launched_at + window).await;

    terminate(&node.id, &mut launched.child, grace).await?;
    let alive_for = launched.launched_at.elapsed();

    let output = match tokio::time::timeout(grace, launched.capture).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(source))) => {
            return Err(EnvironmentError::Capture {
                node: node.id.clone(),
                source,
            }
            .into());
        }
        Ok(Err(join)) => {
            return Err(LifecycleError::Supervisor {
                node: node.id.clone(),
                reason: join.to_string(),
            }
            .into());
        }
        Err(_) => {
            return Err(LifecycleError::OutputNotClosed {
                node: node.id.clone(),
                grace,
            }
            .into());
        }
    };

    info!(
        node = %node.id,
        alive_ms = alive_for.as_millis() as u64,
        lines = output.lines().count(),
        "node output captured"
    );
    Ok(RunResult {
        spec: node,
        output,
        alive_for,
    })
}

/// Send SIGTERM and wait up to `grace` for the node to exit.
///
/// A node still running after the grace period is killed and reported.
#[cfg(unix)]
async fn terminate(node: &NodeId, child: &mut Child, grace: Duration) -> Result<(), HarnessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let exited = child.try_wait().map_err(|source| EnvironmentError::Capture {
        node: node.clone(),
        source,
    })?;
    if let Some(status) = exited {
        warn!(node = %node, %status, "node exited before its window ended");
        return Ok(());
    }
    let Some(pid) = child.id() else {
        return Ok(());
    };

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => {
            return Err(LifecycleError::Signal {
                node: node.clone(),
                reason: errno.to_string(),
            }
            .into());
        }
    }

    wait_for_exit(node, child, grace).await
}

#[cfg(not(unix))]
async fn terminate(node: &NodeId, child: &mut Child, grace: Duration) -> Result<(), HarnessError> {
    // no SIGTERM here; kill is the only request we can make
    child.start_kill().map_err(|source| EnvironmentError::Capture {
        node: node.clone(),
        source,
    })?;
    wait_for_exit(node, child, grace).await
}

async fn wait_for_exit(node: &NodeId, child: &mut Child, grace: Duration) -> Result<(), HarnessError> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(node = %node, %status, "node exited");
            Ok(())
        }
        Ok(Err(source)) => Err(EnvironmentError::Capture {
            node: node.clone(),
            source,
        }
        .into()),
        Err(_) => {
            warn!(node = %node, ?grace, "node ignored SIGTERM, killing");
            if let Err(err) = child.kill().await {
                warn!(node = %node, error = %err, "kill failed");
            }
            Err(LifecycleError::TerminationTimeout {
                node: node.clone(),
                grace,
            }
            .into())
        }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ScenarioSpec;

    fn reference() -> Scenario {
        ScenarioSpec::reference().build().expect("reference builds")
    }

    #[test]
    fn test_node_command_threads_log_filter() {
        let scenario = reference();
        let node = &scenario.topology.nodes()[2];
        let command = NodeCommand::for_node(Path::new("/opt/gossip/node"), node, &scenario);

        assert_eq!(command.program, PathBuf::from("/opt/gossip/node"));
        assert_eq!(
            command.args,
            vec![
                "--cert=tls/cert.pem",
                "--key=tls/key.pem",
                "--period=9",
                "--port=8082",
                "--bind=127.0.0.1",
                "--connect=127.0.0.1:8081",
            ]
        );
        assert_eq!(
            command.env,
            vec![(
                "RUST_LOG".to_string(),
                "simplep2pgossip=info,warp=info".to_string()
            )]
        );
    }

    #[test]
    fn test_every_node_gets_same_filter() {
        let mut spec = ScenarioSpec::reference();
        spec.node_log_filter = "debug".to_string();
        let scenario = spec.build().unwrap();
        for node in scenario.topology.nodes() {
            let command = NodeCommand::for_node(Path::new("node"), node, &scenario);
            assert_eq!(command.env, vec![("RUST_LOG".to_string(), "debug".to_string())]);
        }
    }

    #[test]
    fn test_preflight_missing_binary() {
        let orchestrator = Orchestrator::new("/nonexistent/gossip-node");
        let err = orchestrator.preflight(&reference()).unwrap_err();
        assert!(matches!(err, EnvironmentError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_capture_merges_streams_and_flags_bind() {
        let stdout: &[u8] = b"INFO listening on https://127.0.0.1:9000\nINFO tick\n";
        let stderr: &[u8] = b"WARN something odd\n";
        let (tx, rx) = watch::channel(false);

        let text = capture_output(stdout, stderr, "127.0.0.1:9000".to_string(), tx)
            .await
            .unwrap();

        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("listening on https://127.0.0.1:9000\n"));
        assert!(text.contains("WARN something odd\n"));
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_capture_survives_invalid_utf8() {
        let stdout: &[u8] = b"INFO garbled \xff\xfe peer name\r\nlistening on https://127.0.0.1:9000\nno newline at end";
        let (tx, rx) = watch::channel(false);

        let text = capture_output(stdout, &b""[..], "127.0.0.1:9000".to_string(), tx)
            .await
            .unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "INFO garbled \u{FFFD}\u{FFFD} peer name");
        assert_eq!(lines[1], "listening on https://127.0.0.1:9000");
        assert_eq!(lines[2], "no newline at end");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_capture_ignores_foreign_bind() {
        let stdout: &[u8] = b"listening on https://127.0.0.1:9001\n";
        let (tx, rx) = watch::channel(false);

        capture_output(stdout, &b""[..], "127.0.0.1:9000".to_string(), tx)
            .await
            .unwrap();

        assert!(!*rx.borrow());
    }
}
