//! Harness error taxonomy.
//!
//! Failures fall into four groups and each maps to its own exit status, so an
//! operator can tell "the environment is broken" from "the binary hung" from
//! "the protocol is wrong" without reading the message:
//!
//! | Group        | Type                  | Exit |
//! |--------------|-----------------------|------|
//! | Verification | [`VerificationError`] | 1    |
//! | Environment  | [`EnvironmentError`]  | 2    |
//! | Lifecycle    | [`LifecycleError`]    | 3    |
//! | Scenario     | [`ScenarioError`]     | 4    |

use crate::scenario::ScenarioError;
use crate::topology::NodeId;
use crate::verifier::VerificationError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// The harness cannot run the scenario at all. Nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    /// Node binary does not exist.
    #[error("node binary {} not found", .0.display())]
    BinaryNotFound(PathBuf),
    /// Node binary exists but cannot be executed.
    #[error("node binary {} is not an executable file", .0.display())]
    BinaryNotExecutable(PathBuf),
    /// Certificate or key cannot be read.
    #[error("cannot read {what} {}", path.display())]
    Unreadable {
        /// `certificate` or `key`.
        what: &'static str,
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A node's listen address is already taken.
    #[error("node `{node}` cannot listen on {address}")]
    PortInUse {
        /// Node that would listen there.
        node: NodeId,
        /// Listen address.
        address: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The node process could not be started.
    #[error("failed to launch node `{node}`")]
    Spawn {
        /// Node being launched.
        node: NodeId,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The node's output could not be captured.
    #[error("failed to capture output of node `{node}`")]
    Capture {
        /// Node being captured.
        node: NodeId,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// A node process did not shut down the way it should.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// SIGTERM could not be delivered.
    #[error("failed to signal node `{node}`: {reason}")]
    Signal {
        /// Node being signalled.
        node: NodeId,
        /// OS error text.
        reason: String,
    },
    /// The node ignored SIGTERM for the whole grace period and was killed.
    #[error("node `{node}` did not exit within {grace:?} of SIGTERM")]
    TerminationTimeout {
        /// Hung node.
        node: NodeId,
        /// Grace period that elapsed.
        grace: Duration,
    },
    /// The node exited but something kept its output open.
    #[error("output of node `{node}` stayed open {grace:?} after exit")]
    OutputNotClosed {
        /// Node whose pipes stayed open.
        node: NodeId,
        /// Grace period that elapsed.
        grace: Duration,
    },
    /// The task supervising a node failed.
    #[error("supervisor for node `{node}` failed: {reason}")]
    Supervisor {
        /// Supervised node.
        node: NodeId,
        /// Join error text.
        reason: String,
    },
}

/// Any failure of a harness run.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Scenario file or topology is invalid.
    #[error("invalid scenario")]
    Scenario(#[from] ScenarioError),
    /// Environment is not able to run the scenario.
    #[error("environment error")]
    Environment(#[from] EnvironmentError),
    /// A node process misbehaved at shutdown.
    #[error("process lifecycle error")]
    Lifecycle(#[from] LifecycleError),
    /// The captured logs violate an expected property.
    #[error("verification failed")]
    Verification(#[from] VerificationError),
}

impl HarnessError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Verification(_) => 1,
            Self::Environment(_) => 2,
            Self::Lifecycle(_) => 3,
            Self::Scenario(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::Check;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            HarnessError::from(VerificationError::MissingOutput {
                node: NodeId::from("node1"),
            }),
            HarnessError::from(EnvironmentError::BinaryNotFound(PathBuf::from("/missing"))),
            HarnessError::from(LifecycleError::TerminationTimeout {
                node: NodeId::from("node1"),
                grace: Duration::from_secs(5),
            }),
            HarnessError::from(ScenarioError::ZeroWindow),
        ];
        let codes: Vec<u8> = errors.iter().map(HarnessError::exit_code).collect();
        assert_eq!(codes, vec![1, 2, 3, 4]);
    }

    /// Render the way the CLI does: the message and its whole source chain.
    fn report(err: HarnessError) -> String {
        format!("{:#}", anyhow::Error::from(err))
    }

    #[test]
    fn test_verification_message_names_check() {
        let message = report(HarnessError::from(VerificationError::Bind {
            node: NodeId::from("node2"),
            expected: "127.0.0.1:8081".to_string(),
            observed: Vec::new(),
        }));
        assert!(message.starts_with("verification failed: [bind] node `node2`"));
        assert_eq!(message.matches(&Check::Bind.to_string()).count(), 1);
    }

    #[test]
    fn test_yaml_error_reported_once() {
        let yaml_err = crate::scenario::ScenarioSpec::from_yaml("window: [").unwrap_err();
        let detail = match &yaml_err {
            ScenarioError::Yaml(inner) => inner.to_string(),
            other => panic!("unexpected error: {other}"),
        };

        let message = report(HarnessError::from(yaml_err));
        assert!(message.starts_with("invalid scenario: invalid scenario YAML: "));
        assert_eq!(message.matches(detail.as_str()).count(), 1);
    }

    #[test]
    fn test_io_source_reported_once() {
        let message = report(HarnessError::from(EnvironmentError::Spawn {
            node: NodeId::from("node3"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "exec denied"),
        }));
        assert_eq!(
            message,
            "environment error: failed to launch node `node3`: exec denied"
        );
    }
}
