//! Cross-node log verification.
//!
//! The verifier is pure: it takes the captured output of every node, parses
//! each into an [`EventLog`] and checks the mesh-wide properties below in
//! order, stopping at the first violation.
//!
//! 1. **bind**: each node bound exactly once, on its own address.
//! 2. **connections**: a node with a connect target connected exactly once,
//!    to that target; a node without one never connected.
//! 3. **receive-counts**: for every ordered pair (A, B), A received from B as
//!    many messages as B is expected to broadcast in the window.
//! 4. **send-fan-out**: every node broadcast the expected number of times and
//!    every broadcast went to all other nodes, in canonical order.
//! 5. **message-order**: the identifiers B sent, in order, equal the
//!    identifiers every other node received from B, in order.
//!
//! Nothing is shared between nodes' outputs except through these checks, and
//! no timestamps are compared: only the order in which each node logged.

use crate::events::{EventLog, ParseError};
use crate::orchestrator::RunResult;
use crate::scenario::Scenario;
use crate::topology::{NodeId, NodeSpec, Topology};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// The properties checked, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    /// Single bind on the node's own address.
    Bind,
    /// Exactly the configured outbound connection.
    Connections,
    /// Receive count per (receiver, sender) pair.
    ReceiveCounts,
    /// Send count per node and recipient list per send.
    SendFanOut,
    /// Per-originator message sequence identical at every receiver.
    MessageOrder,
}

impl Check {
    /// All checks in run order.
    pub const ALL: [Self; 5] = [
        Self::Bind,
        Self::Connections,
        Self::ReceiveCounts,
        Self::SendFanOut,
        Self::MessageOrder,
    ];
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind => write!(f, "bind"),
            Self::Connections => write!(f, "connections"),
            Self::ReceiveCounts => write!(f, "receive-counts"),
            Self::SendFanOut => write!(f, "send-fan-out"),
            Self::MessageOrder => write!(f, "message-order"),
        }
    }
}

/// First property the captured logs violate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// No output was captured for a node of the topology.
    #[error("[parse] no captured output for node `{node}`")]
    MissingOutput {
        /// Node without output.
        node: NodeId,
    },
    /// A line claims to be an event but is garbled.
    #[error("[parse] node `{node}`: malformed output")]
    Malformed {
        /// Node whose output is garbled.
        node: NodeId,
        /// Offending line.
        #[source]
        source: ParseError,
    },
    /// Bind events differ from a single bind on the node's address.
    #[error("[bind] node `{node}`: expected one bind on {expected}, observed {observed:?}")]
    Bind {
        /// Node checked.
        node: NodeId,
        /// Its listen address.
        expected: String,
        /// Addresses of all bind events.
        observed: Vec<String>,
    },
    /// Connect events differ from the configured target.
    #[error("[connections] node `{node}`: expected connects {expected:?}, observed {observed:?}")]
    Connection {
        /// Node checked.
        node: NodeId,
        /// Configured target, if any.
        expected: Vec<String>,
        /// Peers of all connect events.
        observed: Vec<String>,
    },
    /// A node received the wrong number of messages from a sender.
    #[error(
        "[receive-counts] node `{node}`: expected {expected} messages from `{sender}` ({sender_address}), observed {observed}"
    )]
    ReceiveCount {
        /// Receiving node.
        node: NodeId,
        /// Sending node.
        sender: NodeId,
        /// Sender's address as it appears in receive lines.
        sender_address: String,
        /// Expected count.
        expected: usize,
        /// Observed count.
        observed: usize,
    },
    /// A node broadcast the wrong number of times.
    #[error("[send-fan-out] node `{node}`: expected {expected} broadcasts, observed {observed}")]
    SendCount {
        /// Sending node.
        node: NodeId,
        /// Expected count.
        expected: usize,
        /// Observed count.
        observed: usize,
    },
    /// A broadcast went to the wrong recipients.
    #[error(
        "[send-fan-out] node `{node}`: message `{message}` sent to {observed:?}, expected {expected:?}"
    )]
    FanOut {
        /// Sending node.
        node: NodeId,
        /// Message identifier.
        message: String,
        /// All other nodes, in canonical order.
        expected: Vec<String>,
        /// Recipients as logged.
        observed: Vec<String>,
    },
    /// A receiver saw a sender's messages differently from how they were sent.
    #[error(
        "[message-order] node `{node}`: messages from `{sender}` received as {received:?}, sent as {sent:?}"
    )]
    MessageOrder {
        /// Receiving node.
        node: NodeId,
        /// Sending node.
        sender: NodeId,
        /// Identifiers the sender logged, in order.
        sent: Vec<String>,
        /// Identifiers the receiver logged from the sender, in order.
        received: Vec<String>,
    },
}

impl VerificationError {
    /// The check that failed. `None` for output that could not be parsed.
    pub fn check(&self) -> Option<Check> {
        match self {
            Self::MissingOutput { .. } | Self::Malformed { .. } => None,
            Self::Bind { .. } => Some(Check::Bind),
            Self::Connection { .. } => Some(Check::Connections),
            Self::ReceiveCount { .. } => Some(Check::ReceiveCounts),
            Self::SendCount { .. } | Self::FanOut { .. } => Some(Check::SendFanOut),
            Self::MessageOrder { .. } => Some(Check::MessageOrder),
        }
    }

    /// The node the failure was observed on.
    pub fn node(&self) -> &NodeId {
        match self {
            Self::MissingOutput { node }
            | Self::Malformed { node, .. }
            | Self::Bind { node, .. }
            | Self::Connection { node, .. }
            | Self::ReceiveCount { node, .. }
            | Self::SendCount { node, .. }
            | Self::FanOut { node, .. }
            | Self::MessageOrder { node, .. } => node,
        }
    }
}

/// One passed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Check that passed.
    pub check: Check,
    /// What was established.
    pub detail: String,
}

/// All checks passed; what each established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Scenario verified.
    pub scenario: String,
    /// Nodes analysed.
    pub nodes: usize,
    /// Passed checks in run order.
    pub passed: Vec<CheckOutcome>,
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Gossip mesh verification `{}` ({} nodes):",
            self.scenario, self.nodes
        )?;
        for outcome in &self.passed {
            writeln!(f, "  {:<15} PASS - {}", outcome.check, outcome.detail)?;
        }
        Ok(())
    }
}

/// A node's spec with its parsed output.
struct NodeLog<'a> {
    spec: &'a NodeSpec,
    address: String,
    events: EventLog,
}

/// Checks captured output against a topology.
#[derive(Debug, Clone, Copy)]
pub struct LogVerifier<'a> {
    name: &'a str,
    topology: &'a Topology,
    window: Duration,
}

impl<'a> LogVerifier<'a> {
    /// Verifier for `topology` with each node observed for `window`.
    pub fn new(name: &'a str, topology: &'a Topology, window: Duration) -> Self {
        Self {
            name,
            topology,
            window,
        }
    }

    /// Verifier for a built scenario.
    pub fn for_scenario(scenario: &'a Scenario) -> Self {
        Self::new(&scenario.name, &scenario.topology, scenario.window)
    }

    /// Run every check, failing at the first violation.
    pub fn verify(
        &self,
        results: &BTreeMap<NodeId, RunResult>,
    ) -> Result<VerificationReport, VerificationError> {
        let logs = self.parse_all(results)?;

        let mut passed = Vec::with_capacity(Check::ALL.len());
        for check in Check::ALL {
            let detail = match check {
                Check::Bind => self.check_binds(&logs)?,
                Check::Connections => self.check_connections(&logs)?,
                Check::ReceiveCounts => self.check_receive_counts(&logs)?,
                Check::SendFanOut => self.check_send_fan_out(&logs)?,
                Check::MessageOrder => self.check_message_order(&logs)?,
            };
            debug!(scenario = %self.name, %check, %detail, "check passed");
            passed.push(CheckOutcome { check, detail });
        }

        Ok(VerificationReport {
            scenario: self.name.to_string(),
            nodes: logs.len(),
            passed,
        })
    }

    fn parse_all(
        &self,
        results: &BTreeMap<NodeId, RunResult>,
    ) -> Result<Vec<NodeLog<'a>>, VerificationError> {
        self.topology
            .nodes()
            .iter()
            .map(|spec| {
                let result = results
                    .get(&spec.id)
                    .ok_or_else(|| VerificationError::MissingOutput {
                        node: spec.id.clone(),
                    })?;
                let events = EventLog::parse(&result.output).map_err(|source| {
                    VerificationError::Malformed {
                        node: spec.id.clone(),
                        source,
                    }
                })?;
                Ok(NodeLog {
                    spec,
                    address: spec.address().to_string(),
                    events,
                })
            })
            .collect()
    }

    fn check_binds(&self, logs: &[NodeLog<'_>]) -> Result<String, VerificationError> {
        for log in logs {
            let observed = log.events.binds();
            if observed != [log.address.as_str()] {
                return Err(VerificationError::Bind {
                    node: log.spec.id.clone(),
                    expected: log.address.clone(),
                    observed: to_owned(&observed),
                });
            }
        }
        Ok(format!("{} nodes bound once on their own address", logs.len()))
    }

    fn check_connections(&self, logs: &[NodeLog<'_>]) -> Result<String, VerificationError> {
        let mut connected = 0;
        for log in logs {
            let expected: Vec<String> = log.spec.connect.iter().map(ToString::to_string).collect();
            let observed = log.events.connects();
            if observed != expected {
                return Err(VerificationError::Connection {
                    node: log.spec.id.clone(),
                    expected,
                    observed: to_owned(&observed),
                });
            }
            connected += expected.len();
        }
        Ok(format!("{connected} configured connections, no others"))
    }

    fn check_receive_counts(&self, logs: &[NodeLog<'_>]) -> Result<String, VerificationError> {
        let mut pairs = 0;
        for receiver in logs {
            for sender in logs.iter().filter(|log| log.spec.id != receiver.spec.id) {
                let expected =
                    self.topology
                        .expected_receives(receiver.spec, sender.spec, self.window);
                let observed = receiver.events.received_from(&sender.address).len();
                if observed != expected {
                    return Err(VerificationError::ReceiveCount {
                        node: receiver.spec.id.clone(),
                        sender: sender.spec.id.clone(),
                        sender_address: sender.address.clone(),
                        expected,
                        observed,
                    });
                }
                pairs += 1;
            }
        }
        Ok(format!("{pairs} ordered node pairs received the expected counts"))
    }

    fn check_send_fan_out(&self, logs: &[NodeLog<'_>]) -> Result<String, VerificationError> {
        let mut total = 0;
        for log in logs {
            let sends = log.events.sends();
            let expected_count = self.topology.expected_sends(log.spec, self.window);
            if sends.len() != expected_count {
                return Err(VerificationError::SendCount {
                    node: log.spec.id.clone(),
                    expected: expected_count,
                    observed: sends.len(),
                });
            }

            let expected = self.topology.expected_recipients(log.spec);
            for (message, recipients) in sends {
                if recipients != expected.as_slice() {
                    return Err(VerificationError::FanOut {
                        node: log.spec.id.clone(),
                        message: message.to_string(),
                        expected,
                        observed: recipients.to_vec(),
                    });
                }
            }
            total += expected_count;
        }
        Ok(format!("{total} broadcasts, each to every other node"))
    }

    fn check_message_order(&self, logs: &[NodeLog<'_>]) -> Result<String, VerificationError> {
        let mut sequences = 0;
        for sender in logs {
            let sent = sender.events.sent_messages();
            for receiver in logs.iter().filter(|log| log.spec.id != sender.spec.id) {
                let received = receiver.events.received_from(&sender.address);
                if received != sent {
                    return Err(VerificationError::MessageOrder {
                        node: receiver.spec.id.clone(),
                        sender: sender.spec.id.clone(),
                        sent: to_owned(&sent),
                        received: to_owned(&received),
                    });
                }
                sequences += 1;
            }
        }
        Ok(format!("{sequences} receive sequences match their sender"))
    }
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}
