//! Mesh topology description.
//!
//! A [`Topology`] is the declared shape of a scenario: which nodes exist,
//! where they listen, how often they broadcast and whom they dial at startup.
//! Everything the verifier expects (recipient lists, send and receive counts)
//! is derived from it, so a new topology needs no new verification code.
//!
//! # Expected counts
//!
//! A node broadcasts once per `period` after it starts, so over a window `W`
//! it emits `floor(W / period)` messages. In a connected mesh every other
//! node observes each of those messages exactly once, whether it is a direct
//! neighbour of the sender or several relay hops away.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Identifier of one node in a scenario.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Immutable description of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node identifier, unique within a topology.
    pub id: NodeId,
    /// IP the node binds its listener on.
    pub bind: IpAddr,
    /// Port the node listens on.
    pub port: u16,
    /// Seconds between outgoing broadcasts.
    pub period: u64,
    /// Peer dialled at startup. `None` for the first node of the mesh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<SocketAddr>,
}

impl NodeSpec {
    /// Create a node that only listens.
    pub fn new(id: impl Into<NodeId>, bind: IpAddr, port: u16, period: u64) -> Self {
        Self {
            id: id.into(),
            bind,
            port,
            period,
            connect: None,
        }
    }

    /// A chain on `bind` where every node dials the one declared before it.
    ///
    /// `nodes` lists `(port, period)` in launch order; nodes are named
    /// `node1`, `node2`, ...
    pub fn chain(bind: IpAddr, nodes: &[(u16, u64)]) -> Vec<Self> {
        let mut chain: Vec<Self> = Vec::with_capacity(nodes.len());
        for (index, &(port, period)) in nodes.iter().enumerate() {
            let mut node = Self::new(format!("node{}", index + 1), bind, port, period);
            if let Some(previous) = chain.last() {
                node = node.connecting_to(previous.address());
            }
            chain.push(node);
        }
        chain
    }

    /// Dial `target` at startup.
    #[must_use]
    pub fn connecting_to(mut self, target: SocketAddr) -> Self {
        self.connect = Some(target);
        self
    }

    /// Listen address of this node.
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Broadcast period.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    /// Command-line arguments that start this node.
    ///
    /// `--cert=<path> --key=<path> --period=<s> --port=<p> --bind=<ip> [--connect=<addr>]`
    pub fn args(&self, cert: &Path, key: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--cert={}", cert.display()),
            format!("--key={}", key.display()),
            format!("--period={}", self.period),
            format!("--port={}", self.port),
            format!("--bind={}", self.bind),
        ];
        if let Some(target) = self.connect {
            args.push(format!("--connect={target}"));
        }
        args
    }
}

/// Order in which a node renders the recipients of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipientOrder {
    /// Addresses sorted as strings (the node keeps its peers in an ordered map).
    #[default]
    Lexicographic,
    /// Addresses in the order nodes are declared in the topology.
    Declared,
}

/// Reasons a topology cannot be run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// No nodes declared.
    #[error("topology has no nodes")]
    Empty,
    /// Two nodes share an identifier.
    #[error("duplicate node id `{0}`")]
    DuplicateId(NodeId),
    /// Two nodes share a listen address.
    #[error("duplicate listen address {0}")]
    DuplicateAddress(SocketAddr),
    /// A node would never broadcast.
    #[error("node `{0}` has a zero broadcast period")]
    ZeroPeriod(NodeId),
    /// A node dials an address no node listens on.
    #[error("node `{node}` connects to {target}, which is not a node of this topology")]
    UnknownConnectTarget {
        /// Dialling node.
        node: NodeId,
        /// Address it dials.
        target: SocketAddr,
    },
    /// A node dials itself.
    #[error("node `{0}` connects to its own address")]
    SelfConnect(NodeId),
    /// A node dials a peer declared after it, which is not listening yet at launch.
    #[error("node `{node}` connects to {target}, which is declared later and launched after it")]
    ConnectBeforeTarget {
        /// Dialling node.
        node: NodeId,
        /// Address it dials.
        target: SocketAddr,
    },
    /// Some node cannot be reached from the first one.
    #[error("node `{0}` is not connected to the rest of the mesh")]
    Disconnected(NodeId),
}

/// A validated set of nodes and their connect relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    nodes: Vec<NodeSpec>,
    order: RecipientOrder,
}

impl Topology {
    /// Validate `nodes` (in launch order) into a topology.
    pub fn new(nodes: Vec<NodeSpec>, order: RecipientOrder) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut ids = HashSet::new();
        let mut positions = BTreeMap::new();
        for (index, node) in nodes.iter().enumerate() {
            if !ids.insert(&node.id) {
                return Err(TopologyError::DuplicateId(node.id.clone()));
            }
            if positions.insert(node.address(), index).is_some() {
                return Err(TopologyError::DuplicateAddress(node.address()));
            }
            if node.period == 0 {
                return Err(TopologyError::ZeroPeriod(node.id.clone()));
            }
        }

        for (index, node) in nodes.iter().enumerate() {
            let Some(target) = node.connect else {
                continue;
            };
            match positions.get(&target) {
                None => {
                    return Err(TopologyError::UnknownConnectTarget {
                        node: node.id.clone(),
                        target,
                    });
                }
                Some(&position) if position == index => {
                    return Err(TopologyError::SelfConnect(node.id.clone()));
                }
                Some(&position) if position > index => {
                    return Err(TopologyError::ConnectBeforeTarget {
                        node: node.id.clone(),
                        target,
                    });
                }
                Some(_) => {}
            }
        }

        let topology = Self { nodes, order };
        topology.check_connected()?;
        Ok(topology)
    }

    /// Nodes in launch order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Look up a node by identifier.
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// Addresses `sender` broadcasts to, rendered the way the node logs them.
    pub fn expected_recipients(&self, sender: &NodeSpec) -> Vec<String> {
        let mut recipients: Vec<String> = self
            .nodes
            .iter()
            .filter(|node| node.id != sender.id)
            .map(|node| node.address().to_string())
            .collect();
        if self.order == RecipientOrder::Lexicographic {
            recipients.sort();
        }
        recipients
    }

    /// Broadcasts `node` emits while alive for `window`.
    pub fn expected_sends(&self, node: &NodeSpec, window: Duration) -> usize {
        let period_ms = node.period().as_millis().max(1);
        (window.as_millis() / period_ms) as usize
    }

    /// Messages from `sender` that `receiver` observes over `window`.
    pub fn expected_receives(
        &self,
        receiver: &NodeSpec,
        sender: &NodeSpec,
        window: Duration,
    ) -> usize {
        if receiver.id == sender.id {
            0
        } else {
            self.expected_sends(sender, window)
        }
    }

    /// Breadth-first walk over the undirected connect graph from the first node.
    fn check_connected(&self) -> Result<(), TopologyError> {
        let mut adjacency: BTreeMap<SocketAddr, Vec<SocketAddr>> = BTreeMap::new();
        for node in &self.nodes {
            adjacency.entry(node.address()).or_default();
            if let Some(target) = node.connect {
                adjacency.entry(node.address()).or_default().push(target);
                adjacency.entry(target).or_default().push(node.address());
            }
        }

        let start = self.nodes[0].address();
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for next in adjacency.get(&current).into_iter().flatten() {
                if seen.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }

        match self.nodes.iter().find(|node| !seen.contains(&node.address())) {
            Some(node) => Err(TopologyError::Disconnected(node.id.clone())),
            None => Ok(()),
        }
    }
}
