//! Gossip Mesh Test Harness
//!
//! This crate runs several independent gossip node processes as a small mesh,
//! lets them broadcast for a fixed observation window and then proves, from
//! each node's captured log alone, that the mesh formed and disseminated
//! messages exactly as the topology says it should.
//!
//! - **Topology**: nodes, listen addresses, broadcast periods, who dials whom
//! - **Orchestrator**: launch, capture, SIGTERM at the window boundary
//! - **Event grammar**: bind / connect / send / receive lines
//! - **Verifier**: cross-node checks, fail-fast with a precise diagnosis
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Scenario (YAML)                               │
//! │      window · nodes · tls · node log filter · launch policy           │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                                 │
//! │                                                                       │
//! │   ┌─────────┐  dials   ┌─────────┐  dials   ┌─────────┐              │
//! │   │  node1  │◄─────────│  node2  │◄─────────│  node3  │              │
//! │   │  :8080  │          │  :8081  │          │  :8082  │              │
//! │   └────┬────┘          └────┬────┘          └────┬────┘              │
//! │        │ stdout+stderr      │                    │                    │
//! └────────┼────────────────────┼────────────────────┼───────────────────┘
//!          ▼                    ▼                    ▼
//!   { node_id -> RunResult }  (one captured text per process)
//!          │
//!          ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │   LogVerifier: parse events ─► bind ─► connections ─► receive-counts  │
//! │                               ─► send-fan-out ─► message-order        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The verifier never touches processes or the network, so every check can
//! be exercised with hand-written log text.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gossip_mesh_test::{LogVerifier, Orchestrator, ScenarioSpec};
//!
//! let scenario = ScenarioSpec::reference().build()?;
//! let results = Orchestrator::new("target/release/simplep2pgossip")
//!     .run_scenario(&scenario)
//!     .await?;
//! let report = LogVerifier::for_scenario(&scenario).verify(&results)?;
//! println!("{report}");
//! ```

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod scenario;
pub mod topology;
pub mod verifier;

pub use error::{EnvironmentError, HarnessError, LifecycleError};
pub use events::{Event, EventKind, EventLog, ParseError, parse_events, parse_line};
pub use orchestrator::{NodeCommand, Orchestrator, RunResult};
pub use scenario::{LaunchPolicy, Scenario, ScenarioError, ScenarioSpec, TlsMaterial};
pub use topology::{NodeId, NodeSpec, RecipientOrder, Topology, TopologyError};
pub use verifier::{Check, CheckOutcome, LogVerifier, VerificationError, VerificationReport};

use std::collections::BTreeMap;

/// Run `scenario` with the node binary at `binary` and verify the captured logs.
pub async fn run_and_verify(
    binary: impl Into<std::path::PathBuf>,
    scenario: &Scenario,
) -> Result<(BTreeMap<NodeId, RunResult>, VerificationReport), HarnessError> {
    let results = Orchestrator::new(binary).run_scenario(scenario).await?;
    let report = LogVerifier::for_scenario(scenario).verify(&results)?;
    Ok((results, report))
}
