//! Host-side control and test harness for Ichnaea power conversion nodes.
//!
//! Ichnaea units sit on a shared communication link (serial or TCP) and speak
//! a small request/response protocol, plus an unsolicited heartbeat stream
//! that proves liveness. This crate is the process-side gateway to that
//! network:
//!
//! 1. The [`CommPipe`] multiplexes correlated request/response exchanges and
//!    asynchronous heartbeat arrivals over one physical link
//! 2. The [`NodeRegistry`] maintains a time-decaying membership view of which
//!    nodes are currently alive
//! 3. The [`NetworkClient`] is the facade every caller goes through:
//!    discovery, liveness queries, command dispatch, sensor and configuration
//!    access
//! 4. The [`NodeClient`] binds one node id to the network client and adds
//!    node-scoped conveniences: reboot with boot-count confirmation, output
//!    engagement, setpoint writes with local range validation
//!
//! All node-addressed operations fail soft: a timeout, a missing response, or
//! a non-success status code is logged and surfaced as `false`/`None`/empty,
//! never as a panic. Panics are reserved for caller bugs, like a setpoint
//! outside the configured rated range.
//!
//! [`CommPipe`]: crate::pipe::CommPipe
//! [`NodeRegistry`]: crate::registry::NodeRegistry
//! [`NetworkClient`]: crate::net_client::NetworkClient
//! [`NodeClient`]: crate::node::NodeClient

use core::fmt;
use core::num::ParseIntError;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod link;
pub mod net_client;
pub mod node;
pub mod pdi;
pub mod pipe;
pub mod registry;
pub mod wire;

pub use net_client::NetworkClient;
pub use node::NodeClient;

/// Unique identifier of one Ichnaea node.
///
/// Nodes report a fixed-width unsigned id. For readability, all external
/// rendering (logs, CLIs, test output) uses the lowercase hex form, and
/// [`FromStr`] accepts that form back. The string form is presentation only;
/// identity is the integer value.
///
/// ```
/// use ichnaea_host::NodeId;
///
/// let id = NodeId(0xdeadbeef);
/// assert_eq!(id.to_string(), "0xdeadbeef");
/// assert_eq!("0xdeadbeef".parse::<NodeId>(), Ok(id));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl FromStr for NodeId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        u64::from_str_radix(digits, 16).map(NodeId)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}
