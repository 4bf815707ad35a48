//! Network-wide client: the single gateway for all node interaction.
//!
//! It is possible to connect through any physical Ichnaea node (or the
//! simulator's TCP endpoint) and reach the rest of the network, so this type
//! presents a facade to the entire system: discovery, liveness, command
//! dispatch, sensor reads, and program-data-item access all flow through it.
//!
//! Failure discipline: node-addressed operations never return an error for
//! ordinary communication failures. A timeout, a mistyped reply, or a fault
//! status is logged with the node id and operation, then surfaced as
//! `false`/`None`/empty so the caller decides what that means. Only caller
//! bugs (and catalog-level invariant violations) panic.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use tokio::time::sleep;

use crate::link::{self, ConnectionParams, LinkHandle};
use crate::node::NodeClient;
use crate::pdi::PdiId;
use crate::pipe::{CommPipe, ObserverHandle, SubFilter, Subscription};
use crate::registry::{
    NodeRecord, NodeRegistry, DEFAULT_LIVENESS_WINDOW, DEFAULT_NODE_LIFETIME,
};
use crate::wire::{
    CmdStatus, Command, Envelope, GetIdRequest, Heartbeat, LogEraseRequest, LogLevel,
    LogReadRequest, LogWriteRequest, ManagerRequest, MsgKind, Payload, PdiReadRequest,
    PdiWriteRequest, PingRequest, Sensor, SensorRequest, SensorStatus, SetpointField,
    SetpointRequest, SetpointStatus, SetpointValue, SystemStatusRequest, SystemStatusResponse,
    MAX_PDI_DATA_LEN,
};
use crate::NodeId;

/// Per-operation wait budgets. These are configuration, not hidden constants,
/// so tests can shrink them.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub command: Duration,
    pub status: Duration,
    pub ping: Duration,
    pub pdi: Duration,
    pub sensor: Duration,
    pub logger: Duration,
    /// Interval of the discovery heartbeat-confirmation poll.
    pub discovery_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            command: Duration::from_secs(1),
            status: Duration::from_secs(1),
            ping: Duration::from_secs(1),
            pdi: Duration::from_secs(1),
            sensor: Duration::from_secs(3),
            logger: Duration::from_secs(3),
            discovery_poll: Duration::from_millis(100),
        }
    }
}

/// Resources held while the connection is up. Dropping this is the whole of
/// teardown: the observer slot releases itself, then the pipe stops its
/// dispatch task and closes the link.
struct OpenState {
    pipe: Arc<CommPipe>,
    _heartbeat_observer: ObserverHandle,
}

/// Gateway to the Ichnaea network. Connection state moves
/// `Closed -> (opening) -> Open -> Closed`; every operation other than
/// [`open`] fails soft while closed.
///
/// [`open`]: NetworkClient::open
pub struct NetworkClient {
    registry: Arc<NodeRegistry>,
    timeouts: Timeouts,
    state: Mutex<Option<OpenState>>,
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkClient {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_NODE_LIFETIME, Timeouts::default())
    }

    pub fn with_config(node_lifetime: Duration, timeouts: Timeouts) -> Self {
        NetworkClient {
            registry: Arc::new(NodeRegistry::new(node_lifetime)),
            timeouts,
            state: Mutex::new(None),
        }
    }

    /// A per-node view bound to this client.
    pub fn node(self: Arc<Self>, node_id: NodeId) -> NodeClient {
        NodeClient::new(node_id, self)
    }

    /// Establishes the connection described by `params`.
    ///
    /// The heartbeat observer is registered before this returns, and
    /// therefore before any discovery traffic can be sent: a node whose first
    /// heartbeat is triggered by discovery must not slip past an observer
    /// that does not exist yet.
    // TODO: request a session token from the remote system here, so two hosts
    // cannot unknowingly drive the same node. Needs firmware support first.
    pub async fn open(&self, params: ConnectionParams) -> io::Result<()> {
        let link = match params {
            ConnectionParams::Tcp { addr } => link::tcp::connect(addr.as_str()).await?,
            ConnectionParams::Serial { port, baud } => link::serial::connect(&port, baud)?,
        };
        self.open_with_link(link);
        Ok(())
    }

    /// Attaches an already-established link (tests and simulators bring
    /// their own).
    pub fn open_with_link(&self, link: LinkHandle) {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            warn!("network client is already open, ignoring open()");
            return;
        }
        let pipe = Arc::new(CommPipe::new(link));
        let registry = self.registry.clone();
        let observer = pipe.subscribe_observer(move |env| {
            if let Payload::Heartbeat(hb) = &env.payload {
                registry.observe_heartbeat(hb);
            }
        });
        *state = Some(OpenState {
            pipe,
            _heartbeat_observer: observer,
        });
        info!("network client open");
    }

    /// Tears the connection down. Safe to call any number of times.
    pub fn close(&self) {
        if self.state.lock().unwrap().take().is_some() {
            info!("network client closed");
        }
    }

    fn pipe(&self) -> Option<Arc<CommPipe>> {
        self.state.lock().unwrap().as_ref().map(|s| s.pipe.clone())
    }

    fn pipe_or_log(&self, op: &str) -> Option<Arc<CommPipe>> {
        let pipe = self.pipe();
        if pipe.is_none() {
            error!("{op}: network client is not open");
        }
        pipe
    }

    // ---- membership ----

    /// Broadcasts an identity request and returns the nodes that both
    /// answered it and subsequently proved liveness via heartbeat.
    ///
    /// `expected` bounds the response wait (`0` means "whatever answers
    /// within the timeout"). Zero responses is a normal outcome and yields an
    /// empty list. Nodes that answer but never heartbeat within the same
    /// overall `timeout` are silently dropped from the result: answering a
    /// broadcast once does not make a node usable.
    pub async fn discover_nodes(&self, expected: usize, timeout: Duration) -> Vec<NodeRecord> {
        let Some(pipe) = self.pipe_or_log("discover_nodes") else {
            return Vec::new();
        };
        self.registry.prune();
        let start = Instant::now();

        let responses = pipe
            .write_and_wait(
                Envelope::new(Payload::GetIdReq(GetIdRequest::default())),
                timeout,
                expected,
            )
            .await;
        if responses.is_empty() {
            info!("discovery: no nodes answered");
            return Vec::new();
        }

        let candidates: Vec<(NodeId, String)> = responses
            .iter()
            .map(|env| match &env.payload {
                Payload::GetIdRsp(rsp) => (rsp.unique_id, rsp.version_string()),
                other => {
                    // Correlation guarantees these frames answered our
                    // broadcast; any other payload is a catalog bug, not an
                    // operational condition.
                    panic!("identity broadcast answered with {:?}", other.kind())
                }
            })
            .collect();

        // Confirmation gate: wait for each candidate's heartbeat stream to be
        // flowing before reporting it usable. Shares the overall timeout.
        loop {
            let live = self.registry.available_nodes();
            if candidates.iter().all(|(id, _)| live.contains(id)) {
                break;
            }
            if start.elapsed() >= timeout {
                break;
            }
            sleep(self.timeouts.discovery_poll).await;
        }

        let mut confirmed = Vec::new();
        for (node_id, version) in candidates {
            self.registry.set_sw_version(node_id, &version);
            match self.registry.record(node_id) {
                Some(record) => confirmed.push(record),
                None => debug!("node {node_id} answered discovery but never sent a heartbeat"),
            }
        }
        confirmed
    }

    /// Nodes currently present in the (pruned) registry.
    pub fn available_nodes(&self) -> Vec<NodeId> {
        self.registry.available_nodes()
    }

    /// Liveness within the default window.
    pub fn is_alive(&self, node_id: NodeId) -> bool {
        self.registry.is_alive(node_id, DEFAULT_LIVENESS_WINDOW)
    }

    /// Liveness within a caller-supplied window.
    pub fn is_alive_within(&self, node_id: NodeId, window: Duration) -> bool {
        self.registry.is_alive(node_id, window)
    }

    pub fn last_heartbeat(&self, node_id: NodeId) -> Option<Heartbeat> {
        self.registry.last_heartbeat(node_id)
    }

    /// Arms a one-shot wait for a heartbeat matching `pred`. The subscription
    /// is live from the moment this returns, so callers can arm it before
    /// sending whatever triggers the heartbeat. Returns `None` while closed.
    pub fn heartbeat_watch<F>(&self, pred: F) -> Option<HeartbeatWatch>
    where
        F: Fn(&Heartbeat) -> bool + Send + 'static,
    {
        let pipe = self.pipe_or_log("heartbeat_watch")?;
        let sub = pipe.subscribe(
            SubFilter::Predicate(Box::new(move |env| {
                matches!(&env.payload, Payload::Heartbeat(hb) if pred(hb))
            })),
            1,
        );
        Some(HeartbeatWatch { sub })
    }

    // ---- node-addressed operations ----

    /// Wire-level reachability probe, deliberately independent of the
    /// heartbeat registry.
    pub async fn ping_node(&self, node_id: NodeId) -> bool {
        let Some(pipe) = self.pipe_or_log("ping_node") else {
            return false;
        };
        trace!("pinging node {node_id}");
        let sub = pipe.subscribe(SubFilter::Kind(MsgKind::PingRsp), 1);
        if !pipe
            .write(Envelope::new(Payload::PingReq(PingRequest { node_id })))
            .await
        {
            return false;
        }
        let answered = !sub.collect(self.timeouts.ping).await.is_empty();
        trace!("ping {}", if answered { "succeeded" } else { "failed" });
        answered
    }

    /// Sends a manager command to one node.
    ///
    /// A zero `timeout` is fire-and-forget: the command is written and the
    /// call reports success without any confirmation. Used where the caller
    /// confirms the effect independently, like a reboot watched through the
    /// boot count. Otherwise the call waits for exactly one correlated
    /// response and succeeds iff it is a manager response with no error.
    pub async fn send_command(&self, node_id: NodeId, command: Command, timeout: Duration) -> bool {
        let Some(pipe) = self.pipe_or_log("send_command") else {
            return false;
        };
        let env = Envelope::new(Payload::ManagerReq(ManagerRequest { node_id, command }));
        if timeout.is_zero() {
            return pipe.write(env).await;
        }

        let mut responses = pipe.write_and_wait(env, timeout, 1).await;
        let Some(rsp) = responses.pop() else {
            error!("missing response to command {command:?} on node {node_id}");
            return false;
        };
        match rsp.payload {
            Payload::ManagerRsp(m) if m.status == CmdStatus::NoError => true,
            Payload::ManagerRsp(m) => {
                error!(
                    "command {command:?} failed on node {node_id}: {:?} ({})",
                    m.status, m.message
                );
                false
            }
            other => {
                error!(
                    "unexpected reply to command {command:?} on node {node_id}: {:?}",
                    other.kind()
                );
                false
            }
        }
    }

    /// Queries one node's system status.
    pub async fn get_status(&self, node_id: NodeId) -> Option<SystemStatusResponse> {
        let Some(pipe) = self.pipe_or_log("get_status") else {
            return None;
        };
        let env = Envelope::new(Payload::SystemStatusReq(SystemStatusRequest { node_id }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.status, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::SystemStatusRsp(rsp)) => Some(rsp),
            Some(other) => {
                error!(
                    "unexpected reply to status request on node {node_id}: {:?}",
                    other.kind()
                );
                None
            }
            None => {
                error!("failed to get status from node {node_id}");
                None
            }
        }
    }

    /// Writes one setpoint field on a node.
    pub async fn write_setpoint(
        &self,
        node_id: NodeId,
        field: SetpointField,
        value: SetpointValue,
    ) -> bool {
        let Some(pipe) = self.pipe_or_log("write_setpoint") else {
            return false;
        };
        let env = Envelope::new(Payload::SetpointReq(SetpointRequest {
            node_id,
            field,
            value,
        }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.command, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::SetpointRsp(rsp)) if rsp.status == SetpointStatus::NoError => true,
            Some(Payload::SetpointRsp(rsp)) => {
                error!(
                    "setpoint {field:?} rejected by node {node_id}: {:?} ({})",
                    rsp.status, rsp.message
                );
                false
            }
            _ => {
                error!("failed to write setpoint {field:?} on node {node_id}");
                false
            }
        }
    }

    /// Reads one program data item as raw bytes. Empty on any failure.
    pub async fn pdi_read(&self, node_id: NodeId, pdi_id: PdiId) -> Vec<u8> {
        let Some(pipe) = self.pipe_or_log("pdi_read") else {
            return Vec::new();
        };
        let env = Envelope::new(Payload::PdiReadReq(PdiReadRequest {
            node_id,
            pdi_id: pdi_id.as_u16(),
        }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.pdi, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::PdiReadRsp(rsp)) if rsp.success => rsp.data,
            _ => {
                error!("failed to read pdi {pdi_id:?} on node {node_id}");
                Vec::new()
            }
        }
    }

    /// Writes one program data item. Payloads over [`MAX_PDI_DATA_LEN`] bytes
    /// are rejected locally; nothing is sent.
    pub async fn pdi_write(&self, node_id: NodeId, pdi_id: PdiId, data: &[u8]) -> bool {
        if data.len() > MAX_PDI_DATA_LEN {
            error!(
                "pdi {pdi_id:?} payload too large for node {node_id}: {} > {MAX_PDI_DATA_LEN} bytes",
                data.len()
            );
            return false;
        }
        let Some(pipe) = self.pipe_or_log("pdi_write") else {
            return false;
        };
        let env = Envelope::new(Payload::PdiWriteReq(PdiWriteRequest {
            node_id,
            pdi_id: pdi_id.as_u16(),
            data: data.to_vec(),
        }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.pdi, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::PdiWriteRsp(rsp)) if rsp.success => true,
            _ => {
                error!("failed to write pdi {pdi_id:?} on node {node_id}");
                false
            }
        }
    }

    /// Reads one sensor channel. `None` on timeout, mistyped reply, or a
    /// fault status.
    pub async fn read_sensor(&self, node_id: NodeId, sensor: Sensor) -> Option<f32> {
        let Some(pipe) = self.pipe_or_log("read_sensor") else {
            return None;
        };
        let env = Envelope::new(Payload::SensorReq(SensorRequest { node_id, sensor }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.sensor, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::SensorRsp(rsp)) if rsp.status == SensorStatus::NoError => Some(rsp.value),
            _ => {
                error!("failed to read sensor {sensor:?} on node {node_id}");
                None
            }
        }
    }

    // ---- node log access ----

    pub async fn log_erase(&self, node_id: NodeId) -> bool {
        let Some(pipe) = self.pipe_or_log("log_erase") else {
            return false;
        };
        let env = Envelope::new(Payload::LogEraseReq(LogEraseRequest { node_id }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.logger, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::LogEraseRsp(rsp)) if rsp.success => true,
            _ => {
                error!("failed to erase log on node {node_id}");
                false
            }
        }
    }

    pub async fn log_write(&self, node_id: NodeId, level: LogLevel, message: &str) -> bool {
        let Some(pipe) = self.pipe_or_log("log_write") else {
            return false;
        };
        let env = Envelope::new(Payload::LogWriteReq(LogWriteRequest {
            node_id,
            level,
            data: message.as_bytes().to_vec(),
        }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.logger, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::LogWriteRsp(rsp)) if rsp.success => true,
            _ => {
                error!("failed to write log entry on node {node_id}");
                false
            }
        }
    }

    /// Reads up to `count` log entries. Empty on failure or an empty log.
    pub async fn log_read(&self, node_id: NodeId, count: u32, newest_first: bool) -> Vec<String> {
        let Some(pipe) = self.pipe_or_log("log_read") else {
            return Vec::new();
        };
        let env = Envelope::new(Payload::LogReadReq(LogReadRequest {
            node_id,
            count,
            newest_first,
        }));
        let mut responses = pipe.write_and_wait(env, self.timeouts.logger, 1).await;
        match responses.pop().map(|env| env.payload) {
            Some(Payload::LogReadRsp(rsp)) if rsp.success => rsp
                .entries
                .iter()
                .map(|entry| String::from_utf8_lossy(entry).into_owned())
                .collect(),
            _ => {
                error!("failed to read log on node {node_id}");
                Vec::new()
            }
        }
    }
}

/// One-shot armed wait for a matching heartbeat. Consuming it (or dropping
/// it) releases the underlying subscription.
pub struct HeartbeatWatch {
    sub: Subscription,
}

impl HeartbeatWatch {
    /// Waits for the matching heartbeat, up to `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Option<Heartbeat> {
        match self.sub.recv(timeout).await.map(|env| env.payload) {
            Some(Payload::Heartbeat(hb)) => Some(hb),
            Some(other) => panic!("heartbeat watch admitted {:?}", other.kind()),
            None => None,
        }
    }
}
