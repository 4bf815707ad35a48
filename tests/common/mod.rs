//! In-process network simulator for integration tests.
//!
//! [`SimBus`] stands in for the physical bus: it hands the client one
//! [`LinkHandle`] and fans every host frame out to each attached node, the
//! way a broadcast identity request reaches every device on the wire.
//! [`SimNode`] is a scriptable node: it heartbeats, answers addressed
//! requests, and can be configured to misbehave (stay mute, answer with the
//! wrong message type, drop writes on the floor) so tests can exercise the
//! client's failure paths.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::sleep;

use ichnaea_host::link::LinkHandle;
use ichnaea_host::pdi::{BootCount, PdiValue};
use ichnaea_host::wire::{
    CmdStatus, Command, EngageState, Envelope, GetIdResponse, Heartbeat, LogEraseResponse,
    LogReadResponse, LogWriteResponse, ManagerResponse, Payload, PdiReadResponse,
    PdiWriteResponse, PingResponse, Sensor, SensorResponse, SensorStatus, SetpointResponse,
    SetpointStatus, SystemStatusResponse,
};
use ichnaea_host::NodeId;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Static behavior of one simulated node.
#[derive(Clone)]
pub struct SimConfig {
    pub node_id: NodeId,
    pub fw: (u8, u8, u8),
    pub heartbeat_period: Duration,
    /// Emit heartbeats at all (can also be toggled at runtime).
    pub heartbeats: bool,
    /// Answer broadcast identity requests.
    pub respond_get_id: bool,
    /// Receive addressed requests but never answer them.
    pub mute: bool,
    /// Answer manager requests with a ping response instead.
    pub wrong_type_replies: bool,
    /// Actually increment the boot count on a reboot command.
    pub honor_reboot: bool,
    /// Actually store program data item writes.
    pub commit_pdi_writes: bool,
    /// Status returned for manager commands.
    pub manager_status: CmdStatus,
    /// Delay between a manager engage ack and the Engaged state.
    pub engage_latency: Duration,
    pub sensors: HashMap<Sensor, f32>,
}

impl SimConfig {
    pub fn node(id: u64) -> Self {
        SimConfig {
            node_id: NodeId(id),
            fw: (1, 2, 3),
            heartbeat_period: Duration::from_millis(50),
            heartbeats: true,
            respond_get_id: true,
            mute: false,
            wrong_type_replies: false,
            honor_reboot: true,
            commit_pdi_writes: true,
            manager_status: CmdStatus::NoError,
            engage_latency: Duration::ZERO,
            sensors: HashMap::new(),
        }
    }
}

/// One simulated node. Tests hold this to script faults and to assert on
/// what traffic actually reached the node.
pub struct SimNode {
    config: SimConfig,
    started: Instant,
    boot_count: AtomicU32,
    /// Addressed requests received (broadcasts not included).
    request_count: AtomicU32,
    heartbeats: AtomicBool,
    pdis: Mutex<HashMap<u16, Vec<u8>>>,
    sensors: Mutex<HashMap<Sensor, f32>>,
    output_state: Mutex<EngageState>,
    log: Mutex<Vec<Vec<u8>>>,
}

impl SimNode {
    fn new(config: SimConfig) -> Self {
        SimNode {
            heartbeats: AtomicBool::new(config.heartbeats),
            sensors: Mutex::new(config.sensors.clone()),
            config,
            started: Instant::now(),
            boot_count: AtomicU32::new(0),
            request_count: AtomicU32::new(0),
            pdis: Mutex::new(HashMap::new()),
            output_state: Mutex::new(EngageState::Disengaged),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Relaxed)
    }

    pub fn boot_count(&self) -> u32 {
        self.boot_count.load(Relaxed)
    }

    pub fn output_state(&self) -> EngageState {
        *self.output_state.lock().unwrap()
    }

    pub fn set_heartbeats(&self, on: bool) {
        self.heartbeats.store(on, Relaxed);
    }

    pub fn set_sensor(&self, sensor: Sensor, value: f32) {
        self.sensors.lock().unwrap().insert(sensor, value);
    }

    fn timestamp_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// The node id a payload addresses, `None` for broadcasts and traffic a
    /// node never originates a reply to.
    fn target(payload: &Payload) -> Option<NodeId> {
        match payload {
            Payload::PingReq(r) => Some(r.node_id),
            Payload::ManagerReq(r) => Some(r.node_id),
            Payload::SetpointReq(r) => Some(r.node_id),
            Payload::SensorReq(r) => Some(r.node_id),
            Payload::PdiReadReq(r) => Some(r.node_id),
            Payload::PdiWriteReq(r) => Some(r.node_id),
            Payload::LogEraseReq(r) => Some(r.node_id),
            Payload::LogWriteReq(r) => Some(r.node_id),
            Payload::LogReadReq(r) => Some(r.node_id),
            Payload::SystemStatusReq(r) => Some(r.node_id),
            _ => None,
        }
    }

    fn handle(self: &Arc<Self>, req: &Envelope) -> Option<Envelope> {
        let me = self.config.node_id;
        match Self::target(&req.payload) {
            Some(id) if id == me => {
                self.request_count.fetch_add(1, Relaxed);
                if self.config.mute {
                    return None;
                }
            }
            Some(_) => return None,
            None => {
                // Only the identity broadcast gets answered from here.
                if !matches!(req.payload, Payload::GetIdReq(_)) {
                    return None;
                }
            }
        }

        let payload = match &req.payload {
            Payload::GetIdReq(_) => {
                if !self.config.respond_get_id {
                    return None;
                }
                let (ver_major, ver_minor, ver_patch) = self.config.fw;
                Payload::GetIdRsp(GetIdResponse {
                    unique_id: me,
                    ver_major,
                    ver_minor,
                    ver_patch,
                })
            }
            Payload::PingReq(_) => Payload::PingRsp(PingResponse { node_id: me }),
            Payload::ManagerReq(m) => {
                if self.config.wrong_type_replies {
                    return Some(Envelope::reply_to(
                        req,
                        Payload::PingRsp(PingResponse { node_id: me }),
                    ));
                }
                if m.command == Command::Reboot {
                    // A rebooting node does not answer; the host sees the
                    // restart through the heartbeat boot count.
                    if self.config.honor_reboot {
                        self.boot_count.fetch_add(1, Relaxed);
                    }
                    return None;
                }
                if self.config.manager_status != CmdStatus::NoError {
                    Payload::ManagerRsp(ManagerResponse {
                        status: self.config.manager_status,
                        message: "simulated fault".into(),
                    })
                } else {
                    match m.command {
                        Command::EngageOutput => {
                            if self.config.engage_latency.is_zero() {
                                *self.output_state.lock().unwrap() = EngageState::Engaged;
                            } else {
                                *self.output_state.lock().unwrap() = EngageState::Precharging;
                                let node = self.clone();
                                let latency = self.config.engage_latency;
                                tokio::spawn(async move {
                                    sleep(latency).await;
                                    let mut state = node.output_state.lock().unwrap();
                                    if *state == EngageState::Precharging {
                                        *state = EngageState::Engaged;
                                    }
                                });
                            }
                        }
                        Command::DisengageOutput => {
                            *self.output_state.lock().unwrap() = EngageState::Disengaged;
                        }
                        Command::FlushPdiCache | Command::ZeroOutputCurrent => {}
                        Command::Reboot => unreachable!(),
                    }
                    Payload::ManagerRsp(ManagerResponse {
                        status: CmdStatus::NoError,
                        message: String::new(),
                    })
                }
            }
            Payload::SetpointReq(_) => Payload::SetpointRsp(SetpointResponse {
                status: SetpointStatus::NoError,
                message: String::new(),
            }),
            Payload::SensorReq(r) => match self.sensors.lock().unwrap().get(&r.sensor) {
                Some(value) => Payload::SensorRsp(SensorResponse {
                    status: SensorStatus::NoError,
                    value: *value,
                }),
                None => Payload::SensorRsp(SensorResponse {
                    status: SensorStatus::UnknownSensor,
                    value: 0.0,
                }),
            },
            Payload::PdiReadReq(r) => {
                if r.pdi_id == 0 {
                    let count = self.boot_count.load(Relaxed);
                    Payload::PdiReadRsp(PdiReadResponse {
                        success: true,
                        data: PdiValue::BootCount(BootCount { count }).encode(),
                    })
                } else {
                    match self.pdis.lock().unwrap().get(&r.pdi_id) {
                        Some(data) => Payload::PdiReadRsp(PdiReadResponse {
                            success: true,
                            data: data.clone(),
                        }),
                        None => Payload::PdiReadRsp(PdiReadResponse {
                            success: false,
                            data: Vec::new(),
                        }),
                    }
                }
            }
            Payload::PdiWriteReq(r) => {
                if self.config.commit_pdi_writes {
                    self.pdis.lock().unwrap().insert(r.pdi_id, r.data.clone());
                }
                Payload::PdiWriteRsp(PdiWriteResponse { success: true })
            }
            Payload::LogEraseReq(_) => {
                self.log.lock().unwrap().clear();
                Payload::LogEraseRsp(LogEraseResponse { success: true })
            }
            Payload::LogWriteReq(r) => {
                self.log.lock().unwrap().push(r.data.clone());
                Payload::LogWriteRsp(LogWriteResponse { success: true })
            }
            Payload::LogReadReq(r) => {
                let log = self.log.lock().unwrap();
                let entries: Vec<Vec<u8>> = if r.newest_first {
                    log.iter().rev().take(r.count as usize).cloned().collect()
                } else {
                    log.iter().take(r.count as usize).cloned().collect()
                };
                Payload::LogReadRsp(LogReadResponse {
                    success: true,
                    entries,
                })
            }
            Payload::SystemStatusReq(_) => Payload::SystemStatusRsp(SystemStatusResponse {
                node_id: me,
                timestamp_ms: self.timestamp_ms(),
                output_state: *self.output_state.lock().unwrap(),
            }),
            _ => return None,
        };
        Some(Envelope::reply_to(req, payload))
    }
}

/// The shared medium. Everything the host sends reaches every node;
/// everything any node sends reaches the host.
pub struct SimBus {
    to_host: mpsc::Sender<Vec<u8>>,
    inboxes: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl SimBus {
    /// Creates the bus and the link handle to hand to the client.
    pub fn new() -> (SimBus, LinkHandle) {
        let (host_tx, mut from_host) = mpsc::channel::<Vec<u8>>(64);
        let (to_host, host_rx) = mpsc::channel::<Vec<u8>>(64);
        let inboxes: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>> = Arc::default();

        let fanout = inboxes.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_host.recv().await {
                let targets: Vec<_> = fanout.lock().unwrap().clone();
                for tx in targets {
                    let _ = tx.send(frame.clone()).await;
                }
            }
        });

        (
            SimBus { to_host, inboxes },
            LinkHandle {
                tx: host_tx,
                rx: host_rx,
            },
        )
    }

    /// Attaches a node and starts its request and heartbeat tasks.
    pub fn attach(&self, config: SimConfig) -> Arc<SimNode> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        self.inboxes.lock().unwrap().push(tx);
        let node = Arc::new(SimNode::new(config));

        let worker = node.clone();
        let to_host = self.to_host.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Ok(req) = Envelope::decode(&frame) else {
                    continue;
                };
                if let Some(rsp) = worker.handle(&req) {
                    if to_host.send(rsp.encode()).await.is_err() {
                        return;
                    }
                }
            }
        });

        let beater = node.clone();
        let to_host = self.to_host.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(beater.config.heartbeat_period);
            loop {
                tick.tick().await;
                if !beater.heartbeats.load(Relaxed) {
                    continue;
                }
                let hb = Envelope::new(Payload::Heartbeat(Heartbeat {
                    node_id: beater.config.node_id,
                    boot_count: beater.boot_count.load(Relaxed),
                    timestamp_ms: beater.timestamp_ms(),
                }));
                if to_host.send(hb.encode()).await.is_err() {
                    return;
                }
            }
        });

        node
    }
}
