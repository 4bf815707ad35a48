//! Message catalog for the Ichnaea control protocol.
//!
//! Every message on the wire is an [`Envelope`]: a fixed [`Header`] carrying
//! the message id, catalog version, owning service, and a sequence id, plus
//! one strongly typed payload. The whole envelope is serialized with
//! `postcard`; frame boundaries are the job of the [`link`] layer.
//!
//! Responses echo the `seq_id` of the request that caused them, which is what
//! lets the pipe correlate concurrent exchanges on a shared link. Decoding
//! produces the [`Payload`] sum type directly, so receivers type-check a
//! response with a pattern match rather than a runtime type test.
//!
//! [`link`]: crate::link

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Service ids, one per logical device-side handler.
pub mod svc {
    pub const IDENTITY: u8 = 0;
    pub const PING: u8 = 1;
    pub const MANAGER: u8 = 2;
    pub const SETPOINT: u8 = 3;
    pub const SENSOR: u8 = 4;
    pub const PDI: u8 = 5;
    pub const STATUS: u8 = 6;
    pub const LOGGER: u8 = 7;
    pub const ASYNC: u8 = 8;
}

/// Hard ceiling on one program data item payload, enforced host-side before
/// any bytes hit the wire.
pub const MAX_PDI_DATA_LEN: usize = 512;

/// Common header prefix carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: u8,
    pub version: u8,
    pub svc_id: u8,
    pub seq_id: u16,
}

/// Discriminant-only view of [`Payload`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    GetIdReq,
    GetIdRsp,
    PingReq,
    PingRsp,
    ManagerReq,
    ManagerRsp,
    SetpointReq,
    SetpointRsp,
    SensorReq,
    SensorRsp,
    PdiReadReq,
    PdiReadRsp,
    PdiWriteReq,
    PdiWriteRsp,
    LogEraseReq,
    LogEraseRsp,
    LogWriteReq,
    LogWriteRsp,
    LogReadReq,
    LogReadRsp,
    SystemStatusReq,
    SystemStatusRsp,
    Heartbeat,
}

/// Command codes accepted by the manager service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Reboot,
    EngageOutput,
    DisengageOutput,
    FlushPdiCache,
    ZeroOutputCurrent,
}

/// Status domain of the manager service. Anything but `NoError` is a fault
/// whose accompanying message should be logged verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdStatus {
    NoError,
    InvalidCommand,
    NotPermitted,
    Busy,
    HardwareFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetpointStatus {
    NoError,
    UnknownField,
    OutOfRange,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStatus {
    NoError,
    UnknownSensor,
    NotAvailable,
}

/// Power stage engagement states a node may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngageState {
    Disengaged,
    Precharging,
    Engaged,
    Fault,
}

/// Selectable sensor channels, matching the node's monitor inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    InputVoltage,
    OutputVoltage,
    OutputCurrent,
    BoardTemperature,
    FanSpeed,
    Rail1v1,
    Rail3v3,
    Rail5v0,
    Rail12v0,
}

/// Fields addressable through the setpoint service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetpointField {
    OutputVoltage,
    OutputCurrent,
    PhaseCurrent,
    FanSpeedRpm,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SetpointValue {
    U32(u32),
    F32(f32),
}

/// Severity levels understood by the node's persistent logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// ---- payload bodies ----

/// Broadcast identity request. Every node on the link answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetIdRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIdResponse {
    pub unique_id: NodeId,
    pub ver_major: u8,
    pub ver_minor: u8,
    pub ver_patch: u8,
}

impl GetIdResponse {
    /// Firmware version in the canonical `major.minor.patch` form.
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.ver_major, self.ver_minor, self.ver_patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerRequest {
    pub node_id: NodeId,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerResponse {
    pub status: CmdStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetpointRequest {
    pub node_id: NodeId,
    pub field: SetpointField,
    pub value: SetpointValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetpointResponse {
    pub status: SetpointStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRequest {
    pub node_id: NodeId,
    pub sensor: Sensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorResponse {
    pub status: SensorStatus,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdiReadRequest {
    pub node_id: NodeId,
    pub pdi_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdiReadResponse {
    pub success: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdiWriteRequest {
    pub node_id: NodeId,
    pub pdi_id: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdiWriteResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEraseRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEraseResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogWriteRequest {
    pub node_id: NodeId,
    pub level: LogLevel,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogWriteResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogReadRequest {
    pub node_id: NodeId,
    pub count: u32,
    /// True reads newest to oldest, false oldest to newest.
    pub newest_first: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogReadResponse {
    pub success: bool,
    pub entries: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatusRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatusResponse {
    pub node_id: NodeId,
    pub timestamp_ms: u64,
    pub output_state: EngageState,
}

/// Unsolicited liveness beacon, emitted periodically by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub boot_count: u32,
    pub timestamp_ms: u64,
}

/// All payloads the catalog knows how to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    GetIdReq(GetIdRequest),
    GetIdRsp(GetIdResponse),
    PingReq(PingRequest),
    PingRsp(PingResponse),
    ManagerReq(ManagerRequest),
    ManagerRsp(ManagerResponse),
    SetpointReq(SetpointRequest),
    SetpointRsp(SetpointResponse),
    SensorReq(SensorRequest),
    SensorRsp(SensorResponse),
    PdiReadReq(PdiReadRequest),
    PdiReadRsp(PdiReadResponse),
    PdiWriteReq(PdiWriteRequest),
    PdiWriteRsp(PdiWriteResponse),
    LogEraseReq(LogEraseRequest),
    LogEraseRsp(LogEraseResponse),
    LogWriteReq(LogWriteRequest),
    LogWriteRsp(LogWriteResponse),
    LogReadReq(LogReadRequest),
    LogReadRsp(LogReadResponse),
    SystemStatusReq(SystemStatusRequest),
    SystemStatusRsp(SystemStatusResponse),
    Heartbeat(Heartbeat),
}

impl Payload {
    pub fn kind(&self) -> MsgKind {
        match self {
            Payload::GetIdReq(_) => MsgKind::GetIdReq,
            Payload::GetIdRsp(_) => MsgKind::GetIdRsp,
            Payload::PingReq(_) => MsgKind::PingReq,
            Payload::PingRsp(_) => MsgKind::PingRsp,
            Payload::ManagerReq(_) => MsgKind::ManagerReq,
            Payload::ManagerRsp(_) => MsgKind::ManagerRsp,
            Payload::SetpointReq(_) => MsgKind::SetpointReq,
            Payload::SetpointRsp(_) => MsgKind::SetpointRsp,
            Payload::SensorReq(_) => MsgKind::SensorReq,
            Payload::SensorRsp(_) => MsgKind::SensorRsp,
            Payload::PdiReadReq(_) => MsgKind::PdiReadReq,
            Payload::PdiReadRsp(_) => MsgKind::PdiReadRsp,
            Payload::PdiWriteReq(_) => MsgKind::PdiWriteReq,
            Payload::PdiWriteRsp(_) => MsgKind::PdiWriteRsp,
            Payload::LogEraseReq(_) => MsgKind::LogEraseReq,
            Payload::LogEraseRsp(_) => MsgKind::LogEraseRsp,
            Payload::LogWriteReq(_) => MsgKind::LogWriteReq,
            Payload::LogWriteRsp(_) => MsgKind::LogWriteRsp,
            Payload::LogReadReq(_) => MsgKind::LogReadReq,
            Payload::LogReadRsp(_) => MsgKind::LogReadRsp,
            Payload::SystemStatusReq(_) => MsgKind::SystemStatusReq,
            Payload::SystemStatusRsp(_) => MsgKind::SystemStatusRsp,
            Payload::Heartbeat(_) => MsgKind::Heartbeat,
        }
    }

    /// Catalog descriptor for this payload: (msg_id, version, svc_id).
    fn descriptor(&self) -> (u8, u8, u8) {
        match self.kind() {
            MsgKind::GetIdReq => (0x10, 1, svc::IDENTITY),
            MsgKind::GetIdRsp => (0x11, 1, svc::IDENTITY),
            MsgKind::PingReq => (0x12, 1, svc::PING),
            MsgKind::PingRsp => (0x13, 1, svc::PING),
            MsgKind::ManagerReq => (0x14, 1, svc::MANAGER),
            MsgKind::ManagerRsp => (0x15, 1, svc::MANAGER),
            MsgKind::SetpointReq => (0x16, 1, svc::SETPOINT),
            MsgKind::SetpointRsp => (0x17, 1, svc::SETPOINT),
            MsgKind::SensorReq => (0x18, 1, svc::SENSOR),
            MsgKind::SensorRsp => (0x19, 1, svc::SENSOR),
            MsgKind::PdiReadReq => (0x1a, 1, svc::PDI),
            MsgKind::PdiReadRsp => (0x1b, 1, svc::PDI),
            MsgKind::PdiWriteReq => (0x1c, 1, svc::PDI),
            MsgKind::PdiWriteRsp => (0x1d, 1, svc::PDI),
            MsgKind::LogEraseReq => (0x1e, 1, svc::LOGGER),
            MsgKind::LogEraseRsp => (0x1f, 1, svc::LOGGER),
            MsgKind::LogWriteReq => (0x20, 1, svc::LOGGER),
            MsgKind::LogWriteRsp => (0x21, 1, svc::LOGGER),
            MsgKind::LogReadReq => (0x22, 1, svc::LOGGER),
            MsgKind::LogReadRsp => (0x23, 1, svc::LOGGER),
            MsgKind::SystemStatusReq => (0x24, 1, svc::STATUS),
            MsgKind::SystemStatusRsp => (0x25, 1, svc::STATUS),
            MsgKind::Heartbeat => (0x30, 1, svc::ASYNC),
        }
    }
}

/// One complete wire message: header plus typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub payload: Payload,
}

impl Envelope {
    /// Builds an envelope with the catalog header for `payload` and a zero
    /// sequence id. The pipe stamps a live sequence id on send.
    pub fn new(payload: Payload) -> Self {
        let (msg_id, version, svc_id) = payload.descriptor();
        Envelope {
            header: Header {
                msg_id,
                version,
                svc_id,
                seq_id: 0,
            },
            payload,
        }
    }

    /// Builds a response envelope echoing the sequence id of `req`.
    pub fn reply_to(req: &Envelope, payload: Payload) -> Self {
        let mut env = Envelope::new(payload);
        env.header.seq_id = req.header.seq_id;
        env
    }

    pub fn kind(&self) -> MsgKind {
        self.payload.kind()
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serialization of an in-memory envelope cannot fail.
        postcard::to_stdvec(self).expect("envelope serialization")
    }

    pub fn decode(frame: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_header_matches_catalog() {
        let env = Envelope::new(Payload::GetIdReq(GetIdRequest::default()));
        assert_eq!(env.header.msg_id, 0x10);
        assert_eq!(env.header.svc_id, svc::IDENTITY);
        assert_eq!(env.header.seq_id, 0);

        let hb = Envelope::new(Payload::Heartbeat(Heartbeat {
            node_id: crate::NodeId(7),
            boot_count: 3,
            timestamp_ms: 12,
        }));
        assert_eq!(hb.header.svc_id, svc::ASYNC);
        assert_eq!(hb.kind(), MsgKind::Heartbeat);
    }

    #[test]
    fn reply_echoes_sequence_id() {
        let mut req = Envelope::new(Payload::PingReq(PingRequest {
            node_id: crate::NodeId(1),
        }));
        req.header.seq_id = 777;
        let rsp = Envelope::reply_to(
            &req,
            Payload::PingRsp(PingResponse {
                node_id: crate::NodeId(1),
            }),
        );
        assert_eq!(rsp.header.seq_id, 777);
        assert_eq!(rsp.kind(), MsgKind::PingRsp);
    }

    #[test]
    fn garbage_frames_do_not_decode() {
        assert!(Envelope::decode(&[0xff; 40]).is_err());
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn encode_decode_preserves_payload() {
        let env = Envelope::new(Payload::ManagerRsp(ManagerResponse {
            status: CmdStatus::Busy,
            message: "output engaged".into(),
        }));
        let bytes = env.encode();
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }
}
