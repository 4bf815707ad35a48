//! Program data items: keyed, typed configuration and telemetry values
//! persisted on a node.
//!
//! Each item id maps to exactly one value shape. The node stores and returns
//! items as opaque bytes; this module is the host-side view that gives those
//! bytes a type, so callers round-trip [`PdiValue`]s instead of buffers.

use serde::{Deserialize, Serialize};

/// Identifiers of every program data item the nodes expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum PdiId {
    BootCount = 0,
    TargetSystemVoltageOutput = 1,
    ConfigSystemVoltageOutputRatedLimit = 2,
    TargetSystemCurrentOutput = 3,
    ConfigSystemCurrentOutputRatedLimit = 4,
    TargetPhaseCurrentOutput = 5,
    ConfigPhaseCurrentOutputRatedLimit = 6,
    ConfigMinSystemVoltageInput = 7,
    ConfigMinSystemVoltageInputRatedLimit = 8,
    ConfigMaxSystemVoltageInput = 9,
    ConfigMaxSystemVoltageInputRatedLimit = 10,
    ConfigMonFilterInputVoltage = 11,
    ConfigMonFilterOutputVoltage = 12,
    ConfigMonFilterOutputCurrent = 13,
    ConfigMonFilter1v1Voltage = 14,
    ConfigMonFilter3v3Voltage = 15,
    ConfigMonFilter5v0Voltage = 16,
    ConfigMonFilter12v0Voltage = 17,
    ConfigMonFilterTemperature = 18,
    ConfigMonFilterFanSpeed = 19,
}

impl PdiId {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Which value shape this item decodes to.
    pub fn value_kind(self) -> PdiValueKind {
        use PdiId::*;
        match self {
            BootCount => PdiValueKind::BootCount,
            ConfigMonFilterInputVoltage
            | ConfigMonFilterOutputVoltage
            | ConfigMonFilterOutputCurrent
            | ConfigMonFilter1v1Voltage
            | ConfigMonFilter3v3Voltage
            | ConfigMonFilter5v0Voltage
            | ConfigMonFilter12v0Voltage
            | ConfigMonFilterTemperature
            | ConfigMonFilterFanSpeed => PdiValueKind::IirFilter,
            _ => PdiValueKind::Float,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdiValueKind {
    Float,
    IirFilter,
    BootCount,
}

/// A single scalar configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatConfiguration {
    pub value: f32,
}

/// Monitor channel IIR filter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IirFilterConfig {
    pub order: u8,
    pub sample_rate_ms: u32,
    pub cutoff_hz: f32,
    pub coefficients: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootCount {
    pub count: u32,
}

/// A decoded program data item value.
#[derive(Debug, Clone, PartialEq)]
pub enum PdiValue {
    Float(FloatConfiguration),
    IirFilter(IirFilterConfig),
    BootCount(BootCount),
}

impl PdiValue {
    pub fn kind(&self) -> PdiValueKind {
        match self {
            PdiValue::Float(_) => PdiValueKind::Float,
            PdiValue::IirFilter(_) => PdiValueKind::IirFilter,
            PdiValue::BootCount(_) => PdiValueKind::BootCount,
        }
    }

    /// Raw byte form, as stored on the node.
    pub fn encode(&self) -> Vec<u8> {
        let res = match self {
            PdiValue::Float(v) => postcard::to_stdvec(v),
            PdiValue::IirFilter(v) => postcard::to_stdvec(v),
            PdiValue::BootCount(v) => postcard::to_stdvec(v),
        };
        res.expect("pdi value serialization")
    }

    /// Decodes `data` as the value shape belonging to `id`. Returns `None`
    /// when the bytes do not parse as that shape.
    pub fn decode(id: PdiId, data: &[u8]) -> Option<PdiValue> {
        match id.value_kind() {
            PdiValueKind::Float => postcard::from_bytes(data).ok().map(PdiValue::Float),
            PdiValueKind::IirFilter => postcard::from_bytes(data).ok().map(PdiValue::IirFilter),
            PdiValueKind::BootCount => postcard::from_bytes(data).ok().map(PdiValue::BootCount),
        }
    }

    /// Convenience accessor for scalar items.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            PdiValue::Float(v) => Some(v.value),
            _ => None,
        }
    }

    pub fn as_boot_count(&self) -> Option<u32> {
        match self {
            PdiValue::BootCount(v) => Some(v.count),
            _ => None,
        }
    }
}
