//! Per-node facade over the [`NetworkClient`].
//!
//! A [`NodeClient`] binds one node id and gives test procedures verbs instead
//! of messages: reboot and wait for it, engage the output, settle a sensor
//! into a band. It holds no connection state of its own; every operation is
//! delegated to the shared gateway.
//!
//! Failure discipline follows the gateway: communication problems come back
//! as `false`/`None` after a log line. A target outside the node's rated
//! limits is a caller bug and panics before anything is sent.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::{sleep, Instant};

use crate::net_client::NetworkClient;
use crate::pdi::{FloatConfiguration, PdiId, PdiValue};
use crate::wire::{Command, EngageState, LogLevel, Sensor};
use crate::NodeId;

/// Rated output voltage ceiling, volts.
pub const RATED_OUTPUT_VOLTAGE: f32 = 55.0;
/// Rated output current ceiling, amps.
pub const RATED_OUTPUT_CURRENT: f32 = 150.0;

const DEFAULT_ENGAGE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ZERO_OFFSET_TIMEOUT: Duration = Duration::from_secs(3);
/// Floor for polling intervals, so a caller-supplied rate cannot spin the
/// link.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client for a single node, bound to a shared [`NetworkClient`].
#[derive(Clone)]
pub struct NodeClient {
    node_id: NodeId,
    net: Arc<NetworkClient>,
}

impl NodeClient {
    pub fn new(node_id: NodeId, net: Arc<NetworkClient>) -> Self {
        NodeClient { node_id, net }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_alive(&self) -> bool {
        self.net.is_alive(self.node_id)
    }

    // ---- lifecycle ----

    /// Reboots the node and waits for it to come back.
    ///
    /// The reboot command gets no response (the node is going down), so it is
    /// sent fire-and-forget and the restart is confirmed through the
    /// heartbeat boot count instead: success is a heartbeat from this node
    /// with a boot count above the one last seen. The watch is armed before
    /// the command is sent, so a fast reboot cannot slip between the two.
    ///
    /// A node with no live heartbeat is not rebooted at all.
    pub async fn reboot(&self, timeout: Duration) -> bool {
        let node_id = self.node_id;
        if !self.is_alive() {
            warn!("skipping reboot of node {node_id}: no live heartbeat");
            return false;
        }
        let Some(hb) = self.net.last_heartbeat(node_id) else {
            warn!("skipping reboot of node {node_id}: no heartbeat on record");
            return false;
        };
        let prev_boot = hb.boot_count;

        let Some(watch) = self.net.heartbeat_watch(move |hb| {
            hb.node_id == node_id && hb.boot_count > prev_boot
        }) else {
            return false;
        };
        if !self
            .net
            .send_command(node_id, Command::Reboot, Duration::ZERO)
            .await
        {
            return false;
        }
        match watch.wait(timeout).await {
            Some(hb) => {
                info!(
                    "node {node_id} rebooted, boot count {} -> {}",
                    prev_boot, hb.boot_count
                );
                true
            }
            None => {
                warn!("node {node_id} did not come back within {timeout:?} of reboot");
                false
            }
        }
    }

    // ---- power stage ----

    pub async fn engage_output(&self) -> bool {
        self.net
            .send_command(self.node_id, Command::EngageOutput, DEFAULT_ENGAGE_TIMEOUT)
            .await
    }

    pub async fn disengage_output(&self) -> bool {
        self.net
            .send_command(
                self.node_id,
                Command::DisengageOutput,
                DEFAULT_ENGAGE_TIMEOUT,
            )
            .await
    }

    /// Current power stage state, from a fresh status query.
    pub async fn engagement_state(&self) -> Option<EngageState> {
        self.net
            .get_status(self.node_id)
            .await
            .map(|status| status.output_state)
    }

    /// Polls until the power stage reports `target` or `timeout` elapses.
    /// `poll_rate` is clamped to at least 100 ms.
    pub async fn wait_for_engagement_state(
        &self,
        target: EngageState,
        timeout: Duration,
        poll_rate: Duration,
    ) -> bool {
        let poll_rate = poll_rate.max(MIN_POLL_INTERVAL);
        let deadline = Instant::now() + timeout;
        loop {
            if self.engagement_state().await == Some(target) {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    "node {} did not reach {target:?} within {timeout:?}",
                    self.node_id
                );
                return false;
            }
            sleep(poll_rate).await;
        }
    }

    // ---- sensors ----

    pub async fn output_voltage(&self) -> Option<f32> {
        self.net.read_sensor(self.node_id, Sensor::OutputVoltage).await
    }

    pub async fn output_current(&self) -> Option<f32> {
        self.net.read_sensor(self.node_id, Sensor::OutputCurrent).await
    }

    pub async fn input_voltage(&self) -> Option<f32> {
        self.net.read_sensor(self.node_id, Sensor::InputVoltage).await
    }

    pub async fn read_sensor(&self, sensor: Sensor) -> Option<f32> {
        self.net.read_sensor(self.node_id, sensor).await
    }

    /// Samples `sensor` until its value satisfies the acceptance condition or
    /// `timeout` elapses.
    ///
    /// A sample is accepted when `cmp(sample, target)` holds and, with
    /// `tolerance: Some(t)`, its relative error `|sample - target| / target`
    /// is at most `t`. `tolerance: None` leaves only the comparator, e.g.
    /// `|s, t| s >= t` to wait for a rising value. Failed reads are skipped
    /// and polling continues.
    ///
    /// On timeout the return value distinguishes two outcomes: the last
    /// sample taken (the node answered but never converged), or `None` when
    /// no sample was ever obtained (the node never answered at all).
    pub async fn await_sensor_value<F>(
        &self,
        sensor: Sensor,
        target: f32,
        tolerance: Option<f32>,
        cmp: F,
        timeout: Duration,
        sampling_delay: Duration,
    ) -> Option<f32>
    where
        F: Fn(f32, f32) -> bool,
    {
        let sampling_delay = sampling_delay.max(MIN_POLL_INTERVAL);
        let deadline = Instant::now() + timeout;
        let mut last = None;
        while Instant::now() < deadline {
            if let Some(sample) = self.read_sensor(sensor).await {
                last = Some(sample);
                let tolerance_met = match tolerance {
                    Some(tol) => ((sample - target) / target).abs() <= tol,
                    None => true,
                };
                if cmp(sample, target) && tolerance_met {
                    return Some(sample);
                }
            }
            sleep(sampling_delay).await;
        }
        if let Some(sample) = last {
            warn!(
                "sensor {sensor:?} on node {} settled at {sample} without meeting target {target}",
                self.node_id
            );
            return Some(sample);
        }
        warn!(
            "sensor {sensor:?} on node {} never answered within {timeout:?}",
            self.node_id
        );
        None
    }

    // ---- setpoints ----

    /// Sets the output voltage target, in volts.
    ///
    /// Panics if `volts` is negative; nothing is sent in that case. The
    /// device is the authority on its own rated ceiling and may reject a
    /// target above it.
    pub async fn set_output_voltage_target(&self, volts: f32) -> bool {
        assert!(
            volts >= 0.0,
            "output voltage target {volts} V must be non-negative"
        );
        self.pdi_write(
            PdiId::TargetSystemVoltageOutput,
            &PdiValue::Float(FloatConfiguration { value: volts }),
        )
        .await
    }

    /// Sets the output current target, in amps.
    ///
    /// Panics if `amps` is negative or above [`RATED_OUTPUT_CURRENT`];
    /// nothing is sent in that case.
    pub async fn set_output_current_target(&self, amps: f32) -> bool {
        assert!(
            (0.0..=RATED_OUTPUT_CURRENT).contains(&amps),
            "output current target {amps} A outside 0..={RATED_OUTPUT_CURRENT} A"
        );
        self.pdi_write(
            PdiId::TargetSystemCurrentOutput,
            &PdiValue::Float(FloatConfiguration { value: amps }),
        )
        .await
    }

    pub async fn output_voltage_target(&self) -> Option<f32> {
        self.pdi_read(PdiId::TargetSystemVoltageOutput)
            .await
            .and_then(|v| v.as_float())
    }

    pub async fn output_current_target(&self) -> Option<f32> {
        self.pdi_read(PdiId::TargetSystemCurrentOutput)
            .await
            .and_then(|v| v.as_float())
    }

    // ---- program data items ----

    /// Reads and decodes one program data item. `None` on communication
    /// failure or bytes that do not parse as the item's shape.
    pub async fn pdi_read(&self, id: PdiId) -> Option<PdiValue> {
        let data = self.net.pdi_read(self.node_id, id).await;
        if data.is_empty() {
            return None;
        }
        let value = PdiValue::decode(id, &data);
        if value.is_none() {
            error!(
                "pdi {id:?} from node {} returned {} undecodable bytes",
                self.node_id,
                data.len()
            );
        }
        value
    }

    /// Writes one typed program data item, then reads it back. Success
    /// requires the readback to decode to exactly the value written; a node
    /// that acknowledged the write but kept its old value is a failure.
    pub async fn pdi_write(&self, id: PdiId, value: &PdiValue) -> bool {
        assert_eq!(
            value.kind(),
            id.value_kind(),
            "pdi {id:?} takes a {:?} value, got {:?}",
            id.value_kind(),
            value.kind()
        );
        if !self.net.pdi_write(self.node_id, id, &value.encode()).await {
            return false;
        }
        let readback = self.pdi_read(id).await;
        if readback.as_ref() != Some(value) {
            error!(
                "pdi {id:?} readback mismatch on node {}: wrote {value:?}, read {readback:?}",
                self.node_id
            );
            return false;
        }
        true
    }

    pub async fn boot_count(&self) -> Option<u32> {
        self.pdi_read(PdiId::BootCount)
            .await
            .and_then(|v| v.as_boot_count())
    }

    /// Commits the node's cached program data items to persistent storage.
    pub async fn pdi_flush(&self) -> bool {
        self.net
            .send_command(self.node_id, Command::FlushPdiCache, DEFAULT_FLUSH_TIMEOUT)
            .await
    }

    /// Re-zeros the load current measurement offset. Output must be
    /// disengaged; the node rejects the command otherwise.
    pub async fn zero_load_current_offset(&self) -> bool {
        self.net
            .send_command(
                self.node_id,
                Command::ZeroOutputCurrent,
                DEFAULT_ZERO_OFFSET_TIMEOUT,
            )
            .await
    }

    // ---- node log ----

    pub async fn log_erase(&self) -> bool {
        self.net.log_erase(self.node_id).await
    }

    pub async fn log_write(&self, level: LogLevel, message: &str) -> bool {
        self.net.log_write(self.node_id, level, message).await
    }

    pub async fn log_read(&self, count: u32, newest_first: bool) -> Vec<String> {
        self.net.log_read(self.node_id, count, newest_first).await
    }
}
