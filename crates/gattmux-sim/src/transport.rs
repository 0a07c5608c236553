//! Simulated BLE stack
//!
//! Every call is accepted at once and answered later from a spawned task,
//! the way a real stack answers on its own callback thread. Outcomes are
//! drawn from a seeded RNG so a run can be repeated.

use bytes::Bytes;
use gattmux_core::{
    AttributeId, DeviceId, NativeEvent, OperationKind, Result, Target, Transport,
};
use gattmux_runtime::NativeEventSink;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, trace};

/// Status reported for a plain connect failure
const GATT_ERROR: i32 = 133;

/// Status reported for a failed attribute call
const GATT_FAILURE: i32 = 257;

/// Status reported when a link drops on its own
const CONNECTION_TERMINATED: i32 = 19;

/// How the simulated stack behaves
#[derive(Debug, Clone, PartialEq)]
pub struct SimProfile {
    /// Chance a call fails
    pub fail_rate: f64,
    /// Chance a call times out
    pub timeout_rate: f64,
    /// Chance a fresh link drops later on
    pub drop_rate: f64,
    /// Fastest reply
    pub min_latency: Duration,
    /// Slowest reply
    pub max_latency: Duration,
}

impl SimProfile {
    /// Clamp probabilities into `[0, 1]` and order the latency bounds
    pub fn normalized(mut self) -> Self {
        self.fail_rate = self.fail_rate.clamp(0.0, 1.0);
        self.timeout_rate = self.timeout_rate.clamp(0.0, 1.0);
        self.drop_rate = self.drop_rate.clamp(0.0, 1.0);
        if self.max_latency < self.min_latency {
            std::mem::swap(&mut self.min_latency, &mut self.max_latency);
        }
        self
    }
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            fail_rate: 0.2,
            timeout_rate: 0.05,
            drop_rate: 0.1,
            min_latency: Duration::from_millis(30),
            max_latency: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Transport answering from a seeded RNG
pub struct SimulatedTransport {
    profile: SimProfile,
    sink: NativeEventSink,
    rng: StdRng,
}

impl SimulatedTransport {
    /// Create a transport replying through `sink`
    pub fn new(profile: SimProfile, sink: NativeEventSink, seed: u64) -> Self {
        Self {
            profile: profile.normalized(),
            sink,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn outcome(&mut self) -> Outcome {
        if self.rng.gen_bool(self.profile.timeout_rate) {
            Outcome::Timeout
        } else if self.rng.gen_bool(self.profile.fail_rate) {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }

    fn latency(&mut self) -> Duration {
        let min = self.profile.min_latency;
        let max = self.profile.max_latency;
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    fn deliver_later(&self, delay: Duration, event: NativeEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !sink.send(event) {
                trace!("Service gone, reply dropped");
            }
        });
    }

    fn reply(
        &mut self,
        target: Target,
        kind: OperationKind,
        attribute: Option<AttributeId>,
        payload: Bytes,
    ) -> Outcome {
        let outcome = self.outcome();
        let status = match (outcome, kind) {
            (Outcome::Success, _) => 0,
            // a stuck attribute call never answers and runs into the operation timeout
            (Outcome::Timeout, kind) if kind.is_attribute_op() => {
                debug!(%target, %kind, "Simulating a stuck call");
                return outcome;
            }
            (Outcome::Timeout, _) => gattmux_core::native::GATT_CONN_TIMEOUT,
            (Outcome::Failure, OperationKind::Connect) => GATT_ERROR,
            (Outcome::Failure, _) => GATT_FAILURE,
        };
        let delay = self.latency();
        debug!(%target, %kind, status, ?delay, "Simulated reply");
        self.deliver_later(
            delay,
            NativeEvent::Completed {
                target,
                kind,
                attribute,
                status,
                payload: if status == 0 { payload } else { Bytes::new() },
            },
        );
        outcome
    }

    fn always_succeed(&mut self, target: Target, kind: OperationKind) {
        let delay = self.latency();
        self.deliver_later(delay, NativeEvent::success(target, kind));
    }
}

impl Transport for SimulatedTransport {
    fn connect(&mut self, device: &DeviceId) -> Result<()> {
        let outcome = self.reply(device.into(), OperationKind::Connect, None, Bytes::new());
        if outcome == Outcome::Success && self.rng.gen_bool(self.profile.drop_rate) {
            let after = Duration::from_millis(self.rng.gen_range(500..5_000));
            debug!(device = %device, ?after, "Link will drop");
            self.deliver_later(
                after,
                NativeEvent::ConnectionLost {
                    device: device.clone(),
                    status: CONNECTION_TERMINATED,
                },
            );
        }
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceId) -> Result<()> {
        self.always_succeed(device.into(), OperationKind::Disconnect);
        Ok(())
    }

    fn discover_services(&mut self, device: &DeviceId) -> Result<()> {
        self.reply(device.into(), OperationKind::DiscoverServices, None, Bytes::new());
        Ok(())
    }

    fn bond(&mut self, device: &DeviceId) -> Result<()> {
        self.reply(device.into(), OperationKind::Bond, None, Bytes::new());
        Ok(())
    }

    fn unbond(&mut self, device: &DeviceId) -> Result<()> {
        self.always_succeed(device.into(), OperationKind::Unbond);
        Ok(())
    }

    fn read(&mut self, device: &DeviceId, attribute: &AttributeId) -> Result<()> {
        let value = Bytes::from(vec![self.rng.gen::<u8>()]);
        self.reply(
            device.into(),
            OperationKind::Read,
            Some(*attribute),
            value,
        );
        Ok(())
    }

    fn write(&mut self, device: &DeviceId, attribute: &AttributeId, _data: &[u8]) -> Result<()> {
        self.reply(
            device.into(),
            OperationKind::Write,
            Some(*attribute),
            Bytes::new(),
        );
        Ok(())
    }

    fn read_descriptor(&mut self, device: &DeviceId, attribute: &AttributeId) -> Result<()> {
        self.reply(
            device.into(),
            OperationKind::ReadDescriptor,
            Some(*attribute),
            Bytes::from_static(&[0x00, 0x00]),
        );
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        device: &DeviceId,
        attribute: &AttributeId,
        _data: &[u8],
    ) -> Result<()> {
        self.reply(
            device.into(),
            OperationKind::WriteDescriptor,
            Some(*attribute),
            Bytes::new(),
        );
        Ok(())
    }

    fn toggle_notify(
        &mut self,
        device: &DeviceId,
        attribute: &AttributeId,
        _enable: bool,
    ) -> Result<()> {
        self.reply(
            device.into(),
            OperationKind::ToggleNotify,
            Some(*attribute),
            Bytes::new(),
        );
        Ok(())
    }

    fn read_rssi(&mut self, device: &DeviceId) -> Result<()> {
        let rssi = -self.rng.gen_range(40i8..90);
        self.reply(
            device.into(),
            OperationKind::ReadRssi,
            None,
            Bytes::from(vec![rssi as u8]),
        );
        Ok(())
    }

    fn turn_adapter_off(&mut self) -> Result<()> {
        self.always_succeed(Target::Adapter, OperationKind::TurnAdapterOff);
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
