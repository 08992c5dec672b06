use core::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::protocol::Telemetry;
use crate::simulator::SimulatorHandle;
use crate::subsystems::{AirLine, DeviceState};

pub const SAMPLES_PER_TICK: usize = 4;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Pressure reported on an air line: its set-pressure while the line is
/// open to the master supply, zero otherwise.
pub fn line_pressure(device: &DeviceState, line: AirLine) -> f64 {
    if !device.valves.line_open(line) {
        return 0.0;
    }
    match line {
        AirLine::M1 => device.m1_set_pressure,
        AirLine::M2 => device.m2_set_pressure,
    }
}

/// One round of telemetry, in emission order.
pub fn sample(device: &DeviceState) -> [Telemetry; SAMPLES_PER_TICK] {
    [
        Telemetry::M1AirPressure {
            pressure: line_pressure(device, AirLine::M1),
        },
        Telemetry::M2AirPressure {
            pressure: line_pressure(device, AirLine::M2),
        },
        Telemetry::MainAirSourcePressure {
            pressure: device.main_pressure,
        },
        Telemetry::LoadCell {
            cell_load: device.cell_load,
        },
    ]
}

/// Sample every `period` until aborted. The first round goes out at once.
pub fn spawn_telemetry_loop(handle: SimulatorHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Telemetry loop started ({:?})", period);
        let mut ticker = time::interval(period.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = handle.lock().await.update_telemetry() {
                error!("Telemetry update failed: {}", e);
            }
        }
    })
}
