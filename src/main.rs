//! Host simulator.
//!
//! Runs all three control tasks against first-order thermal models and
//! a scripted command sequence, stepping deterministically instead of
//! sleeping: every step injects conversion readings, runs each task
//! once, and drains the comms/system mailboxes into the log. Useful for
//! eyeballing control behaviour and for profiling gain changes without
//! hardware.
//!
//! ```text
//! RUST_LOG=info cargo run --bin thermosim
//! ```

use std::collections::HashMap;

use anyhow::{bail, Result};
use log::info;

use thermocore::config::ThermalConfig;
use thermocore::error::StorageError;
use thermocore::mailbox::Mailbox;
use thermocore::messages::{
    CommsMessage, HeaterMessage, HeaterReadings, LidMessage, LidReadings, PeltierDirection,
    PlateMessage, PlateReadings, SystemMessage,
};
use thermocore::ports::{CircuitFault, HeaterPolicy, PeltierId, PlatePolicy, StoragePort};
use thermocore::sensors::thermistor::NTC_10K_B3984;
use thermocore::tasks::heater::HeaterTask;
use thermocore::tasks::lid::LidHeaterTask;
use thermocore::tasks::plate::ThermalPlateTask;
use thermocore::tasks::TaskRegistry;

const STEP_MS: u32 = 50;
const SIM_SECONDS: u32 = 180;
const AMBIENT_C: f64 = 23.0;

// ── Simulated hardware ────────────────────────────────────────

/// First-order element model: one thermal mass driven by a power input,
/// relaxing toward ambient.
struct ThermalMass {
    temp_c: f64,
    /// °C/s at full drive.
    gain: f64,
    /// Relaxation time constant, seconds.
    tau: f64,
}

impl ThermalMass {
    fn new(gain: f64, tau: f64) -> Self {
        Self {
            temp_c: AMBIENT_C,
            gain,
            tau,
        }
    }

    fn step(&mut self, drive: f64, dt: f64) {
        self.temp_c += (drive * self.gain - (self.temp_c - AMBIENT_C) / self.tau) * dt;
    }

    fn adc(&self) -> u16 {
        NTC_10K_B3984.backconvert(self.temp_c).unwrap_or(0)
    }
}

struct SimHeater {
    power: f64,
    latch_ok: bool,
    pads: ThermalMass,
}

impl SimHeater {
    fn new(gain: f64) -> Self {
        Self {
            power: 0.0,
            latch_ok: true,
            pads: ThermalMass::new(gain, 120.0),
        }
    }

    fn step(&mut self, dt: f64) {
        let drive = if self.latch_ok { self.power } else { 0.0 };
        self.pads.step(drive, dt);
    }
}

impl HeaterPolicy for SimHeater {
    fn power_good(&self) -> bool {
        self.latch_ok
    }

    fn try_reset_power_good(&mut self) -> bool {
        self.latch_ok = true;
        true
    }

    fn set_power_output(&mut self, power: f64) -> CircuitFault {
        self.power = power;
        CircuitFault::None
    }

    fn disable_power_output(&mut self) {
        self.power = 0.0;
    }
}

struct SimPlate {
    enabled: bool,
    zones: [(PeltierDirection, f64); 3],
    fan: f64,
    masses: [ThermalMass; 3],
    heatsink: ThermalMass,
}

impl SimPlate {
    fn new() -> Self {
        Self {
            enabled: false,
            zones: [(PeltierDirection::Heating, 0.0); 3],
            fan: 0.0,
            masses: [
                ThermalMass::new(1.6, 90.0),
                ThermalMass::new(1.6, 90.0),
                ThermalMass::new(1.6, 90.0),
            ],
            heatsink: ThermalMass::new(0.5, 60.0),
        }
    }

    fn step(&mut self, dt: f64) {
        let mut waste = 0.0;
        for (mass, (direction, power)) in self.masses.iter_mut().zip(self.zones) {
            let drive = if self.enabled {
                match direction {
                    PeltierDirection::Heating => power,
                    PeltierDirection::Cooling => -power,
                }
            } else {
                0.0
            };
            mass.step(drive, dt);
            waste += power.abs();
        }
        // Waste heat lands on the heatsink; the fan carries it away.
        self.heatsink.step((waste / 3.0) - self.fan * 0.8, dt);
    }
}

impl PlatePolicy for SimPlate {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn set_peltier(&mut self, id: PeltierId, power: f64, direction: PeltierDirection) -> bool {
        self.zones[zone_index(id)] = (direction, power);
        true
    }

    fn get_peltier(&self, id: PeltierId) -> (PeltierDirection, f64) {
        self.zones[zone_index(id)]
    }

    fn set_fan(&mut self, power: f64) -> bool {
        self.fan = power;
        true
    }

    fn get_fan(&self) -> f64 {
        self.fan
    }
}

fn zone_index(id: PeltierId) -> usize {
    match id {
        PeltierId::Left => 0,
        PeltierId::Center => 1,
        PeltierId::Right => 2,
    }
}

/// In-memory storage standing in for the EEPROM.
#[derive(Default, Clone)]
struct SimStorage {
    map: HashMap<(String, String), Vec<u8>>,
}

impl StoragePort for SimStorage {
    fn read(&self, ns: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let blob = self
            .map
            .get(&(ns.to_owned(), key.to_owned()))
            .ok_or(StorageError::NotFound)?;
        if blob.len() > buf.len() {
            return Err(StorageError::BufferTooSmall);
        }
        buf[..blob.len()].copy_from_slice(blob);
        Ok(blob.len())
    }

    fn write(&mut self, ns: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map
            .insert((ns.to_owned(), key.to_owned()), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, ns: &str, key: &str) -> Result<(), StorageError> {
        self.map.remove(&(ns.to_owned(), key.to_owned()));
        Ok(())
    }

    fn exists(&self, ns: &str, key: &str) -> bool {
        self.map.contains_key(&(ns.to_owned(), key.to_owned()))
    }
}

// ── Scenario ──────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ThermalConfig::default();
    if let Err(reason) = config.validate() {
        bail!("invalid configuration: {reason}");
    }

    let mut heater = HeaterTask::new(&config, SimStorage::default());
    let mut lid = LidHeaterTask::new(&config, SimStorage::default());
    let mut plate = ThermalPlateTask::new(&config, SimStorage::default());

    let comms: Mailbox<CommsMessage> = Mailbox::new();
    let system: Mailbox<SystemMessage> = Mailbox::new();
    let registry = TaskRegistry {
        comms: comms.sender(),
        system: system.sender(),
        heater: heater.sender(),
        lid: lid.sender(),
        plate: plate.sender(),
    };
    heater.provide_registry(registry.clone());
    lid.provide_registry(registry.clone());
    plate.provide_registry(registry.clone());

    let mut heater_hw = SimHeater::new(0.9);
    let mut lid_hw = SimHeater::new(1.2);
    let mut plate_hw = SimPlate::new();

    let dt = f64::from(STEP_MS) / 1000.0;
    let steps = SIM_SECONDS * 1000 / STEP_MS;
    info!("simulating {SIM_SECONDS}s at {STEP_MS}ms steps");

    for step in 0..steps {
        let now_ms = step * STEP_MS;

        // Scripted host commands.
        match now_ms {
            500 => {
                let _ = registry.lid.try_send(LidMessage::SetTemperature {
                    id: 1,
                    target_c: 105.0,
                });
            }
            1000 => {
                let _ = registry.plate.try_send(PlateMessage::SetTemperature {
                    id: 2,
                    target_c: 95.0,
                    hold_time_s: 30.0,
                    volume_ul: Some(25.0),
                    ramp_rate: None,
                });
            }
            1500 => {
                let _ = registry.heater.try_send(HeaterMessage::SetTemperature {
                    id: 3,
                    target_c: 37.0,
                });
            }
            90_000 => {
                let _ = registry.plate.try_send(PlateMessage::SetTemperature {
                    id: 4,
                    target_c: 4.0,
                    hold_time_s: 0.0,
                    volume_ul: Some(25.0),
                    ramp_rate: None,
                });
            }
            170_000 => {
                let _ = registry.plate.try_send(PlateMessage::Deactivate { id: 5 });
                let _ = registry.lid.try_send(LidMessage::Deactivate { id: 6 });
                let _ = registry.heater.try_send(HeaterMessage::Deactivate { id: 7 });
            }
            _ => {}
        }

        // Conversion callbacks: plate every step, elements every other.
        let _ = registry.plate.send_from_isr(PlateMessage::TempReadComplete(PlateReadings {
            front_right: plate_hw.masses[2].adc(),
            front_left: plate_hw.masses[0].adc(),
            front_center: plate_hw.masses[1].adc(),
            back_right: plate_hw.masses[2].adc(),
            back_left: plate_hw.masses[0].adc(),
            back_center: plate_hw.masses[1].adc(),
            heatsink: plate_hw.heatsink.adc(),
            timestamp_ms: now_ms,
        }));
        if step % 2 == 0 {
            let _ = registry.heater.send_from_isr(HeaterMessage::TempReadComplete(
                HeaterReadings {
                    pad_a: heater_hw.pads.adc(),
                    pad_b: heater_hw.pads.adc(),
                    board: NTC_10K_B3984.backconvert(30.0).unwrap_or(0),
                    timestamp_ms: now_ms,
                },
            ));
            let _ = registry.lid.send_from_isr(LidMessage::TempReadComplete(LidReadings {
                lid: lid_hw.pads.adc(),
                timestamp_ms: now_ms,
            }));
        }

        // One scheduling round: drain whatever is pending.
        while plate.poll(&mut plate_hw) {}
        while heater.poll(&mut heater_hw) {}
        while lid.poll(&mut lid_hw) {}

        heater_hw.step(dt);
        lid_hw.step(dt);
        plate_hw.step(dt);

        while let Some(reply) = comms.try_recv() {
            info!("[comms] {reply:?}");
        }
        while let Some(update) = system.try_recv() {
            info!("[system] {update:?}");
        }

        if now_ms % 10_000 == 0 {
            info!(
                "t={:>5.1}s plate={:6.2}C lid={:6.2}C heater={:6.2}C heatsink={:6.2}C",
                f64::from(now_ms) / 1000.0,
                plate.plate_temp(),
                lid.lid_temp(),
                heater.pad_temp(),
                plate_hw.heatsink.temp_c,
            );
        }
    }

    info!("simulation complete");
    Ok(())
}
