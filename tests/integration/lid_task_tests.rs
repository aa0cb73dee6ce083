//! Lid heater task scenarios against mock policies.

use thermocore::config::ThermalConfig;
use thermocore::error::{ErrorCode, HeatElement, ThermistorChannel};
use thermocore::mailbox::{Mailbox, Sender};
use thermocore::messages::{CommsMessage, LidMessage, LidReadings, RequestId, SystemMessage};
use thermocore::ports::CircuitFault;
use thermocore::tasks::lid::LidHeaterTask;
use thermocore::tasks::{SystemStatus, TaskRegistry};

use crate::mock_policies::{adc_for, MockHeater, MockStorage, ADC_RAIL_HIGH, ADC_RAIL_LOW};

struct Rig {
    task: LidHeaterTask<MockStorage>,
    hw: MockHeater,
    comms: Mailbox<CommsMessage>,
    system: Mailbox<SystemMessage>,
    tx: Sender<LidMessage>,
    next_ts: u32,
}

impl Rig {
    fn new() -> Self {
        let config = ThermalConfig::default();
        let mut task = LidHeaterTask::new(&config, MockStorage::default());
        let comms = Mailbox::new();
        let system = Mailbox::new();
        let registry = TaskRegistry {
            comms: comms.sender(),
            system: system.sender(),
            heater: Mailbox::new().sender(),
            lid: task.sender(),
            plate: Mailbox::new().sender(),
        };
        task.provide_registry(registry);
        let tx = task.sender();
        Self {
            task,
            hw: MockHeater::new(),
            comms,
            system,
            tx,
            next_ts: 0,
        }
    }

    fn send(&mut self, msg: LidMessage) {
        assert!(self.tx.try_send(msg));
        assert!(self.task.poll(&mut self.hw));
    }

    fn convert(&mut self, lid_c: f64) {
        self.convert_raw(adc_for(lid_c));
    }

    fn convert_raw(&mut self, lid: u16) {
        self.next_ts += 100;
        self.send(LidMessage::TempReadComplete(LidReadings {
            lid,
            timestamp_ms: self.next_ts,
        }));
    }

    fn acks(&self) -> Vec<(RequestId, ErrorCode)> {
        let mut acks = Vec::new();
        while let Some(msg) = self.comms.try_recv() {
            if let CommsMessage::Acknowledge {
                responding_to_id,
                with_error,
            } = msg
            {
                acks.push((responding_to_id, with_error));
            }
        }
        acks
    }
}

#[test]
fn control_loop_drives_toward_target() {
    let mut rig = Rig::new();
    rig.convert(23.0);
    rig.send(LidMessage::SetTemperature {
        id: 1,
        target_c: 105.0,
    });
    assert_eq!(rig.acks(), vec![(1, ErrorCode::NoError)]);
    assert_eq!(rig.task.status(), SystemStatus::Controlling);

    rig.convert(23.0);
    assert!(rig.hw.last_power().unwrap() > 0.5);

    // At target: the loop backs off.
    rig.convert(105.0);
    assert!(rig.hw.last_power().unwrap() < 0.5);
}

#[test]
fn rail_high_is_a_short_on_the_lid_circuit() {
    // The lid sense circuit pins a shorted probe to the opposite rail
    // from the pad circuit.
    let mut rig = Rig::new();
    rig.convert_raw(ADC_RAIL_HIGH);
    assert_eq!(rig.task.status(), SystemStatus::Error);
    assert_eq!(
        rig.task.most_relevant_error(),
        ErrorCode::ThermistorShort(ThermistorChannel::Lid)
    );
}

#[test]
fn rail_low_is_a_disconnect_on_the_lid_circuit() {
    let mut rig = Rig::new();
    rig.convert_raw(ADC_RAIL_LOW);
    assert_eq!(
        rig.task.most_relevant_error(),
        ErrorCode::ThermistorDisconnected(ThermistorChannel::Lid)
    );
}

#[test]
fn overtemp_trips_above_the_lid_limit() {
    let mut rig = Rig::new();
    rig.convert(111.0);
    assert_eq!(rig.task.status(), SystemStatus::Error);
    assert_eq!(
        rig.task.most_relevant_error(),
        ErrorCode::ThermistorOvertemp(ThermistorChannel::Lid)
    );
    assert!(rig.hw.last_power().unwrap() == 0.0);
}

#[test]
fn target_above_lid_max_is_refused() {
    let mut rig = Rig::new();
    rig.send(LidMessage::SetTemperature {
        id: 1,
        target_c: 106.0,
    });
    assert_eq!(rig.acks(), vec![(1, ErrorCode::TargetOutOfRange)]);
}

#[test]
fn deactivate_clears_circuit_fault_for_retry() {
    let mut rig = Rig::new();
    rig.send(LidMessage::SetTemperature {
        id: 1,
        target_c: 90.0,
    });
    rig.hw.fault_on_set = CircuitFault::Short;
    rig.convert(23.0);
    assert_eq!(rig.task.status(), SystemStatus::Error);
    assert_eq!(
        rig.task.most_relevant_error(),
        ErrorCode::CircuitShort(HeatElement::Lid)
    );

    rig.hw.fault_on_set = CircuitFault::None;
    rig.send(LidMessage::Deactivate { id: 2 });
    let acks = rig.acks();
    assert_eq!(acks.last(), Some(&(2, ErrorCode::NoError)));
    assert_eq!(rig.task.status(), SystemStatus::Idle);
    assert_eq!(rig.task.error_bitmap(), 0);
}

#[test]
fn deactivate_while_idle_is_a_clean_noop() {
    let mut rig = Rig::new();
    rig.convert(23.0);
    rig.send(LidMessage::Deactivate { id: 3 });
    assert_eq!(rig.acks(), vec![(3, ErrorCode::NoError)]);
    assert_eq!(rig.task.status(), SystemStatus::Idle);
    assert_eq!(rig.task.error_bitmap(), 0);
}

#[test]
fn gain_change_refused_while_controlling() {
    let mut rig = Rig::new();
    rig.convert(23.0);
    rig.send(LidMessage::SetTemperature {
        id: 1,
        target_c: 90.0,
    });
    rig.send(LidMessage::SetPidConstants {
        id: 2,
        kp: 0.8,
        ki: 0.05,
        kd: 0.2,
    });
    let acks = rig.acks();
    assert_eq!(acks.last(), Some(&(2, ErrorCode::Busy)));
    assert_eq!(rig.task.status(), SystemStatus::Controlling);
}

#[test]
fn get_temperature_reports_lid_and_target() {
    let mut rig = Rig::new();
    rig.convert(80.0);
    rig.send(LidMessage::GetTemperature { id: 5 });
    let mut found = false;
    while let Some(msg) = rig.comms.try_recv() {
        if let CommsMessage::LidTemperature {
            responding_to_id,
            lid_c,
            target_c,
        } = msg
        {
            assert_eq!(responding_to_id, 5);
            assert!((lid_c - 80.0).abs() < 0.2);
            assert!(target_c.abs() < 1e-9);
            found = true;
        }
    }
    assert!(found);
}

#[test]
fn power_test_holds_fixed_power_through_sensor_faults() {
    let mut rig = Rig::new();
    rig.send(LidMessage::SetPowerTest { id: 1, power: 0.25 });
    assert_eq!(rig.acks(), vec![(1, ErrorCode::NoError)]);
    rig.convert_raw(ADC_RAIL_HIGH);
    assert_eq!(rig.task.status(), SystemStatus::PowerTest);
    assert_eq!(rig.hw.last_power(), Some(0.25));
}

#[test]
fn bitmap_changes_notify_the_system_task() {
    let mut rig = Rig::new();
    rig.convert_raw(ADC_RAIL_HIGH);
    let mut saw = false;
    while let Some(msg) = rig.system.try_recv() {
        if let SystemMessage::TaskError { bitmap, .. } = msg {
            assert_ne!(bitmap, 0);
            saw = true;
        }
    }
    assert!(saw);
}
