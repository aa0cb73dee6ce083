//! Heater task scenarios against mock policies.

use thermocore::calibration::{ElementOffsets, HEATER_KEY};
use thermocore::config::ThermalConfig;
use thermocore::error::{ErrorCode, HeatElement, ThermistorChannel};
use thermocore::mailbox::{Mailbox, Sender};
use thermocore::messages::{CommsMessage, HeaterMessage, HeaterReadings, RequestId, SystemMessage};
use thermocore::ports::CircuitFault;
use thermocore::tasks::heater::HeaterTask;
use thermocore::tasks::{SystemStatus, TaskRegistry};

use crate::mock_policies::{adc_for, HeaterCall, MockHeater, MockStorage, ADC_RAIL_HIGH};

struct Rig {
    task: HeaterTask<MockStorage>,
    hw: MockHeater,
    comms: Mailbox<CommsMessage>,
    system: Mailbox<SystemMessage>,
    tx: Sender<HeaterMessage>,
    next_ts: u32,
}

impl Rig {
    fn new() -> Self {
        Self::with_storage(MockStorage::default())
    }

    fn with_storage(storage: MockStorage) -> Self {
        let config = ThermalConfig::default();
        let mut task = HeaterTask::new(&config, storage);
        let comms = Mailbox::new();
        let system = Mailbox::new();
        let registry = TaskRegistry {
            comms: comms.sender(),
            system: system.sender(),
            heater: task.sender(),
            lid: Mailbox::new().sender(),
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

    fn send(&mut self, msg: HeaterMessage) {
        assert!(self.tx.try_send(msg));
        assert!(self.task.poll(&mut self.hw));
    }

    /// One conversion cycle with all probes at the given temperatures.
    fn convert(&mut self, pad_a_c: f64, pad_b_c: f64, board_c: f64) {
        self.convert_raw(adc_for(pad_a_c), adc_for(pad_b_c), adc_for(board_c));
    }

    fn convert_raw(&mut self, pad_a: u16, pad_b: u16, board: u16) {
        self.next_ts += 100;
        let readings = HeaterReadings {
            pad_a,
            pad_b,
            board,
            timestamp_ms: self.next_ts,
        };
        self.send(HeaterMessage::TempReadComplete(readings));
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

    fn unsolicited_errors(&self) -> Vec<ErrorCode> {
        let mut codes = Vec::new();
        while let Some(msg) = self.comms.try_recv() {
            if let CommsMessage::Error { code } = msg {
                codes.push(code);
            }
        }
        codes
    }
}

#[test]
fn set_temperature_starts_closed_loop_control() {
    let mut rig = Rig::new();
    rig.convert(23.0, 23.0, 25.0);
    rig.send(HeaterMessage::SetTemperature {
        id: 7,
        target_c: 50.0,
    });
    assert_eq!(rig.acks(), vec![(7, ErrorCode::NoError)]);
    assert_eq!(rig.task.status(), SystemStatus::Controlling);

    rig.convert(23.0, 23.0, 25.0);
    // Far below target: the loop should be pushing hard.
    let power = rig.hw.last_power().unwrap();
    assert!(power > 0.5, "expected strong drive, got {power}");
}

#[test]
fn target_outside_band_is_refused() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetTemperature {
        id: 1,
        target_c: 150.0,
    });
    rig.send(HeaterMessage::SetTemperature {
        id: 2,
        target_c: -5.0,
    });
    assert_eq!(
        rig.acks(),
        vec![
            (1, ErrorCode::TargetOutOfRange),
            (2, ErrorCode::TargetOutOfRange)
        ]
    );
    assert_eq!(rig.task.status(), SystemStatus::Idle);
}

#[test]
fn disconnected_pad_enters_error_and_reports_once() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetTemperature {
        id: 1,
        target_c: 50.0,
    });
    let _ = rig.acks();

    rig.convert_raw(ADC_RAIL_HIGH, adc_for(23.0), adc_for(25.0));
    assert_eq!(rig.task.status(), SystemStatus::Error);
    assert_eq!(rig.task.setpoint(), 0.0);
    assert!(rig.hw.calls.contains(&HeaterCall::Disable));
    assert_eq!(
        rig.unsolicited_errors(),
        vec![ErrorCode::ThermistorDisconnected(
            ThermistorChannel::HeaterPadA
        )]
    );

    // Still broken: no duplicate notification.
    rig.convert_raw(ADC_RAIL_HIGH, adc_for(23.0), adc_for(25.0));
    assert!(rig.unsolicited_errors().is_empty());
}

#[test]
fn commands_rejected_while_in_error() {
    let mut rig = Rig::new();
    rig.convert_raw(ADC_RAIL_HIGH, adc_for(23.0), adc_for(25.0));
    let _ = rig.unsolicited_errors();

    rig.send(HeaterMessage::SetTemperature {
        id: 9,
        target_c: 50.0,
    });
    assert_eq!(
        rig.acks(),
        vec![(
            9,
            ErrorCode::ThermistorDisconnected(ThermistorChannel::HeaterPadA)
        )]
    );
}

#[test]
fn fault_clearing_returns_to_idle() {
    let mut rig = Rig::new();
    rig.convert_raw(ADC_RAIL_HIGH, adc_for(23.0), adc_for(25.0));
    assert_eq!(rig.task.status(), SystemStatus::Error);

    rig.convert(23.0, 23.0, 25.0);
    assert_eq!(rig.task.status(), SystemStatus::Idle);
    assert_eq!(rig.task.error_bitmap(), 0);
}

#[test]
fn latch_reset_attempted_exactly_once_when_faults_clear() {
    let mut rig = Rig::new();
    rig.hw.latch_ok = false;
    rig.hw.reset_succeeds = false;

    rig.convert_raw(ADC_RAIL_HIGH, adc_for(23.0), adc_for(25.0));
    assert_eq!(rig.hw.reset_attempts(), 0);
    let _ = rig.unsolicited_errors();

    // Sensors recover; the latch refuses. That is a distinct fault.
    rig.convert(23.0, 23.0, 25.0);
    assert_eq!(rig.hw.reset_attempts(), 1);
    assert_eq!(rig.task.status(), SystemStatus::Error);
    assert_eq!(
        rig.task.most_relevant_error(),
        ErrorCode::LatchFault(HeatElement::Heater)
    );
    assert_eq!(
        rig.unsolicited_errors(),
        vec![ErrorCode::LatchFault(HeatElement::Heater)]
    );

    // No retry storm on subsequent clean cycles.
    rig.convert(23.0, 23.0, 25.0);
    rig.convert(23.0, 23.0, 25.0);
    assert_eq!(rig.hw.reset_attempts(), 1);
}

#[test]
fn latch_reset_success_clears_the_error() {
    let mut rig = Rig::new();
    rig.hw.latch_ok = false;
    rig.hw.reset_succeeds = true;

    rig.convert_raw(ADC_RAIL_HIGH, adc_for(23.0), adc_for(25.0));
    rig.convert(23.0, 23.0, 25.0);
    assert_eq!(rig.hw.reset_attempts(), 1);
    assert_eq!(rig.task.status(), SystemStatus::Idle);
    assert_eq!(rig.task.error_bitmap(), 0);
}

#[test]
fn every_command_gets_exactly_one_ack() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetTemperature {
        id: 1,
        target_c: 40.0,
    });
    rig.send(HeaterMessage::SetPidConstants {
        id: 2,
        kp: 0.5,
        ki: 0.1,
        kd: 0.0,
    });
    rig.send(HeaterMessage::SetTemperature {
        id: 3,
        target_c: 40.0,
    });
    rig.send(HeaterMessage::Deactivate { id: 4 });
    let acks = rig.acks();
    let ids: Vec<RequestId> = acks.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[test]
fn get_temperature_reports_readings_and_target() {
    let mut rig = Rig::new();
    rig.convert(36.0, 38.0, 30.0);
    rig.send(HeaterMessage::SetTemperature {
        id: 1,
        target_c: 42.0,
    });
    let _ = rig.acks();
    rig.send(HeaterMessage::GetTemperature { id: 2 });

    let mut found = false;
    while let Some(msg) = rig.comms.try_recv() {
        if let CommsMessage::HeaterTemperature {
            responding_to_id,
            pad_a_c,
            pad_b_c,
            target_c,
            ..
        } = msg
        {
            assert_eq!(responding_to_id, 2);
            assert!((pad_a_c - 36.0).abs() < 0.2);
            assert!((pad_b_c - 38.0).abs() < 0.2);
            assert!((target_c - 42.0).abs() < 1e-9);
            found = true;
        }
    }
    assert!(found, "no temperature reply seen");
}

#[test]
fn pid_gains_out_of_range_rejected_in_any_state() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetPidConstants {
        id: 1,
        kp: 201.0,
        ki: 0.0,
        kd: 0.0,
    });
    assert_eq!(rig.acks(), vec![(1, ErrorCode::GainOutOfRange)]);
}

#[test]
fn gain_change_refused_while_controlling() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetTemperature {
        id: 1,
        target_c: 50.0,
    });
    rig.hw.calls.clear();
    rig.send(HeaterMessage::SetPidConstants {
        id: 2,
        kp: 0.8,
        ki: 0.05,
        kd: 0.2,
    });
    // The active loop keeps its gains; the host must deactivate first.
    let acks = rig.acks();
    assert_eq!(acks.last(), Some(&(2, ErrorCode::Busy)));
    assert_eq!(rig.task.status(), SystemStatus::Controlling);
    assert!(!rig.hw.calls.contains(&HeaterCall::Disable));
}

#[test]
fn gain_change_accepted_while_idle() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetPidConstants {
        id: 1,
        kp: 0.8,
        ki: 0.05,
        kd: 0.2,
    });
    assert_eq!(rig.acks(), vec![(1, ErrorCode::NoError)]);
    assert_eq!(rig.task.status(), SystemStatus::Idle);
}

#[test]
fn deactivate_while_idle_is_a_clean_noop() {
    let mut rig = Rig::new();
    rig.convert(23.0, 23.0, 25.0);
    rig.send(HeaterMessage::Deactivate { id: 5 });
    assert_eq!(rig.acks(), vec![(5, ErrorCode::NoError)]);
    assert_eq!(rig.task.status(), SystemStatus::Idle);
    assert_eq!(rig.task.error_bitmap(), 0);
}

#[test]
fn power_test_tolerates_missing_probes() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetPowerTest { id: 1, power: 0.4 });
    assert_eq!(rig.acks(), vec![(1, ErrorCode::NoError)]);
    assert_eq!(rig.task.status(), SystemStatus::PowerTest);

    // No probes on the fixture: stays in power test, keeps driving.
    rig.convert_raw(ADC_RAIL_HIGH, ADC_RAIL_HIGH, adc_for(25.0));
    assert_eq!(rig.task.status(), SystemStatus::PowerTest);
    assert_eq!(rig.hw.last_power(), Some(0.4));
}

#[test]
fn power_test_acks_a_fault_on_the_first_write() {
    let mut rig = Rig::new();
    rig.hw.fault_on_set = CircuitFault::Open;
    rig.send(HeaterMessage::SetPowerTest { id: 1, power: 0.4 });
    // The command itself tripped the circuit: the ack carries the
    // fault, not a success code.
    assert_eq!(
        rig.acks(),
        vec![(1, ErrorCode::CircuitOpen(HeatElement::Heater))]
    );
    assert_eq!(rig.task.status(), SystemStatus::Error);
}

#[test]
fn circuit_fault_on_power_write_forces_error() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetTemperature {
        id: 1,
        target_c: 60.0,
    });
    let _ = rig.acks();
    rig.hw.fault_on_set = CircuitFault::Open;

    rig.convert(23.0, 23.0, 25.0);
    assert_eq!(rig.task.status(), SystemStatus::Error);
    assert_eq!(
        rig.task.most_relevant_error(),
        ErrorCode::CircuitOpen(HeatElement::Heater)
    );
    assert_eq!(
        rig.unsolicited_errors(),
        vec![ErrorCode::CircuitOpen(HeatElement::Heater)]
    );
}

#[test]
fn deactivate_clears_circuit_fault_for_retry() {
    let mut rig = Rig::new();
    rig.send(HeaterMessage::SetTemperature {
        id: 1,
        target_c: 60.0,
    });
    rig.hw.fault_on_set = CircuitFault::Overcurrent;
    rig.convert(23.0, 23.0, 25.0);
    assert_eq!(rig.task.status(), SystemStatus::Error);

    rig.hw.fault_on_set = CircuitFault::None;
    rig.send(HeaterMessage::Deactivate { id: 2 });
    let acks = rig.acks();
    assert_eq!(acks.last(), Some(&(2, ErrorCode::NoError)));
    assert_eq!(rig.task.status(), SystemStatus::Idle);
}

#[test]
fn calibration_offsets_shift_reported_pad_temps() {
    let mut storage = MockStorage::default();
    let offsets = ElementOffsets { b: 0.0, c: 2.0 };
    offsets.store(&mut storage, HEATER_KEY).unwrap();
    let mut rig = Rig::with_storage(storage);

    rig.convert(40.0, 40.0, 30.0);
    assert!((rig.task.pad_temp() - 42.0).abs() < 0.2);
}

#[test]
fn bitmap_changes_notify_the_system_task() {
    let mut rig = Rig::new();
    rig.convert_raw(ADC_RAIL_HIGH, adc_for(23.0), adc_for(25.0));
    let mut saw_task_error = false;
    while let Some(msg) = rig.system.try_recv() {
        if let SystemMessage::TaskError { bitmap, .. } = msg {
            assert_ne!(bitmap, 0);
            saw_task_error = true;
        }
    }
    assert!(saw_task_error);
}
