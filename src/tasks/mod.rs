//! Control tasks and their wiring.
//!
//! Each task owns one mailbox and all of its own state; the only shared
//! structure is the [`TaskRegistry`], a bundle of senders handed to every
//! task once the whole set has been constructed. Tasks clone the registry
//! at the top of each cycle, so registry provision is the single
//! synchronisation point of the system.

pub mod heater;
pub mod lid;
pub mod plate;

use crate::mailbox::Sender;
use crate::messages::{CommsMessage, HeaterMessage, LidMessage, PlateMessage, SystemMessage};

/// Lifecycle shared by all three control tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemStatus {
    #[default]
    Idle,
    Controlling,
    /// Open-loop drive for manufacturing test. Sensor faults are
    /// tolerated in this mode; the fixture may have no probes fitted.
    PowerTest,
    Error,
}

/// Senders to every task, cloned freely.
#[derive(Clone)]
pub struct TaskRegistry {
    pub comms: Sender<CommsMessage>,
    pub system: Sender<SystemMessage>,
    pub heater: Sender<HeaterMessage>,
    pub lid: Sender<LidMessage>,
    pub plate: Sender<PlateMessage>,
}
