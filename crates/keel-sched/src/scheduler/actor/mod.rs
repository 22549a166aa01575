mod core;
mod handler;

use std::sync::Arc;

use keel_server::transport::{Transport, TransportMailbox};

use crate::codec::{ExecutorInfo, Message};
use crate::detector::MasterDetector;
use crate::driver::{Scheduler, WeakSchedulerDriver};
use crate::id::TaskId;
use crate::relay::ReliableRelay;
use crate::scheduler::options::SchedulerOptions;
use crate::scheduler::state::SchedulerState;

/// The scheduler actor: the sole owner of scheduler state, fed by the
/// transport mailbox, the master detector, the relay tick, and commands
/// posted by the driver façade.
pub(crate) struct SchedulerProcess {
    options: SchedulerOptions,
    framework_name: String,
    user: String,
    executor: ExecutorInfo,
    /// Whether a coordination service tracks the master. Offer replies go
    /// through the reliable relay only in this mode.
    coordinated: bool,
    scheduler: Arc<dyn Scheduler>,
    driver: WeakSchedulerDriver,
    transport: Arc<dyn Transport<Message>>,
    mailbox: Option<TransportMailbox<Message>>,
    detector: Option<Box<dyn MasterDetector>>,
    state: SchedulerState,
    relay: ReliableRelay<Vec<TaskId>>,
}

pub(crate) struct SchedulerProcessOptions {
    pub options: SchedulerOptions,
    pub framework_name: String,
    pub user: String,
    pub executor: ExecutorInfo,
    pub coordinated: bool,
    pub scheduler: Arc<dyn Scheduler>,
    pub driver: WeakSchedulerDriver,
    pub transport: Arc<dyn Transport<Message>>,
    pub mailbox: TransportMailbox<Message>,
    pub detector: Box<dyn MasterDetector>,
}
