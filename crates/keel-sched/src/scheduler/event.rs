use keel_server::transport::Endpoint;

use crate::codec::{FrameworkMessage, Message, Params, SlaveOffer, TaskDescriptor, TaskStatus};
use crate::id::{FrameworkId, MessageId, OfferId, SlaveId, TaskId};

/// Everything the scheduler actor reacts to: decoded wire messages,
/// façade commands, master-detection events, link deaths, and the
/// periodic relay tick.
pub(crate) enum SchedulerEvent {
    // master detection
    MasterChanged {
        epoch: String,
        master: Endpoint,
    },
    MasterLost,
    // inbound from the master
    Registered {
        framework_id: FrameworkId,
    },
    SlotOffer {
        offer_id: OfferId,
        slots: Vec<SlaveOffer>,
    },
    RescindOffer {
        offer_id: OfferId,
    },
    StatusUpdate {
        status: TaskStatus,
        relay: Option<RelayInfo>,
    },
    FrameworkMessage {
        message: FrameworkMessage,
        relay: Option<RelayInfo>,
    },
    SlaveLost {
        slave_id: SlaveId,
    },
    MasterError {
        code: i32,
        text: String,
    },
    RelayAck {
        message_id: MessageId,
    },
    UnknownMessage {
        description: String,
    },
    // commands posted by the driver façade
    ReplyToOffer {
        offer_id: OfferId,
        tasks: Vec<TaskDescriptor>,
        params: Params,
    },
    SendFrameworkMessage {
        message: FrameworkMessage,
    },
    KillTask {
        task_id: TaskId,
    },
    ReviveOffers,
    Shutdown,
    // transport and timer
    PeerClosed {
        peer: Endpoint,
    },
    Tick,
}

/// Bookkeeping for an inbound message that requires an acknowledgment.
pub(crate) struct RelayInfo {
    pub message_id: MessageId,
    pub origin: Endpoint,
}

impl SchedulerEvent {
    pub(crate) fn from_wire(from: Endpoint, message: Message) -> SchedulerEvent {
        match message {
            Message::FrameworkRegistered { framework_id } => {
                SchedulerEvent::Registered { framework_id }
            }
            Message::SlotOffer { offer_id, slots } => {
                SchedulerEvent::SlotOffer { offer_id, slots }
            }
            Message::RescindOffer { offer_id } => SchedulerEvent::RescindOffer { offer_id },
            Message::StatusUpdate {
                task_id,
                state,
                data,
            } => SchedulerEvent::StatusUpdate {
                status: TaskStatus {
                    task_id,
                    state,
                    data,
                },
                relay: None,
            },
            Message::ReliableStatusUpdate {
                message_id,
                origin,
                task_id,
                state,
                data,
            } => SchedulerEvent::StatusUpdate {
                status: TaskStatus {
                    task_id,
                    state,
                    data,
                },
                relay: Some(RelayInfo { message_id, origin }),
            },
            Message::FrameworkMessage { message } => SchedulerEvent::FrameworkMessage {
                message,
                relay: None,
            },
            Message::ReliableFrameworkMessage {
                message_id,
                origin,
                message,
            } => SchedulerEvent::FrameworkMessage {
                message,
                relay: Some(RelayInfo { message_id, origin }),
            },
            Message::SlaveLost { slave_id } => SchedulerEvent::SlaveLost { slave_id },
            Message::MasterError { code, text } => SchedulerEvent::MasterError { code, text },
            Message::RelayAck { message_id, .. } => SchedulerEvent::RelayAck { message_id },
            other => SchedulerEvent::UnknownMessage {
                description: format!("unknown message {} from {from}", other.name()),
            },
        }
    }
}
