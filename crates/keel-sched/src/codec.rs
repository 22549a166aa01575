use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use keel_server::transport::{Endpoint, Wire, WireError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::id::{FrameworkId, MessageId, OfferId, SlaveId, TaskId};

pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub uri: String,
    pub data: Vec<u8>,
}

impl ExecutorInfo {
    pub fn new(uri: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            uri: uri.into(),
            data: data.into(),
        }
    }
}

/// One slave's portion of a resource offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveOffer {
    pub slave_id: SlaveId,
    pub host: String,
    pub slave_endpoint: Endpoint,
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub slave_id: SlaveId,
    pub name: String,
    pub params: Params,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub data: Vec<u8>,
}

/// A payload exchanged between a framework and one of its executors,
/// addressed by the slave the executor runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkMessage {
    pub slave_id: SlaveId,
    pub task_id: TaskId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    /// A state this peer does not recognize.
    /// Newer peers may send states that older peers must tolerate.
    Unknown,
}

impl TaskState {
    fn code(self) -> u32 {
        match self {
            TaskState::Starting => 0,
            TaskState::Running => 1,
            TaskState::Finished => 2,
            TaskState::Failed => 3,
            TaskState::Killed => 4,
            TaskState::Lost => 5,
            TaskState::Unknown => u32::MAX,
        }
    }
}

impl From<u32> for TaskState {
    fn from(code: u32) -> Self {
        match code {
            0 => TaskState::Starting,
            1 => TaskState::Running,
            2 => TaskState::Finished,
            3 => TaskState::Failed,
            4 => TaskState::Killed,
            5 => TaskState::Lost,
            _ => TaskState::Unknown,
        }
    }
}

// Task states travel as bare integers so that an unrecognized value decodes
// to [TaskState::Unknown] instead of failing the whole frame.
impl Serialize for TaskState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for TaskState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(TaskState::from(u32::deserialize(deserializer)?))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Starting => "STARTING",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
            TaskState::Lost => "LOST",
            TaskState::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

/// The closed union of wire messages.
///
/// Variant order is the tag ABI: new messages may only be appended, never
/// inserted or reordered, so that older peers fail cleanly on frames they
/// do not understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // framework to master
    RegisterFramework {
        name: String,
        user: String,
        executor: ExecutorInfo,
    },
    ReregisterFramework {
        framework_id: FrameworkId,
        name: String,
        user: String,
        executor: ExecutorInfo,
    },
    UnregisterFramework {
        framework_id: FrameworkId,
    },
    OfferReply {
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskDescriptor>,
        params: Params,
    },
    ReliableOfferReply {
        message_id: MessageId,
        reply_to: Endpoint,
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskDescriptor>,
        params: Params,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    ReviveOffers {
        framework_id: FrameworkId,
    },
    RelayFrameworkMessage {
        framework_id: FrameworkId,
        message: FrameworkMessage,
    },
    // master to framework
    FrameworkRegistered {
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
        task_id: TaskId,
        state: TaskState,
        data: Vec<u8>,
    },
    ReliableStatusUpdate {
        message_id: MessageId,
        origin: Endpoint,
        task_id: TaskId,
        state: TaskState,
        data: Vec<u8>,
    },
    FrameworkMessage {
        message: FrameworkMessage,
    },
    ReliableFrameworkMessage {
        message_id: MessageId,
        origin: Endpoint,
        message: FrameworkMessage,
    },
    SlaveLost {
        slave_id: SlaveId,
    },
    MasterError {
        code: i32,
        text: String,
    },
    // framework to slave
    ExecutorMessage {
        framework_id: FrameworkId,
        message: FrameworkMessage,
    },
    // reliable delivery
    RelayAck {
        message_id: MessageId,
        origin: Endpoint,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::RegisterFramework { .. } => "RegisterFramework",
            Message::ReregisterFramework { .. } => "ReregisterFramework",
            Message::UnregisterFramework { .. } => "UnregisterFramework",
            Message::OfferReply { .. } => "OfferReply",
            Message::ReliableOfferReply { .. } => "ReliableOfferReply",
            Message::KillTask { .. } => "KillTask",
            Message::ReviveOffers { .. } => "ReviveOffers",
            Message::RelayFrameworkMessage { .. } => "RelayFrameworkMessage",
            Message::FrameworkRegistered { .. } => "FrameworkRegistered",
            Message::SlotOffer { .. } => "SlotOffer",
            Message::RescindOffer { .. } => "RescindOffer",
            Message::StatusUpdate { .. } => "StatusUpdate",
            Message::ReliableStatusUpdate { .. } => "ReliableStatusUpdate",
            Message::FrameworkMessage { .. } => "FrameworkMessage",
            Message::ReliableFrameworkMessage { .. } => "ReliableFrameworkMessage",
            Message::SlaveLost { .. } => "SlaveLost",
            Message::MasterError { .. } => "MasterError",
            Message::ExecutorMessage { .. } => "ExecutorMessage",
            Message::RelayAck { .. } => "RelayAck",
        }
    }
}

impl Wire for Message {
    fn encode(&self) -> Result<Bytes, WireError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| WireError::Malformed(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(bytes).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_register_roundtrip() {
        roundtrip(Message::RegisterFramework {
            name: "analytics".to_string(),
            user: "deploy".to_string(),
            executor: ExecutorInfo::new("hdfs://executor", b"args".to_vec()),
        });
    }

    #[test]
    fn test_offer_reply_roundtrip() {
        let mut params = Params::new();
        params.insert("cpus".to_string(), "2".to_string());
        roundtrip(Message::OfferReply {
            framework_id: "fw-1".into(),
            offer_id: "offer-1".into(),
            tasks: vec![TaskDescriptor {
                task_id: 7.into(),
                slave_id: "slave-1".into(),
                name: "task".to_string(),
                params: params.clone(),
                data: vec![1, 2, 3],
            }],
            params,
        });
    }

    #[test]
    fn test_reliable_status_update_roundtrip() {
        roundtrip(Message::ReliableStatusUpdate {
            message_id: 42.into(),
            origin: Endpoint::new("master", "10.0.0.1", 5050),
            task_id: 9.into(),
            state: TaskState::Finished,
            data: b"ok".to_vec(),
        });
    }

    #[test]
    fn test_slot_offer_roundtrip() {
        roundtrip(Message::SlotOffer {
            offer_id: "offer-2".into(),
            slots: vec![SlaveOffer {
                slave_id: "slave-3".into(),
                host: "node3".to_string(),
                slave_endpoint: Endpoint::new("slave-3", "10.0.0.3", 5051),
                params: Params::new(),
            }],
        });
    }

    #[test]
    fn test_truncated_frame_is_malformed() {
        let message = Message::RescindOffer {
            offer_id: "offer-9".into(),
        };
        let bytes = message.encode().unwrap();
        let result = Message::decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        // A variant index far past the end of the union.
        let bytes = bincode::serialize(&(10_000u32,)).unwrap();
        let result = Message::decode(&bytes);
        assert!(matches!(result, Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_unrecognized_task_state_decodes_to_unknown() {
        let bytes = bincode::serialize(&17u32).unwrap();
        let state: TaskState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(state, TaskState::Unknown);
    }

    #[test]
    fn test_task_state_roundtrip() {
        for state in [
            TaskState::Starting,
            TaskState::Running,
            TaskState::Finished,
            TaskState::Failed,
            TaskState::Killed,
            TaskState::Lost,
        ] {
            let bytes = bincode::serialize(&state).unwrap();
            let decoded: TaskState = bincode::deserialize(&bytes).unwrap();
            assert_eq!(state, decoded);
        }
    }
}
