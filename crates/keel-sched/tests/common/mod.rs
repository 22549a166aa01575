#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_sched::codec::Message;
use keel_sched::{
    FrameworkId, FrameworkMessage, OfferId, Scheduler, SchedulerDriver, SchedulerOptions, SlaveId,
    SlaveOffer, TaskStatus,
};
use keel_server::transport::{Endpoint, TcpTransport, Transport, TransportEvent};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Scheduler options tuned for fast tests.
pub fn fast_options() -> SchedulerOptions {
    SchedulerOptions {
        tick_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

#[derive(Debug)]
pub enum Callback {
    Registered { framework_id: FrameworkId },
    ResourceOffer { offer_id: OfferId, slots: Vec<SlaveOffer> },
    OfferRescinded { offer_id: OfferId },
    StatusUpdate { status: TaskStatus },
    FrameworkMessage { message: FrameworkMessage },
    SlaveLost { slave_id: SlaveId },
    Error { code: i32, message: String },
}

/// A scheduler that records every callback for the test to assert on.
/// Unlike the default implementation, `error` does not stop the driver.
pub struct RecordingScheduler {
    name: String,
    sender: mpsc::UnboundedSender<Callback>,
}

impl RecordingScheduler {
    pub fn new(name: impl Into<String>) -> (Arc<Self>, Callbacks) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            name: name.into(),
            sender: tx,
        });
        (scheduler, Callbacks { receiver: rx })
    }

    fn record(&self, callback: Callback) {
        let _ = self.sender.send(callback);
    }
}

impl Scheduler for RecordingScheduler {
    fn framework_name(&self, _driver: &SchedulerDriver) -> String {
        self.name.clone()
    }

    fn registered(&self, _driver: &SchedulerDriver, framework_id: &FrameworkId) {
        self.record(Callback::Registered {
            framework_id: framework_id.clone(),
        });
    }

    fn resource_offer(&self, _driver: &SchedulerDriver, offer_id: &OfferId, slots: &[SlaveOffer]) {
        self.record(Callback::ResourceOffer {
            offer_id: offer_id.clone(),
            slots: slots.to_vec(),
        });
    }

    fn offer_rescinded(&self, _driver: &SchedulerDriver, offer_id: &OfferId) {
        self.record(Callback::OfferRescinded {
            offer_id: offer_id.clone(),
        });
    }

    fn status_update(&self, _driver: &SchedulerDriver, status: &TaskStatus) {
        self.record(Callback::StatusUpdate {
            status: status.clone(),
        });
    }

    fn framework_message(&self, _driver: &SchedulerDriver, message: &FrameworkMessage) {
        self.record(Callback::FrameworkMessage {
            message: message.clone(),
        });
    }

    fn slave_lost(&self, _driver: &SchedulerDriver, slave_id: &SlaveId) {
        self.record(Callback::SlaveLost {
            slave_id: slave_id.clone(),
        });
    }

    fn error(&self, _driver: &SchedulerDriver, code: i32, message: &str) {
        self.record(Callback::Error {
            code,
            message: message.to_string(),
        });
    }
}

pub struct Callbacks {
    receiver: mpsc::UnboundedReceiver<Callback>,
}

impl Callbacks {
    pub async fn next(&mut self) -> Callback {
        tokio::time::timeout(WAIT, self.receiver.recv())
            .await
            .expect("timed out waiting for a callback")
            .expect("the scheduler went away")
    }

    pub async fn expect_none(&mut self, duration: Duration) {
        match tokio::time::timeout(duration, self.receiver.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(callback)) => panic!("unexpected callback: {callback:?}"),
        }
    }
}

/// A master the test script drives by hand: it records everything the
/// framework sends and sends whatever the test tells it to.
pub struct ScriptedMaster {
    transport: Arc<TcpTransport<Message>>,
    inbound: mpsc::UnboundedReceiver<(Endpoint, Message)>,
}

impl ScriptedMaster {
    pub async fn start() -> Self {
        let (transport, mut mailbox) = TcpTransport::<Message>::bind("master", "127.0.0.1", 0)
            .await
            .expect("failed to bind the scripted master");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = mailbox.recv().await {
                if let TransportEvent::Delivered { from, message } = event {
                    if tx.send((from, message)).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            transport: Arc::new(transport),
            inbound: rx,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.transport.local()
    }

    pub fn address(&self) -> String {
        self.endpoint().to_string()
    }

    pub async fn expect(&mut self) -> (Endpoint, Message) {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a framework message")
            .expect("the scripted master transport went away")
    }

    pub fn send(&self, to: &Endpoint, message: Message) {
        self.transport.send(to, message);
    }
}
