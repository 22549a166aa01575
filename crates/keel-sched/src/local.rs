//! A compact in-process master behind the `local` and `localquiet` master
//! addresses: enough of the cluster to register a framework, hand out
//! offers, and acknowledge task launches, without slaves or executors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keel_server::actor::{Actor, ActorAction, ActorContext, ActorHandle};
use keel_server::transport::{Endpoint, TcpTransport, Transport, TransportEvent, TransportMailbox};
use log::{debug, info, warn};

use crate::codec::{Message, Params, SlaveOffer, TaskDescriptor, TaskState};
use crate::error::SchedulerResult;
use crate::id::{FrameworkId, OfferId, SlaveId, TaskId};

#[derive(Debug, Clone)]
pub struct LocalClusterOptions {
    pub slaves: usize,
    pub cpus: u32,
    pub mem: u64,
    /// Suppress the cluster's own log output.
    pub quiet: bool,
}

impl Default for LocalClusterOptions {
    fn default() -> Self {
        Self {
            slaves: 1,
            cpus: 1,
            mem: 1 << 30,
            quiet: false,
        }
    }
}

pub struct LocalCluster {
    master: Endpoint,
    handle: ActorHandle<LocalMaster>,
}

impl LocalCluster {
    pub async fn start(options: LocalClusterOptions) -> SchedulerResult<Self> {
        let (transport, mailbox) = TcpTransport::<Message>::bind("master", "127.0.0.1", 0).await?;
        let master = transport.local().clone();
        if !options.quiet {
            info!("local cluster master listening at {master}");
        }
        let handle = ActorHandle::new(LocalMasterOptions {
            options,
            transport: Arc::new(transport),
            mailbox,
        });
        Ok(Self { master, handle })
    }

    pub fn master(&self) -> &Endpoint {
        &self.master
    }

    pub fn shutdown(&self) {
        let _ = self.handle.send(LocalEvent::Shutdown);
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum LocalEvent {
    Inbound { from: Endpoint, message: Message },
    Shutdown,
}

struct LocalMasterOptions {
    options: LocalClusterOptions,
    transport: Arc<dyn Transport<Message>>,
    mailbox: TransportMailbox<Message>,
}

struct LocalSlot {
    slave_id: SlaveId,
    endpoint: Endpoint,
    free: bool,
}

struct LocalMaster {
    options: LocalClusterOptions,
    transport: Arc<dyn Transport<Message>>,
    mailbox: Option<TransportMailbox<Message>>,
    slots: Vec<LocalSlot>,
    frameworks: HashMap<FrameworkId, Endpoint>,
    /// Outstanding offers to the slaves they cover.
    offers: HashMap<OfferId, (FrameworkId, Vec<SlaveId>)>,
    tasks: HashMap<TaskId, (FrameworkId, SlaveId)>,
    next_framework: u64,
    next_offer: u64,
}

#[async_trait]
impl Actor for LocalMaster {
    type Message = LocalEvent;
    type Options = LocalMasterOptions;

    fn name() -> &'static str {
        "LocalMaster"
    }

    fn new(options: LocalMasterOptions) -> Self {
        let local = options.transport.local().clone();
        let slots = (0..options.options.slaves)
            .map(|i| LocalSlot {
                slave_id: format!("slave-{i}").into(),
                // There are no slave processes; their endpoints resolve to
                // the master so that slave-bound messages have a mailbox.
                endpoint: Endpoint::new(format!("slave-{i}"), local.host.clone(), local.port),
                free: true,
            })
            .collect();
        Self {
            options: options.options,
            transport: options.transport,
            mailbox: Some(options.mailbox),
            slots,
            frameworks: HashMap::new(),
            offers: HashMap::new(),
            tasks: HashMap::new(),
            next_framework: 0,
            next_offer: 0,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        if let Some(mut mailbox) = self.mailbox.take() {
            let handle = ctx.handle().clone();
            ctx.spawn(async move {
                while let Some(event) = mailbox.recv().await {
                    let event = match event {
                        TransportEvent::Delivered { from, message } => {
                            LocalEvent::Inbound { from, message }
                        }
                        TransportEvent::PeerClosed { .. } => continue,
                    };
                    if handle.send(event).is_err() {
                        break;
                    }
                }
            });
        }
    }

    fn receive(&mut self, _ctx: &mut ActorContext<Self>, event: LocalEvent) -> ActorAction {
        match event {
            LocalEvent::Inbound { from, message } => self.handle_message(from, message),
            LocalEvent::Shutdown => ActorAction::Stop,
        }
    }

    async fn stop(self, _ctx: &mut ActorContext<Self>) {
        if !self.options.quiet {
            info!("local cluster master has stopped");
        }
    }
}

impl LocalMaster {
    fn handle_message(&mut self, from: Endpoint, message: Message) -> ActorAction {
        match message {
            Message::RegisterFramework { name, .. } => {
                self.next_framework += 1;
                let framework_id = FrameworkId::from(format!("fw-{}", self.next_framework));
                if !self.options.quiet {
                    info!("registering framework \"{name}\" as {framework_id} at {from}");
                }
                self.frameworks.insert(framework_id.clone(), from.clone());
                self.transport
                    .send(&from, Message::FrameworkRegistered { framework_id: framework_id.clone() });
                self.offer_slots(&framework_id);
            }
            Message::ReregisterFramework { framework_id, .. } => {
                if !self.options.quiet {
                    info!("re-registering framework {framework_id} at {from}");
                }
                self.frameworks.insert(framework_id.clone(), from.clone());
                self.transport
                    .send(&from, Message::FrameworkRegistered { framework_id: framework_id.clone() });
                self.offer_slots(&framework_id);
            }
            Message::UnregisterFramework { framework_id } => {
                self.frameworks.remove(&framework_id);
                let offered = self
                    .offers
                    .iter()
                    .filter(|(_, (owner, _))| *owner == framework_id)
                    .map(|(offer_id, _)| offer_id.clone())
                    .collect::<Vec<_>>();
                for offer_id in offered {
                    if let Some((_, slave_ids)) = self.offers.remove(&offer_id) {
                        self.release_slaves(&slave_ids);
                    }
                }
                let running = self
                    .tasks
                    .iter()
                    .filter(|(_, (owner, _))| *owner == framework_id)
                    .map(|(task_id, _)| *task_id)
                    .collect::<Vec<_>>();
                for task_id in running {
                    if let Some((_, slave_id)) = self.tasks.remove(&task_id) {
                        self.release_slaves(&[slave_id]);
                    }
                }
            }
            Message::OfferReply {
                framework_id,
                offer_id,
                tasks,
                ..
            } => {
                self.handle_offer_reply(framework_id, offer_id, tasks);
            }
            Message::ReliableOfferReply {
                message_id,
                reply_to,
                framework_id,
                offer_id,
                tasks,
                ..
            } => {
                self.transport.send(
                    &reply_to,
                    Message::RelayAck {
                        message_id,
                        origin: self.transport.local().clone(),
                    },
                );
                self.handle_offer_reply(framework_id, offer_id, tasks);
            }
            Message::KillTask {
                framework_id,
                task_id,
            } => {
                if let Some((owner, slave_id)) = self.tasks.remove(&task_id) {
                    if owner == framework_id {
                        self.release_slaves(&[slave_id]);
                        self.report(
                            &framework_id,
                            Message::StatusUpdate {
                                task_id,
                                state: TaskState::Killed,
                                data: Vec::new(),
                            },
                        );
                    }
                }
            }
            Message::ReviveOffers { framework_id } => {
                self.offer_slots(&framework_id);
            }
            Message::ExecutorMessage { framework_id, .. } => {
                debug!("local cluster has no executors; dropping message from {framework_id}");
            }
            other => {
                warn!("local cluster master ignoring {} from {from}", other.name());
            }
        }
        ActorAction::Continue
    }

    fn handle_offer_reply(
        &mut self,
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskDescriptor>,
    ) {
        let Some((owner, slave_ids)) = self.offers.remove(&offer_id) else {
            debug!("ignoring reply to unknown offer {offer_id}");
            return;
        };
        if owner != framework_id {
            warn!("framework {framework_id} replied to an offer owned by {owner}");
            return;
        }
        let mut unused = slave_ids;
        for task in tasks {
            unused.retain(|slave_id| *slave_id != task.slave_id);
            self.tasks
                .insert(task.task_id, (framework_id.clone(), task.slave_id));
            self.report(
                &framework_id,
                Message::StatusUpdate {
                    task_id: task.task_id,
                    state: TaskState::Running,
                    data: Vec::new(),
                },
            );
        }
        self.release_slaves(&unused);
    }

    fn offer_slots(&mut self, framework_id: &FrameworkId) {
        let slots = self
            .slots
            .iter_mut()
            .filter(|slot| slot.free)
            .map(|slot| {
                slot.free = false;
                let mut params = Params::new();
                params.insert("cpus".to_string(), self.options.cpus.to_string());
                params.insert("mem".to_string(), self.options.mem.to_string());
                SlaveOffer {
                    slave_id: slot.slave_id.clone(),
                    host: "localhost".to_string(),
                    slave_endpoint: slot.endpoint.clone(),
                    params,
                }
            })
            .collect::<Vec<_>>();
        if slots.is_empty() {
            return;
        }
        self.next_offer += 1;
        let offer_id = OfferId::from(format!("offer-{}", self.next_offer));
        self.offers.insert(
            offer_id.clone(),
            (
                framework_id.clone(),
                slots.iter().map(|slot| slot.slave_id.clone()).collect(),
            ),
        );
        self.report(framework_id, Message::SlotOffer { offer_id, slots });
    }

    fn release_slaves(&mut self, slave_ids: &[SlaveId]) {
        for slot in self.slots.iter_mut() {
            if slave_ids.contains(&slot.slave_id) {
                slot.free = true;
            }
        }
    }

    fn report(&self, framework_id: &FrameworkId, message: Message) {
        match self.frameworks.get(framework_id) {
            Some(endpoint) => self.transport.send(endpoint, message),
            None => debug!("no endpoint for framework {framework_id}"),
        }
    }
}
