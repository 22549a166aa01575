use keel_server::actor::{ActorAction, ActorContext};
use keel_server::transport::Endpoint;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::codec::{
    FrameworkMessage, Message, Params, SlaveOffer, TaskDescriptor, TaskState, TaskStatus,
};
use crate::driver::SchedulerDriver;
use crate::id::{FrameworkId, MessageId, OfferId, SlaveId, TaskId};
use crate::scheduler::actor::SchedulerProcess;
use crate::scheduler::event::{RelayInfo, SchedulerEvent};

impl SchedulerProcess {
    fn send_to_master(&self, message: Message) {
        match self.state.master() {
            Some(master) => self.transport.send(master, message),
            None => warn!("dropping {}: no master is known", message.name()),
        }
    }

    pub(super) fn handle_master_changed(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        epoch: String,
        master: Endpoint,
    ) -> ActorAction {
        info!("new master detected at {master} (epoch {epoch})");
        self.state.set_master(epoch, master.clone());
        self.relay.set_master(master.clone());
        self.transport.link(&master);
        let message = match self.state.framework_id() {
            None => Message::RegisterFramework {
                name: self.framework_name.clone(),
                user: self.user.clone(),
                executor: self.executor.clone(),
            },
            Some(framework_id) => Message::ReregisterFramework {
                framework_id: framework_id.clone(),
                name: self.framework_name.clone(),
                user: self.user.clone(),
                executor: self.executor.clone(),
            },
        };
        self.transport.send(&master, message);
        ActorAction::Continue
    }

    pub(super) fn handle_master_lost(&mut self, _ctx: &mut ActorContext<Self>) -> ActorAction {
        info!(
            "no master currently detected (last known epoch: {})",
            self.state.epoch().unwrap_or("none")
        );
        ActorAction::Continue
    }

    pub(super) fn handle_registered(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        framework_id: FrameworkId,
    ) -> ActorAction {
        self.state.set_framework_id(framework_id);
        if let Some(framework_id) = self.state.framework_id() {
            let framework_id = framework_id.clone();
            info!("framework registered with id {framework_id}");
            self.scheduler.registered(driver, &framework_id);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_slot_offer(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        offer_id: OfferId,
        slots: Vec<SlaveOffer>,
    ) -> ActorAction {
        debug!("received offer {offer_id} with {} slot(s)", slots.len());
        // Remember the slave endpoints found in the offer so that framework
        // messages can later go to the slave directly.
        self.state.save_offer(offer_id.clone(), &slots);
        self.scheduler.resource_offer(driver, &offer_id, &slots);
        ActorAction::Continue
    }

    pub(super) fn handle_rescind_offer(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        offer_id: OfferId,
    ) -> ActorAction {
        self.state.remove_offer(&offer_id);
        self.scheduler.offer_rescinded(driver, &offer_id);
        ActorAction::Continue
    }

    pub(super) fn handle_reply_to_offer(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        offer_id: OfferId,
        tasks: Vec<TaskDescriptor>,
        params: Params,
    ) -> ActorAction {
        // Keep only the slave endpoints tasks were actually launched on.
        for task in &tasks {
            let endpoint = self.state.offer_slave(&offer_id, &task.slave_id).cloned();
            match endpoint {
                Some(endpoint) => self.state.save_slave(task.slave_id.clone(), endpoint),
                None => warn!(
                    "offer {offer_id} has no slot on slave {} for task {}",
                    task.slave_id, task.task_id
                ),
            }
        }
        self.state.remove_offer(&offer_id);

        let framework_id = self.framework_id();
        if self.coordinated {
            let message_id = match self.relay.next_id() {
                Ok(message_id) => message_id,
                Err(e) => {
                    warn!("failed to allocate a reliable message id: {e}");
                    return ActorAction::Continue;
                }
            };
            let task_ids = tasks.iter().map(|task| task.task_id).collect::<Vec<_>>();
            debug!("replying reliably to offer {offer_id} as message {message_id}");
            let message = Message::ReliableOfferReply {
                message_id,
                reply_to: self.transport.local().clone(),
                framework_id,
                offer_id,
                tasks,
                params,
            };
            if let Some((peer, message)) =
                self.relay.send(message_id, message, task_ids, Instant::now())
            {
                self.transport.send(&peer, message);
            }
        } else {
            self.send_to_master(Message::OfferReply {
                framework_id,
                offer_id,
                tasks,
                params,
            });
        }
        ActorAction::Continue
    }

    pub(super) fn handle_status_update(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        status: TaskStatus,
        relay: Option<RelayInfo>,
    ) -> ActorAction {
        if !self.acknowledge(relay) {
            return ActorAction::Continue;
        }
        self.scheduler.status_update(driver, &status);
        ActorAction::Continue
    }

    pub(super) fn handle_framework_message(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        message: FrameworkMessage,
        relay: Option<RelayInfo>,
    ) -> ActorAction {
        if !self.acknowledge(relay) {
            return ActorAction::Continue;
        }
        self.scheduler.framework_message(driver, &message);
        ActorAction::Continue
    }

    pub(super) fn handle_slave_lost(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        slave_id: SlaveId,
    ) -> ActorAction {
        info!("slave {slave_id} has been lost");
        self.state.remove_slave(&slave_id);
        self.scheduler.slave_lost(driver, &slave_id);
        ActorAction::Continue
    }

    pub(super) fn handle_master_error(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        code: i32,
        text: String,
    ) -> ActorAction {
        self.scheduler.error(driver, code, &text);
        ActorAction::Continue
    }

    pub(super) fn handle_relay_ack(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        message_id: MessageId,
    ) -> ActorAction {
        self.relay.ack(message_id);
        ActorAction::Continue
    }

    pub(super) fn handle_unknown_message(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        description: String,
    ) -> ActorAction {
        self.scheduler.error(driver, -1, &description);
        ActorAction::Continue
    }

    pub(super) fn handle_send_framework_message(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        message: FrameworkMessage,
    ) -> ActorAction {
        // This path deliberately bypasses the master and the relay: the
        // message goes straight to the slave, or nowhere.
        match self.state.slave(&message.slave_id) {
            Some(endpoint) => {
                let framework_id = self.framework_id();
                self.transport.send(
                    endpoint,
                    Message::ExecutorMessage {
                        framework_id,
                        message,
                    },
                );
            }
            None => debug!(
                "dropping framework message for unknown slave {}",
                message.slave_id
            ),
        }
        ActorAction::Continue
    }

    pub(super) fn handle_kill_task(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        task_id: TaskId,
    ) -> ActorAction {
        let framework_id = self.framework_id();
        self.send_to_master(Message::KillTask {
            framework_id,
            task_id,
        });
        ActorAction::Continue
    }

    pub(super) fn handle_revive_offers(&mut self, _ctx: &mut ActorContext<Self>) -> ActorAction {
        let framework_id = self.framework_id();
        self.send_to_master(Message::ReviveOffers { framework_id });
        ActorAction::Continue
    }

    pub(super) fn handle_peer_closed(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        driver: &SchedulerDriver,
        peer: Endpoint,
    ) -> ActorAction {
        if self.state.master() == Some(&peer) {
            if self.coordinated {
                warn!("connection to master lost; waiting for a new master");
            } else {
                self.scheduler
                    .error(driver, -1, "Connection to master failed");
            }
        } else {
            debug!("connection to {peer} lost");
        }
        ActorAction::Continue
    }

    pub(super) fn handle_tick(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        let outstanding = self.relay.outstanding();
        if outstanding > 0 {
            debug!("{outstanding} reliable message(s) outstanding");
        }
        let tick = self.relay.tick(Instant::now());
        for (peer, message) in tick.retransmits {
            self.transport.send(&peer, message);
        }
        for expired in tick.expired {
            warn!(
                "reliable message {} timed out; marking its tasks lost",
                expired.message_id
            );
            for task_id in expired.on_timeout {
                // Synthesized loss takes the normal dispatch path so the
                // user sees an ordinary status update.
                ctx.send(SchedulerEvent::StatusUpdate {
                    status: TaskStatus {
                        task_id,
                        state: TaskState::Lost,
                        data: Vec::new(),
                    },
                    relay: None,
                });
            }
        }
        ActorAction::Continue
    }

    /// Best-effort unregistration on the way out.
    pub(super) fn finalize(&mut self) -> ActorAction {
        if let Some(master) = self.state.master() {
            let framework_id = self.framework_id();
            self.transport
                .send(master, Message::UnregisterFramework { framework_id });
        }
        ActorAction::Stop
    }

    /// Acknowledge an inbound reliable message and report whether it is
    /// fresh. Duplicates are acknowledged again but not re-delivered.
    fn acknowledge(&mut self, relay: Option<RelayInfo>) -> bool {
        let Some(RelayInfo { message_id, origin }) = relay else {
            return true;
        };
        self.transport.send(
            &origin,
            Message::RelayAck {
                message_id,
                origin: self.transport.local().clone(),
            },
        );
        if self.relay.accept(message_id, &origin) {
            debug!("accepted reliable message {message_id} from {origin}");
            true
        } else {
            debug!("dropping duplicate reliable message {message_id} from {origin}");
            false
        }
    }

    fn framework_id(&self) -> FrameworkId {
        self.state.framework_id().cloned().unwrap_or_default()
    }
}
