use async_trait::async_trait;
use keel_server::actor::{Actor, ActorAction, ActorContext};
use keel_server::transport::TransportEvent;
use log::info;
use tokio::time::MissedTickBehavior;

use crate::detector::MasterEvent;
use crate::relay::{RelayOptions, ReliableRelay};
use crate::scheduler::actor::{SchedulerProcess, SchedulerProcessOptions};
use crate::scheduler::event::SchedulerEvent;
use crate::scheduler::state::SchedulerState;

#[async_trait]
impl Actor for SchedulerProcess {
    type Message = SchedulerEvent;
    type Options = SchedulerProcessOptions;

    fn name() -> &'static str {
        "SchedulerProcess"
    }

    fn new(options: SchedulerProcessOptions) -> Self {
        let relay = ReliableRelay::new(RelayOptions {
            initial_delay: options.options.relay_initial_delay,
            max_delay: options.options.relay_max_delay,
            factor: options.options.relay_backoff_factor,
            deadline: options.options.relay_deadline,
        });
        Self {
            framework_name: options.framework_name,
            user: options.user,
            executor: options.executor,
            coordinated: options.coordinated,
            scheduler: options.scheduler,
            driver: options.driver,
            transport: options.transport,
            mailbox: Some(options.mailbox),
            detector: Some(options.detector),
            state: SchedulerState::new(),
            relay,
            options: options.options,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        // Make the command channel reachable from user callbacks before any
        // message is dispatched.
        if let Some(driver) = self.driver.upgrade() {
            driver.attach(ctx.handle().sender());
        }

        if let Some(mut mailbox) = self.mailbox.take() {
            let handle = ctx.handle().clone();
            ctx.spawn(async move {
                while let Some(event) = mailbox.recv().await {
                    let event = match event {
                        TransportEvent::Delivered { from, message } => {
                            SchedulerEvent::from_wire(from, message)
                        }
                        TransportEvent::PeerClosed { peer } => {
                            SchedulerEvent::PeerClosed { peer }
                        }
                    };
                    if handle.send(event).is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(mut detector) = self.detector.take() {
            let handle = ctx.handle().clone();
            ctx.spawn(async move {
                while let Some(event) = detector.next().await {
                    let event = match event {
                        MasterEvent::Detected { epoch, master } => {
                            SchedulerEvent::MasterChanged { epoch, master }
                        }
                        MasterEvent::Lost => SchedulerEvent::MasterLost,
                    };
                    if handle.send(event).is_err() {
                        break;
                    }
                }
            });
        }

        let handle = ctx.handle().clone();
        let tick_interval = self.options.tick_interval;
        ctx.spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if handle.send(SchedulerEvent::Tick).is_err() {
                    break;
                }
            }
        });

        info!(
            "scheduler process for framework \"{}\" listening at {}",
            self.framework_name,
            self.transport.local()
        );
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, event: SchedulerEvent) -> ActorAction {
        // With every driver handle gone there is no user left to call back.
        let Some(driver) = self.driver.upgrade() else {
            return self.finalize();
        };
        // Once termination is observed, no further user callback fires.
        if driver.terminating() {
            return self.finalize();
        }
        match event {
            SchedulerEvent::MasterChanged { epoch, master } => {
                self.handle_master_changed(ctx, epoch, master)
            }
            SchedulerEvent::MasterLost => self.handle_master_lost(ctx),
            SchedulerEvent::Registered { framework_id } => {
                self.handle_registered(ctx, &driver, framework_id)
            }
            SchedulerEvent::SlotOffer { offer_id, slots } => {
                self.handle_slot_offer(ctx, &driver, offer_id, slots)
            }
            SchedulerEvent::RescindOffer { offer_id } => {
                self.handle_rescind_offer(ctx, &driver, offer_id)
            }
            SchedulerEvent::StatusUpdate { status, relay } => {
                self.handle_status_update(ctx, &driver, status, relay)
            }
            SchedulerEvent::FrameworkMessage { message, relay } => {
                self.handle_framework_message(ctx, &driver, message, relay)
            }
            SchedulerEvent::SlaveLost { slave_id } => {
                self.handle_slave_lost(ctx, &driver, slave_id)
            }
            SchedulerEvent::MasterError { code, text } => {
                self.handle_master_error(ctx, &driver, code, text)
            }
            SchedulerEvent::RelayAck { message_id } => self.handle_relay_ack(ctx, message_id),
            SchedulerEvent::UnknownMessage { description } => {
                self.handle_unknown_message(ctx, &driver, description)
            }
            SchedulerEvent::ReplyToOffer {
                offer_id,
                tasks,
                params,
            } => self.handle_reply_to_offer(ctx, offer_id, tasks, params),
            SchedulerEvent::SendFrameworkMessage { message } => {
                self.handle_send_framework_message(ctx, message)
            }
            SchedulerEvent::KillTask { task_id } => self.handle_kill_task(ctx, task_id),
            SchedulerEvent::ReviveOffers => self.handle_revive_offers(ctx),
            SchedulerEvent::PeerClosed { peer } => self.handle_peer_closed(ctx, &driver, peer),
            SchedulerEvent::Tick => self.handle_tick(ctx),
            SchedulerEvent::Shutdown => self.finalize(),
        }
    }

    async fn stop(self, _ctx: &mut ActorContext<Self>) {
        info!(
            "scheduler process for framework \"{}\" has stopped",
            self.framework_name
        );
    }
}
