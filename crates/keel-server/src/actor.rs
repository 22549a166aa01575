use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

#[async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options: Send;

    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    async fn start(&mut self, ctx: &mut ActorContext<Self>);
    /// Process one message and return the next action.
    /// This method must not block the thread, otherwise the actor event loop
    /// would stall since all messages are processed sequentially.
    /// Async work belongs in tasks spawned via [ActorContext::spawn].
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    async fn stop(self, ctx: &mut ActorContext<Self>);
}

pub enum ActorAction {
    Continue,
    Stop,
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// Tasks spawned by the actor while processing messages.
    /// All of them are aborted when the context is dropped.
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Post a message to the actor's own mailbox.
    /// This never blocks, so it is safe to call from within [Actor::receive].
    pub fn send(&mut self, message: T::Message) {
        if self.handle.send(message).is_err() {
            warn!("failed to post message to the {} mailbox", T::name());
        }
    }

    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) -> AbortHandle {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(message);
        })
    }

    /// Spawn a task and save the handle in the context.
    pub fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Join tasks that have completed and log unexpected failures.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("task spawned by {} failed: {e}", T::name());
                }
            }
        }
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::UnboundedSender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let handle = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        // The actor runs detached; the event loop task stops by itself
        // when the stop action is taken or all handles are dropped.
        tokio::spawn(runner.run());
        handle
    }

    /// Send a message to the actor mailbox.
    /// The mailbox is unbounded, so the send never waits; it only fails
    /// when the actor has stopped.
    pub fn send(
        &self,
        message: T::Message,
    ) -> Result<(), mpsc::error::SendError<T::Message>> {
        self.sender.send(message)
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<T::Message> {
        self.sender.clone()
    }

    pub async fn wait_for_stop(mut self) {
        // The receiver error is ignored since the sender must have been
        // dropped in this case, which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::UnboundedReceiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(self) {
        let ActorRunner {
            mut actor,
            mut ctx,
            mut receiver,
            stopped,
        } = self;
        actor.start(&mut ctx).await;
        while let Some(message) = receiver.recv().await {
            match actor.receive(&mut ctx, message) {
                ActorAction::Continue => {}
                ActorAction::Stop => break,
            }
            ctx.reap();
        }
        actor.stop(&mut ctx).await;
        let _ = stopped.send(true);
    }
}
