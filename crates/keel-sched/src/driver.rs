use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use keel_server::actor::ActorHandle;
use keel_server::transport::TcpTransport;
use log::{error, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::{
    ExecutorInfo, FrameworkMessage, Message, Params, SlaveOffer, TaskDescriptor, TaskStatus,
};
use crate::detector::{CoordinatedDetector, LeaderWatch, MasterDetector, MasterUrl, StaticDetector};
use crate::error::{SchedulerError, SchedulerResult};
use crate::id::{FrameworkId, OfferId, SlaveId, TaskId};
use crate::local::{LocalCluster, LocalClusterOptions};
use crate::scheduler::{SchedulerEvent, SchedulerOptions, SchedulerProcess, SchedulerProcessOptions};
use crate::validation;

/// User scheduling logic.
///
/// Callbacks run on the scheduler's event loop, one at a time and in the
/// order their triggering messages arrived. A callback that blocks stalls
/// the scheduler, so long work belongs on the user's own tasks. Callbacks
/// may call back into the driver (including [SchedulerDriver::stop])
/// without deadlocking.
pub trait Scheduler: Send + Sync + 'static {
    fn framework_name(&self, _driver: &SchedulerDriver) -> String {
        "unnamed framework".to_string()
    }

    fn executor_info(&self, _driver: &SchedulerDriver) -> ExecutorInfo {
        ExecutorInfo::default()
    }

    fn registered(&self, _driver: &SchedulerDriver, _framework_id: &FrameworkId) {}

    fn resource_offer(&self, _driver: &SchedulerDriver, _offer_id: &OfferId, _slots: &[SlaveOffer]) {
    }

    fn offer_rescinded(&self, _driver: &SchedulerDriver, _offer_id: &OfferId) {}

    fn status_update(&self, _driver: &SchedulerDriver, _status: &TaskStatus) {}

    fn framework_message(&self, _driver: &SchedulerDriver, _message: &FrameworkMessage) {}

    fn slave_lost(&self, _driver: &SchedulerDriver, _slave_id: &SlaveId) {}

    fn error(&self, driver: &SchedulerDriver, code: i32, message: &str) {
        error!("scheduler error: {message} (error code: {code})");
        let _ = driver.stop();
    }
}

/// Driver for user scheduling logic: owns the scheduler's lifecycle and
/// forwards commands to the scheduler event loop.
///
/// The driver is a cheap-clone handle; clones share the same scheduler.
/// Command methods never block and never take a lock across user code, so
/// callbacks can re-enter the driver freely.
#[derive(Clone)]
pub struct SchedulerDriver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    scheduler: Arc<dyn Scheduler>,
    master: String,
    options: Mutex<SchedulerOptions>,
    leader_watch: Mutex<Option<Box<dyn LeaderWatch>>>,
    started: AtomicBool,
    running: AtomicBool,
    terminate: AtomicBool,
    events: OnceLock<mpsc::UnboundedSender<SchedulerEvent>>,
    handle: OnceLock<ActorHandle<SchedulerProcess>>,
    local: Mutex<Option<LocalCluster>>,
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        // Best-effort shutdown when the last handle goes away without an
        // explicit stop, so the event loop does not outlive the driver.
        if self.running.swap(false, Ordering::SeqCst) {
            self.terminate.store(true, Ordering::SeqCst);
            if let Some(events) = self.events.get() {
                let _ = events.send(SchedulerEvent::Shutdown);
            }
        }
        if let Some(local) = self.local.lock().take() {
            local.shutdown();
        }
    }
}

impl SchedulerDriver {
    /// Create a driver for the given scheduler and master address.
    ///
    /// The master address is one of `host:port` (or `id@host:port`) for a
    /// fixed master, `coord://<server-list>` for coordination-service
    /// discovery, or `local`/`localquiet` for an in-process cluster.
    pub fn new(scheduler: Arc<dyn Scheduler>, master: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                scheduler,
                master: master.into(),
                options: Mutex::new(SchedulerOptions::default()),
                leader_watch: Mutex::new(None),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                terminate: AtomicBool::new(false),
                events: OnceLock::new(),
                handle: OnceLock::new(),
                local: Mutex::new(None),
            }),
        }
    }

    /// Replace the default options, e.g. with
    /// `SchedulerOptions::try_from(&AppConfig::load()?)`.
    /// Only meaningful before [SchedulerDriver::start].
    pub fn with_options(self, options: SchedulerOptions) -> Self {
        *self.inner.options.lock() = options;
        self
    }

    /// Install the coordination-service client used to track the master.
    /// Required when the master address is a `coord://` reference.
    pub fn with_leader_watch(self, watch: Box<dyn LeaderWatch>) -> Self {
        *self.inner.leader_watch.lock() = Some(watch);
        self
    }

    /// Start the scheduler. The lifecycle is single-shot: a driver that has
    /// been started (and possibly stopped) cannot be started again.
    pub async fn start(&self) -> SchedulerResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let out = self.start_inner().await;
        if out.is_err() {
            self.inner.started.store(false, Ordering::SeqCst);
        }
        out
    }

    async fn start_inner(&self) -> SchedulerResult<()> {
        let (detector, coordinated): (Box<dyn MasterDetector>, bool) =
            match MasterUrl::parse(&self.inner.master)? {
                MasterUrl::Endpoint(master) => (Box::new(StaticDetector::new(master)), false),
                MasterUrl::Coordinated(servers) => {
                    let watch = self.inner.leader_watch.lock().take().ok_or_else(|| {
                        SchedulerError::InvalidArgument(format!(
                            "no coordination client configured for coord://{servers}"
                        ))
                    })?;
                    info!("tracking the master through the coordination service at {servers}");
                    (Box::new(CoordinatedDetector::new(watch)), true)
                }
                MasterUrl::Local { quiet } => {
                    let cluster = LocalCluster::start(LocalClusterOptions {
                        quiet,
                        ..Default::default()
                    })
                    .await?;
                    let master = cluster.master().clone();
                    *self.inner.local.lock() = Some(cluster);
                    (Box::new(StaticDetector::new(master)), false)
                }
            };

        let options = self.inner.options.lock().clone();
        let framework_name = self.inner.scheduler.framework_name(self);
        let executor = self.inner.scheduler.executor_info(self);
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());

        let (transport, mailbox) =
            TcpTransport::<Message>::bind("scheduler", &options.listen_host, options.listen_port)
                .await?;

        let handle = ActorHandle::<SchedulerProcess>::new(SchedulerProcessOptions {
            options,
            framework_name,
            user,
            executor,
            coordinated,
            scheduler: Arc::clone(&self.inner.scheduler),
            driver: self.downgrade(),
            transport: Arc::new(transport),
            mailbox,
            detector,
        });
        let _ = self.inner.events.set(handle.sender());
        let _ = self.inner.handle.set(handle);
        self.inner.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the scheduler: unregister from the master (best effort) and
    /// shut down the event loop. No user callback fires after this returns.
    pub fn stop(&self) -> SchedulerResult<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        self.inner.terminate.store(true, Ordering::SeqCst);
        if let Some(events) = self.inner.events.get() {
            let _ = events.send(SchedulerEvent::Shutdown);
        }
        Ok(())
    }

    /// Wait until the scheduler has stopped. Returns immediately when the
    /// driver never ran.
    pub async fn join(&self) -> SchedulerResult<()> {
        if let Some(handle) = self.inner.handle.get() {
            handle.clone().wait_for_stop().await;
        }
        Ok(())
    }

    pub async fn run(&self) -> SchedulerResult<()> {
        self.start().await?;
        self.join().await
    }

    pub fn kill_task(&self, task_id: TaskId) -> SchedulerResult<()> {
        self.post(SchedulerEvent::KillTask { task_id })
    }

    /// Launch tasks against an offer (an empty task list declines it).
    /// Task descriptors are validated before anything is sent.
    pub fn reply_to_offer(
        &self,
        offer_id: OfferId,
        tasks: Vec<TaskDescriptor>,
        params: Params,
    ) -> SchedulerResult<()> {
        for task in &tasks {
            validation::validate_task(task)?;
        }
        self.post(SchedulerEvent::ReplyToOffer {
            offer_id,
            tasks,
            params,
        })
    }

    pub fn revive_offers(&self) -> SchedulerResult<()> {
        self.post(SchedulerEvent::ReviveOffers)
    }

    /// Send a message directly to the slave it addresses. Messages to
    /// slaves the framework never launched on are dropped silently.
    pub fn send_framework_message(&self, message: FrameworkMessage) -> SchedulerResult<()> {
        self.post(SchedulerEvent::SendFrameworkMessage { message })
    }

    fn post(&self, event: SchedulerEvent) -> SchedulerResult<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        let events = self.inner.events.get().ok_or(SchedulerError::NotRunning)?;
        events.send(event).map_err(|_| SchedulerError::NotRunning)
    }

    pub(crate) fn attach(&self, sender: mpsc::UnboundedSender<SchedulerEvent>) {
        let _ = self.inner.events.set(sender);
    }

    pub(crate) fn terminating(&self) -> bool {
        self.inner.terminate.load(Ordering::SeqCst)
    }

    pub(crate) fn downgrade(&self) -> WeakSchedulerDriver {
        WeakSchedulerDriver {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// The scheduler actor's reference to the driver. It is weak so that the
/// actor does not keep the driver alive: when the last user handle goes
/// away, the actor observes it and winds down.
#[derive(Clone)]
pub(crate) struct WeakSchedulerDriver {
    inner: Weak<DriverInner>,
}

impl WeakSchedulerDriver {
    pub(crate) fn upgrade(&self) -> Option<SchedulerDriver> {
        self.inner.upgrade().map(|inner| SchedulerDriver { inner })
    }
}
