//! A minimal framework against the in-process cluster: take the first
//! offered slot, launch a task, kill it once it runs, then shut down.
//!
//! Run with `cargo run --example local_framework`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use env_logger::Env;
use keel_sched::{
    FrameworkId, OfferId, Params, Scheduler, SchedulerDriver, SlaveOffer, TaskDescriptor,
    TaskState, TaskStatus,
};
use log::info;

struct DemoScheduler {
    launched: AtomicBool,
}

impl Scheduler for DemoScheduler {
    fn framework_name(&self, _driver: &SchedulerDriver) -> String {
        "demo".to_string()
    }

    fn registered(&self, _driver: &SchedulerDriver, framework_id: &FrameworkId) {
        info!("registered as {framework_id}");
    }

    fn resource_offer(&self, driver: &SchedulerDriver, offer_id: &OfferId, slots: &[SlaveOffer]) {
        let Some(slot) = slots.first() else {
            return;
        };
        if self.launched.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("launching a task on {}", slot.slave_id);
        let task = TaskDescriptor {
            task_id: 1.into(),
            slave_id: slot.slave_id.clone(),
            name: "demo-task".to_string(),
            params: Params::new(),
            data: Vec::new(),
        };
        let _ = driver.reply_to_offer(offer_id.clone(), vec![task], Params::new());
    }

    fn status_update(&self, driver: &SchedulerDriver, status: &TaskStatus) {
        info!("task {} is {}", status.task_id, status.state);
        match status.state {
            TaskState::Running => {
                let _ = driver.kill_task(status.task_id);
            }
            TaskState::Killed | TaskState::Finished | TaskState::Failed | TaskState::Lost => {
                let _ = driver.stop();
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let scheduler = Arc::new(DemoScheduler {
        launched: AtomicBool::new(false),
    });
    let driver = SchedulerDriver::new(scheduler, "local");
    driver.run().await?;
    Ok(())
}
