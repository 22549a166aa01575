use async_trait::async_trait;
use keel_server::transport::Endpoint;
use log::warn;
use tokio::sync::mpsc;

use crate::error::{SchedulerError, SchedulerResult};

const COORDINATED_SCHEME: &str = "coord://";

/// The master address accepted by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterUrl {
    /// A fixed master endpoint.
    Endpoint(Endpoint),
    /// A coordination-service reference; the current leader is discovered
    /// and tracked at runtime.
    Coordinated(String),
    /// An in-process cluster spawned on demand.
    Local { quiet: bool },
}

impl MasterUrl {
    pub fn parse(s: &str) -> SchedulerResult<Self> {
        match s {
            "local" => Ok(MasterUrl::Local { quiet: false }),
            "localquiet" => Ok(MasterUrl::Local { quiet: true }),
            s if s.starts_with(COORDINATED_SCHEME) => {
                let servers = &s[COORDINATED_SCHEME.len()..];
                if servers.is_empty() {
                    return Err(SchedulerError::InvalidArgument(format!(
                        "empty coordination server list: {s}"
                    )));
                }
                Ok(MasterUrl::Coordinated(servers.to_string()))
            }
            s => Ok(MasterUrl::Endpoint(s.parse().map_err(|_| {
                SchedulerError::InvalidArgument(format!("invalid master address: {s}"))
            })?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterEvent {
    Detected { epoch: String, master: Endpoint },
    Lost,
}

/// Emits master changes to its subscriber.
/// `next` pends while nothing has changed; `None` means the detector has
/// shut down and no further events will follow.
#[async_trait]
pub trait MasterDetector: Send + 'static {
    async fn next(&mut self) -> Option<MasterEvent>;
}

/// Detector for a fixed master address: announces it once and never again.
pub struct StaticDetector {
    master: Option<Endpoint>,
}

impl StaticDetector {
    pub fn new(master: Endpoint) -> Self {
        Self {
            master: Some(master),
        }
    }
}

#[async_trait]
impl MasterDetector for StaticDetector {
    async fn next(&mut self) -> Option<MasterEvent> {
        match self.master.take() {
            Some(master) => Some(MasterEvent::Detected {
                epoch: "0".to_string(),
                master,
            }),
            None => std::future::pending().await,
        }
    }
}

/// A leadership observation from the coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChange {
    /// Monotonically non-decreasing leadership term.
    pub epoch: String,
    /// The current leader, or `None` when leadership is vacant.
    pub leader: Option<Endpoint>,
}

/// The coordination-service client surface the coordinated detector
/// consumes. The client itself lives outside this crate; tests and
/// embedders can use [ChannelLeaderWatch].
#[async_trait]
pub trait LeaderWatch: Send + 'static {
    async fn changed(&mut self) -> Option<LeaderChange>;
}

pub struct ChannelLeaderWatch {
    receiver: mpsc::UnboundedReceiver<LeaderChange>,
}

impl ChannelLeaderWatch {
    pub fn channel() -> (mpsc::UnboundedSender<LeaderChange>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { receiver: rx })
    }
}

#[async_trait]
impl LeaderWatch for ChannelLeaderWatch {
    async fn changed(&mut self) -> Option<LeaderChange> {
        self.receiver.recv().await
    }
}

/// Detector over a coordination service.
///
/// Enforces the output discipline the scheduler relies on: epochs never go
/// backwards (stale observations are discarded) and an unchanged leader is
/// not announced twice.
pub struct CoordinatedDetector {
    watch: Box<dyn LeaderWatch>,
    last_epoch: Option<String>,
    last_leader: Option<Endpoint>,
}

impl CoordinatedDetector {
    pub fn new(watch: Box<dyn LeaderWatch>) -> Self {
        Self {
            watch,
            last_epoch: None,
            last_leader: None,
        }
    }
}

#[async_trait]
impl MasterDetector for CoordinatedDetector {
    async fn next(&mut self) -> Option<MasterEvent> {
        loop {
            let change = self.watch.changed().await?;
            if let Some(last) = &self.last_epoch {
                if change.epoch.as_str() < last.as_str() {
                    warn!(
                        "discarding leadership observation with stale epoch {} (last seen {})",
                        change.epoch, last
                    );
                    continue;
                }
            }
            match change.leader {
                Some(leader) => {
                    if self.last_leader.as_ref() == Some(&leader)
                        && self.last_epoch.as_deref() == Some(change.epoch.as_str())
                    {
                        continue;
                    }
                    self.last_epoch = Some(change.epoch.clone());
                    self.last_leader = Some(leader.clone());
                    return Some(MasterEvent::Detected {
                        epoch: change.epoch,
                        master: leader,
                    });
                }
                None => {
                    self.last_epoch = Some(change.epoch);
                    self.last_leader = None;
                    return Some(MasterEvent::Lost);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_master_url_parsing() {
        assert_eq!(
            MasterUrl::parse("local").unwrap(),
            MasterUrl::Local { quiet: false }
        );
        assert_eq!(
            MasterUrl::parse("localquiet").unwrap(),
            MasterUrl::Local { quiet: true }
        );
        assert_eq!(
            MasterUrl::parse("coord://zk1:2181,zk2:2181").unwrap(),
            MasterUrl::Coordinated("zk1:2181,zk2:2181".to_string())
        );
        assert_eq!(
            MasterUrl::parse("10.0.0.1:5050").unwrap(),
            MasterUrl::Endpoint(Endpoint::anonymous("10.0.0.1", 5050))
        );
        assert!(MasterUrl::parse("coord://").is_err());
        assert!(MasterUrl::parse("not a master").is_err());
    }

    #[tokio::test]
    async fn test_static_detector_emits_once() {
        let master = Endpoint::anonymous("10.0.0.1", 5050);
        let mut detector = StaticDetector::new(master.clone());
        assert_eq!(
            detector.next().await,
            Some(MasterEvent::Detected {
                epoch: "0".to_string(),
                master,
            })
        );
        let second = tokio::time::timeout(Duration::from_millis(50), detector.next()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_coordinated_detector_discipline() {
        let (tx, watch) = ChannelLeaderWatch::channel();
        let mut detector = CoordinatedDetector::new(Box::new(watch));

        let first = Endpoint::anonymous("10.0.0.1", 5050);
        let second = Endpoint::anonymous("10.0.0.2", 5050);

        tx.send(LeaderChange {
            epoch: "3".to_string(),
            leader: Some(first.clone()),
        })
        .unwrap();
        // Stale epoch: discarded.
        tx.send(LeaderChange {
            epoch: "2".to_string(),
            leader: Some(second.clone()),
        })
        .unwrap();
        // Identical observation: suppressed.
        tx.send(LeaderChange {
            epoch: "3".to_string(),
            leader: Some(first.clone()),
        })
        .unwrap();
        tx.send(LeaderChange {
            epoch: "4".to_string(),
            leader: Some(second.clone()),
        })
        .unwrap();
        tx.send(LeaderChange {
            epoch: "5".to_string(),
            leader: None,
        })
        .unwrap();

        assert_eq!(
            detector.next().await,
            Some(MasterEvent::Detected {
                epoch: "3".to_string(),
                master: first,
            })
        );
        assert_eq!(
            detector.next().await,
            Some(MasterEvent::Detected {
                epoch: "4".to_string(),
                master: second,
            })
        );
        assert_eq!(detector.next().await, Some(MasterEvent::Lost));

        drop(tx);
        assert_eq!(detector.next().await, None);
    }
}
