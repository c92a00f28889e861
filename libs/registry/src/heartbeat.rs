//! Instance registrations that stay alive until closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Instance, RegistryError};

/// A registration that can be refreshed and released.
#[async_trait]
pub trait Lease: Send + Sync + 'static {
    async fn refresh(&self) -> Result<(), RegistryError>;
    async fn release(&self) -> Result<(), RegistryError>;
}

/// Keeps an instance registered.
///
/// `close()` deregisters and waits for the registry to confirm. Dropping the
/// heartbeater also deregisters, in the background.
pub struct Heartbeater {
    service: String,
    instance: Instance,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), RegistryError>>,
}

impl Heartbeater {
    /// Starts refreshing `lease` every `interval`. With no interval the lease
    /// is only released.
    pub fn start(
        service: &str,
        instance: Instance,
        lease: Arc<dyn Lease>,
        interval: Option<Duration>,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let svc = service.to_string();
        let id = instance.id.clone();

        let task = tokio::spawn(async move {
            loop {
                let tick = async {
                    match interval {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    // Err means the heartbeater was dropped
                    res = stopped.changed() => {
                        if res.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    _ = tick => {
                        if let Err(e) = lease.refresh().await {
                            warn!(service = %svc, instance_id = %id, error = %e, "Registry heartbeat failed");
                        }
                    }
                }
            }
            debug!(service = %svc, instance_id = %id, "Deregistering instance");
            lease.release().await
        });

        Self {
            service: service.to_string(),
            instance,
            stop,
            task,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Deregisters the instance.
    pub async fn close(self) -> Result<(), RegistryError> {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(RegistryError::Unavailable(format!(
                "heartbeat task failed: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingLease {
        refreshes: AtomicU32,
        releases: AtomicU32,
    }

    #[async_trait]
    impl Lease for CountingLease {
        async fn refresh(&self) -> Result<(), RegistryError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&self) -> Result<(), RegistryError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_until_closed() {
        let lease = Arc::new(CountingLease::default());
        let hb = Heartbeater::start(
            "web",
            Instance::new("127.0.0.1:80"),
            lease.clone(),
            Some(Duration::from_secs(5)),
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        hb.close().await.unwrap();

        assert_eq!(lease.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(lease.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let lease = Arc::new(CountingLease::default());
        let hb = Heartbeater::start("web", Instance::new("127.0.0.1:80"), lease.clone(), None);
        drop(hb);

        for _ in 0..100 {
            if lease.releases.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lease was not released after drop");
    }
}
