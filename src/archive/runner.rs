//! Background thread driving periodic archive sweeps.

use super::manager::ArchiveManager;
use crate::cache::ActiveStateCache;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs `ArchiveManager::sweep` on a fixed interval until dropped, and
/// evicts idle active-state cache entries on the same tick.
///
/// A sweep failure is logged and the runner keeps going; the next tick
/// retries from scratch. Dropping the runner stops the thread without
/// waiting for the next tick.
pub struct ArchiveRunner {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ArchiveRunner {
    pub fn spawn(
        manager: Arc<ArchiveManager>,
        cache: Arc<ActiveStateCache>,
        interval: Duration,
    ) -> Self {
        let (shutdown, stop) = bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("statevault-archiver".into())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let evicted = cache.evict_idle();
                            if evicted > 0 {
                                debug!(evicted, "evicted idle cache entries");
                            }
                            match manager.sweep() {
                                Ok(report) if report.workflows_swept > 0 => {
                                    debug!(
                                        swept = report.workflows_swept,
                                        versions = report.versions_archived,
                                        "archive sweep finished"
                                    );
                                }
                                Ok(_) => {}
                                Err(err) => warn!(error = %err, "archive sweep failed"),
                            }
                        },
                        recv(stop) -> _ => break,
                    }
                }
            })
            .ok();
        Self { shutdown, handle }
    }
}

impl Drop for ArchiveRunner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
