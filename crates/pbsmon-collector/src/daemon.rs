use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use pbsmon_client::SchedulerClient;
use pbsmon_core::PassKind;
use pbsmon_store::Store;

use crate::{now_unix, Collector, RetentionManager, SchedulerContext};

const TICK: Duration = Duration::from_secs(1);

/// The long-running collection loop. Each tick runs every due pass in
/// order, then the retention sweep. Passes never overlap; a stop signal
/// is honored between passes so an in-flight transaction always
/// completes or rolls back cleanly.
pub async fn run_daemon<C, S>(
    collector: Collector<C, S>,
    mut scheduler: SchedulerContext,
    mut retention: RetentionManager,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    C: SchedulerClient,
    S: Store,
{
    info!("collection daemon started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK) => {}
            changed = shutdown.changed() => {
                // A dropped sender counts as a stop request.
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        for pass in scheduler.due(now_unix()) {
            if *shutdown.borrow() {
                break;
            }
            let now = now_unix();
            let result = match pass {
                PassKind::Entities(kind) => collector.collect(kind, now).await,
                PassKind::Utilization => collector.collect_utilization(now).await,
            };
            match result {
                // Failed passes are already recorded in the audit trail;
                // the loop keeps its cadence either way.
                Ok(_) => scheduler.mark_ran(pass, now),
                Err(e) => {
                    warn!(pass = pass.as_str(), error = %e, "collection pass errored");
                    scheduler.mark_ran(pass, now);
                }
            }
        }

        if let Err(e) = retention.maybe_run(now_unix(), collector.store()) {
            warn!(error = %e, "retention sweep errored");
        }
    }
    info!("collection daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionConfig, PolicyConfig, RetentionConfig};
    use async_trait::async_trait;
    use pbsmon_core::{EntityKind, ObservedRecord};
    use pbsmon_store::MemoryStore;

    struct IdleClient;

    #[async_trait]
    impl SchedulerClient for IdleClient {
        async fn fetch_current(&self, _kind: EntityKind) -> pbsmon_client::Result<Vec<ObservedRecord>> {
            Ok(Vec::new())
        }

        async fn fetch_recently_terminal(&self) -> pbsmon_client::Result<Vec<ObservedRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn daemon_stops_on_signal() {
        let collector = Collector::new(IdleClient, MemoryStore::new(), PolicyConfig::default());
        let scheduler = SchedulerContext::new(&CollectionConfig::default());
        let retention = RetentionManager::new(RetentionConfig::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_daemon(collector, scheduler, retention, stop_rx));
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
    }
}
