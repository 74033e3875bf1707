use async_trait::async_trait;

use pbsmon_core::{EntityKind, ObservedRecord};

use crate::Result;

/// Source of scheduler observations. The production implementation shells
/// out to the PBS commands; tests substitute canned batches.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Everything the scheduler currently reports for a kind.
    async fn fetch_current(&self, kind: EntityKind) -> Result<Vec<ObservedRecord>>;

    /// Jobs from the scheduler's finished-job history. Captures terminal
    /// states for jobs that left the live view between polls.
    async fn fetch_recently_terminal(&self) -> Result<Vec<ObservedRecord>>;
}
