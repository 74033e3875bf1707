use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use pbsmon_core::{EntityKind, ObservedRecord};

use crate::{parse, ClientError, Result, SchedulerClient};

/// Shells out to the PBS command-line tools and parses their JSON output.
/// Every invocation runs under a hard timeout so one hung scheduler
/// command cannot stall the collection loop.
pub struct PbsClient {
    timeout: Duration,
}

impl PbsClient {
    pub fn new(command_timeout_secs: u64) -> Self {
        Self { timeout: Duration::from_secs(command_timeout_secs) }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(%program, ?args, "running scheduler command");
        let output = tokio::time::timeout(self.timeout, Command::new(program).args(args).output())
            .await
            .map_err(|_| ClientError::Timeout { secs: self.timeout.as_secs() })?
            .map_err(|e| ClientError::Unavailable(format!("{program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::Unavailable(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| ClientError::Parse(format!("{program} output not utf-8: {e}")))
    }
}

#[async_trait]
impl SchedulerClient for PbsClient {
    async fn fetch_current(&self, kind: EntityKind) -> Result<Vec<ObservedRecord>> {
        match kind {
            EntityKind::Job => {
                let text = self.run("qstat", &["-f", "-F", "json"]).await?;
                parse::parse_jobs(&text)
            }
            EntityKind::Queue => {
                let text = self.run("qstat", &["-Q", "-f", "-F", "json"]).await?;
                parse::parse_queues(&text)
            }
            EntityKind::Node => {
                let text = self.run("pbsnodes", &["-a", "-F", "json"]).await?;
                parse::parse_nodes(&text)
            }
        }
    }

    async fn fetch_recently_terminal(&self) -> Result<Vec<ObservedRecord>> {
        let text = self.run("qstat", &["-x", "-f", "-F", "json"]).await?;
        parse::parse_jobs(&text)
    }
}
