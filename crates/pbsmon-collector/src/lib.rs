pub mod collector;
pub mod config;
pub mod daemon;
pub mod retention;
pub mod scheduler;

pub use collector::*;
pub use config::*;
pub use daemon::*;
pub use retention::*;
pub use scheduler::*;

/// Wall clock in unix seconds. Collection logic takes timestamps as
/// arguments; only the daemon shell reads the clock.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
