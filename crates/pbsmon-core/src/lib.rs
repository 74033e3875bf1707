pub mod backoff;
pub mod event;
pub mod kind;
pub mod merge;
pub mod reconcile;
pub mod record;
pub mod state;
pub mod utilization;

pub use backoff::*;
pub use event::*;
pub use kind::*;
pub use merge::*;
pub use reconcile::*;
pub use record::*;
pub use state::*;
pub use utilization::*;
