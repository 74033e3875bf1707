pub mod error;
pub mod memory;
pub mod query;
pub mod traits;

pub use error::*;
pub use memory::*;
pub use query::*;
pub use traits::*;

/// Schema generation both backends implement. The SQLite backend refuses
/// to open databases at any other version.
pub const SCHEMA_VERSION: i32 = 1;
