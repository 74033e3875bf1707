pub mod error;
pub mod parse;
pub mod pbs;
pub mod traits;

pub use error::*;
pub use pbs::*;
pub use traits::*;
