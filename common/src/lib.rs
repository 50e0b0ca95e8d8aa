pub mod types;
pub mod timebase;
pub mod error;

pub use types::*;
pub use timebase::*;
pub use error::*;
