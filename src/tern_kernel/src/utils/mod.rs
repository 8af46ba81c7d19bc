//! Internal utilities
mod init;
#[macro_use]
pub mod pool;
pub mod intrusive_list;
pub use self::init::*;
