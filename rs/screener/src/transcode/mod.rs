mod command;
mod fragment;
pub mod readiness;
mod session;
mod supervisor;

pub use command::*;
pub use fragment::*;
pub use session::*;
pub use supervisor::*;
