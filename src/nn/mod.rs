//! Loss modules, their parameters and initialisation

pub mod init;
pub mod losses;
pub mod parameter;

pub use losses::*;
pub use parameter::{Module, Parameter, ParameterId, StateDict};
