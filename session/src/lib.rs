//! Process-wide session with the AMD kernel fusion driver (`/dev/kfd`).
//!
//! Callers pair [`Session::open`] with [`Session::close`]; the first open
//! brings the driver channel and its supporting subsystems up, the last
//! close tears them down, and a forked child transparently starts over.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod device;
mod error;
pub mod fork;
mod lock;
mod session;
pub mod subsystems;
pub mod topology;

pub use config::RuntimeConfig;
pub use error::ConfigError;
pub use error::ErrorKind;
pub use error::Result;
pub use error::SessionError;
pub use session::OpenStatus;
pub use session::Session;
pub use session::SessionBuilder;
