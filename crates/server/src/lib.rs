//! Server process: startup wiring, scheduler lifecycle and the administrative
//! operations the HTTP boundary calls.

pub mod admin;
pub mod app;

pub use admin::{AdminError, AdminService, JobStatusView};
pub use app::{Backends, Services, StartupError};
