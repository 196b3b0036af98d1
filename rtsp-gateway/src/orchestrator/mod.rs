//! Stream lifecycle orchestration.
//!
//! Control channel → [`CommandRouter`] → [`StreamRegistry`] → worker mailbox
//! → state transition → status snapshot → [`StatusPublisher`] → control channel.

pub mod actor;
pub mod events;
mod listener;
mod publisher;
mod router;
mod service;

pub use actor::{ShutdownReport, StreamRegistry, WorkerSettings};
pub use events::StreamEvent;
pub use listener::CommandListener;
pub use publisher::{OverallStatus, StatusPublisher, StatusReporter};
pub use router::{CommandRouter, RouteOutcome};
pub use service::Orchestrator;
