// Library exports for the Warden process supervisor

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod process;
pub mod signals;

pub use config::{ProcessSpec, SupervisorSettings, WardenConfig};
pub use error::{Result, WardenError};
pub use events::{ChannelReporter, Reporter, SupervisorEvent, TracingReporter};
pub use process::{ProcessRecord, ProcessState, Supervisor};
pub use signals::{ShutdownReport, ShutdownSignal, SignalRouter};
