// Process module - supervised process lifecycle

pub mod handle;
pub mod launcher;
mod monitor;
pub mod resources;
pub mod restart;
mod supervisor;
pub mod types;

pub use handle::{PollStatus, ProcessHandle, StopOutcome};
pub use launcher::{ChildProcess, OsLauncher, OutputReader, ProcessLauncher};
pub use resources::ResourceSampler;
pub use restart::{RestartDecision, RestartPolicy};
pub use supervisor::{ProcessErrors, Supervisor};
pub use types::{ExitInfo, ProcessRecord, ProcessState, ResourceSnapshot};
