pub mod coordinator;
pub mod session;

pub use coordinator::{PendingRun, RunCoordinator, RunReport};
pub use session::{
    MessageView, SessionCommand, SessionHandle, SessionView, ToolCallView, spawn_session,
};
