pub mod data;
pub mod hep;
pub mod session;
pub mod supervisor;

pub use session::{Session, SessionEvent, SessionState, StateDump};
pub use supervisor::Supervisor;
