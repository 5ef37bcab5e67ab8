pub mod line;
pub mod port;
pub mod proto;

pub use line::LineCodec;
pub use port::{Port, RecvError, SendError};
pub use proto::Command;
