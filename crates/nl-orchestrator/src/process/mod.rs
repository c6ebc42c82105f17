//! Remote process supervision
//!
//! Turns the raw output chunks of a remote command into two independent
//! line streams and tracks how the command ended.

mod lines;
mod supervisor;

pub use lines::LineSplitter;
pub use supervisor::{start, LineStream, ProcessHandle};
