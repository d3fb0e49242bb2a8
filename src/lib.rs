pub mod blob;
pub mod cas;
pub mod client;
pub mod command;
pub mod config;
pub mod constants;
pub mod digest;
pub mod error;
pub mod executor;
pub mod fake;
pub mod logging;
pub mod remote_exec;
pub mod transport;
pub mod tree;

pub use blob::Blob;
pub use client::Client;
pub use command::{Command, CommandResult, ExecutionOptions, OutputRef, ResultStatus};
pub use config::{CasConfig, ClientConfig};
pub use digest::Digest;
pub use error::{MemoExecError, Result};
pub use tree::{build_tree, InputSpec, InputTree, Node, VirtualInput};
