//! I/O: local layout, external tool execution and remote store access.

mod completion;
mod layout;
mod process;
mod store;

pub use completion::{CompletionChecker, CompletionStatus};
pub use layout::{raw_root, ShardPaths};
pub use process::{Invocation, ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use store::{create_remote_store, create_store_for_uri, parse_s3_uri};
