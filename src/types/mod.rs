mod action;
mod directory;
mod operation;
mod result;

pub use action::{Action, Command, EnvironmentVariable, ExecuteRequest};
pub use directory::{validate_entry_name, Directory, DirectoryNode, FileNode, Tree};
pub use operation::{Operation, OperationResult, Stage};
pub use result::{ActionResult, ExecuteResponse, OutputDirectory, OutputFile};
