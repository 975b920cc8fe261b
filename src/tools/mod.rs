//! 工具层：调用语法解析、允许列表注册表、执行器与内置工具

pub mod diagnostics;
pub mod executor;
pub mod filesystem;
pub mod grammar;
pub mod profile;
pub mod registry;

pub use diagnostics::{EchoTool, SystemStatusTool};
pub use executor::{ToolExecutor, ToolResult};
pub use filesystem::{ListFilesTool, ReadFileTool, SafeFs, WriteFileTool};
pub use grammar::{extract_tool_calls, Extraction, Literal, ParseErrorKind, ToolCall, ToolParseError, TOOL_FENCE};
pub use profile::{GetProfileTool, ProfileStore, UpdateFeelingTool, UpdateProfileTool, UserProfile};
pub use registry::{Tool, ToolRegistry};
