// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod get_sessions_final_turns;
mod list_directory;
mod plan_serial_tasks;
mod read_file;
mod run_shell_command;
mod search_file_content;
mod update_todos;
mod write_file;

pub use get_sessions_final_turns::GetSessionsFinalTurnsTool;
pub use list_directory::ListDirectoryTool;
pub use plan_serial_tasks::PlanSerialTasksTool;
pub use read_file::ReadFileTool;
pub use run_shell_command::RunShellCommandTool;
pub use search_file_content::SearchFileContentTool;
pub use update_todos::UpdateTodosTool;
pub use write_file::WriteFileTool;

use crate::ToolRegistry;

pub fn register_all(registry: &mut ToolRegistry) {
    registry.register(ReadFileTool);
    registry.register(WriteFileTool);
    registry.register(RunShellCommandTool::default());
    registry.register(ListDirectoryTool);
    registry.register(SearchFileContentTool);
    registry.register(GetSessionsFinalTurnsTool);
    registry.register(UpdateTodosTool);
    registry.register(PlanSerialTasksTool);
}
