//! Code-mode meta-tools.
//!
//! A code-mode client executes a sandboxed script that itself calls tools.
//! The meta-tools route to the client flagged `is_code_mode_client`; the
//! registry enforces that `listToolFiles` and `readToolFile` are only ever
//! direct calls, and that tools invoked from inside `executeToolCode` pass
//! the stricter auto-execute filter.

/// Run a script in the code-mode sandbox.
pub const EXECUTE_TOOL_CODE: &str = "executeToolCode";
/// List the generated tool wrapper files available to scripts.
pub const LIST_TOOL_FILES: &str = "listToolFiles";
/// Read one generated tool wrapper file.
pub const READ_TOOL_FILE: &str = "readToolFile";

/// Whether a tool name is one of the code-mode meta-tools.
pub fn is_meta_tool(name: &str) -> bool {
    matches!(name, EXECUTE_TOOL_CODE | LIST_TOOL_FILES | READ_TOOL_FILE)
}

/// Meta-tools that must never be invoked from inside `executeToolCode`.
pub fn is_code_mode_only(name: &str) -> bool {
    matches!(name, LIST_TOOL_FILES | READ_TOOL_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_tool_classification() {
        assert!(is_meta_tool(EXECUTE_TOOL_CODE));
        assert!(is_meta_tool(LIST_TOOL_FILES));
        assert!(is_meta_tool(READ_TOOL_FILE));
        assert!(!is_meta_tool("read_file"));

        assert!(is_code_mode_only(LIST_TOOL_FILES));
        assert!(!is_code_mode_only(EXECUTE_TOOL_CODE));
    }
}
