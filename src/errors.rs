use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Import of '{module}' is not allowed{}", reason_suffix(.reason))]
    ImportViolation {
        module: String,
        reason: Option<String>,
    },

    #[error("Cannot {operation} path '{path}': outside allowed directories")]
    PathViolation { path: String, operation: String },

    #[error("Execution exceeded timeout of {seconds} seconds")]
    Timeout { seconds: f64 },

    #[error("Memory limit exceeded (limit: {limit_bytes} bytes)")]
    MemoryLimitExceeded { limit_bytes: u64 },

    #[error("{type_name}: {message}")]
    RuntimeError { type_name: String, message: String },

    #[error("Process exited with code {0}")]
    ProcessExitCode(i32),

    #[error("Process killed by signal")]
    ProcessKilled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl SandboxError {
    /// Stable discriminator used when results are rendered as JSON.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::PythonNotFound => "python_not_found",
            SandboxError::SyntaxError(_) => "syntax_error",
            SandboxError::ImportViolation { .. } => "import_violation",
            SandboxError::PathViolation { .. } => "path_violation",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::MemoryLimitExceeded { .. } => "memory_limit",
            SandboxError::RuntimeError { .. } => "runtime_error",
            SandboxError::ProcessExitCode(_) => "process_exit",
            SandboxError::ProcessKilled => "process_killed",
            SandboxError::IoError(_) => "io_error",
            SandboxError::JsonError(_) => "json_error",
            SandboxError::InternalError(_) => "internal_error",
        }
    }

    /// True for failures caused by a sandbox policy rather than by the code itself.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            SandboxError::ImportViolation { .. }
                | SandboxError::PathViolation { .. }
                | SandboxError::Timeout { .. }
                | SandboxError::MemoryLimitExceeded { .. }
        )
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {}", reason),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_violation_message() {
        let err = SandboxError::ImportViolation {
            module: "os".to_string(),
            reason: Some("Module is explicitly blocked".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Import of 'os' is not allowed: Module is explicitly blocked"
        );

        let bare = SandboxError::ImportViolation {
            module: "os".to_string(),
            reason: None,
        };
        assert_eq!(bare.to_string(), "Import of 'os' is not allowed");
    }

    #[test]
    fn test_runtime_error_message() {
        let err = SandboxError::RuntimeError {
            type_name: "ValueError".to_string(),
            message: "test error".to_string(),
        };
        assert_eq!(err.to_string(), "ValueError: test error");
        assert_eq!(err.kind(), "runtime_error");
        assert!(!err.is_violation());
    }

    #[test]
    fn test_violation_kinds() {
        let err = SandboxError::PathViolation {
            path: "/etc/passwd".to_string(),
            operation: "read".to_string(),
        };
        assert!(err.is_violation());
        assert_eq!(
            err.to_string(),
            "Cannot read path '/etc/passwd': outside allowed directories"
        );
        assert!(SandboxError::Timeout { seconds: 0.5 }.is_violation());
    }
}
