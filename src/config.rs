use crate::errors::Result;
use crate::limits::ResourceLimits;
use crate::restrictions::{safe_imports, ImportRestrictions, PathRestrictions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Configuration for a [`crate::PythonSandbox`].
///
/// Every field has a default, so a JSON file may set any subset of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Whitelist of importable modules. When unset, the safe set is used
    /// if `use_safe_imports` is on, otherwise no whitelist applies.
    pub allowed_imports: Option<Vec<String>>,
    pub blocked_imports: Vec<String>,
    pub timeout_seconds: f64,
    pub max_memory_bytes: Option<u64>,
    pub max_output_bytes: usize,
    pub allowed_read_paths: Vec<PathBuf>,
    pub allowed_write_paths: Vec<PathBuf>,
    pub allow_cwd: bool,
    pub working_directory: Option<PathBuf>,
    pub use_safe_imports: bool,
    /// Reject code with invalid syntax before spawning an interpreter
    pub validate_before_exec: bool,
    /// Interpreter to run; `python3` then `python` on PATH when unset
    pub python_path: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            allowed_imports: None,
            blocked_imports: Vec::new(),
            timeout_seconds: limits.timeout_seconds,
            max_memory_bytes: limits.max_memory_bytes,
            max_output_bytes: limits.max_output_bytes,
            allowed_read_paths: Vec::new(),
            allowed_write_paths: Vec::new(),
            allow_cwd: false,
            working_directory: None,
            use_safe_imports: true,
            validate_before_exec: true,
            python_path: None,
        }
    }
}

impl SandboxConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn with_allowed_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_imports = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_blocked_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_imports = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_read_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.allowed_read_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_write_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.allowed_write_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow_cwd(mut self, allow: bool) -> Self {
        self.allow_cwd = allow;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_use_safe_imports(mut self, enabled: bool) -> Self {
        self.use_safe_imports = enabled;
        self
    }

    pub fn with_validate_before_exec(mut self, enabled: bool) -> Self {
        self.validate_before_exec = enabled;
        self
    }

    pub fn with_python_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.python_path = Some(path.into());
        self
    }

    /// Import policy implied by this configuration.
    pub fn import_restrictions(&self) -> ImportRestrictions {
        let allowed: HashSet<String> = match &self.allowed_imports {
            Some(list) if !list.is_empty() => list.iter().cloned().collect(),
            _ if self.use_safe_imports => safe_imports(),
            _ => HashSet::new(),
        };
        let blocked = self.blocked_imports.iter().cloned().collect();
        ImportRestrictions::new(allowed, blocked)
    }

    pub fn path_restrictions(&self) -> PathRestrictions {
        PathRestrictions {
            allowed_read: self.allowed_read_paths.clone(),
            allowed_write: self.allowed_write_paths.clone(),
            allow_cwd: self.allow_cwd,
            working_directory: self.working_directory.clone(),
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout_seconds: self.timeout_seconds,
            max_memory_bytes: self.max_memory_bytes,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.allowed_imports, None);
        assert_eq!(config.timeout_seconds, 30.0);
        assert_eq!(config.max_output_bytes, 1_048_576);
        assert!(config.use_safe_imports);
        assert!(config.validate_before_exec);
        assert!(!config.allow_cwd);
    }

    #[test]
    fn test_safe_imports_fallback() {
        let restrictions = SandboxConfig::default().import_restrictions();
        assert!(restrictions.allowed.contains("json"));
        assert!(!restrictions.is_allowed("urllib.request").0);

        let open = SandboxConfig::default()
            .with_use_safe_imports(false)
            .import_restrictions();
        assert!(open.allowed.is_empty());
        assert!(open.is_allowed("urllib.request").0);
    }

    #[test]
    fn test_explicit_allow_list_replaces_safe_set() {
        let restrictions = SandboxConfig::default()
            .with_allowed_imports(["json"])
            .with_blocked_imports(["json"])
            .import_restrictions();
        assert_eq!(restrictions.allowed.len(), 1);
        assert!(!restrictions.is_allowed("json").0);
        assert!(!restrictions.is_allowed("math").0);
    }

    #[test]
    fn test_builder_chain() {
        let config = SandboxConfig::default()
            .with_timeout_seconds(5.0)
            .with_max_memory_bytes(256 * 1024 * 1024)
            .with_read_paths(["/data"])
            .with_allow_cwd(true);
        let limits = config.resource_limits();
        assert_eq!(limits.timeout_seconds, 5.0);
        assert_eq!(limits.max_memory_bytes, Some(268_435_456));
        assert!(config.path_restrictions().is_configured());
    }

    #[test]
    fn test_from_json_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"allowed_imports": ["json", "math"], "timeout_seconds": 2.5, "allow_cwd": true}}"#
        )
        .unwrap();

        let config = SandboxConfig::from_json_file(file.path()).unwrap();
        assert_eq!(
            config.allowed_imports,
            Some(vec!["json".to_string(), "math".to_string()])
        );
        assert_eq!(config.timeout_seconds, 2.5);
        assert!(config.allow_cwd);
        assert!(config.use_safe_imports);
        assert_eq!(config.max_output_bytes, 1_048_576);
    }

    #[test]
    fn test_from_json_file_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = SandboxConfig::from_json_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), "json_error");
    }
}
