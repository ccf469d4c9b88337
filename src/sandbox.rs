use crate::analyzer::analyze_python;
use crate::config::SandboxConfig;
use crate::errors::{Result, SandboxError};
use crate::limits::{ChildOutcome, ResourceLimiter, ResourceLimits};
use crate::restrictions::{ImportRestrictions, PathRestrictions};
use crate::risk::RiskLevel;
use crate::runner::{
    ImportPolicyData, PathPolicyData, RunnerFailure, RunnerJob, RunnerReport, JOB_FILE,
    REPORT_FILE, RUNNER_FILE, RUNNER_SOURCE,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Outcome of one [`PythonSandbox::execute`] call.
#[derive(Debug, Default)]
pub struct SandboxResult {
    pub success: bool,
    /// Captured stdout, capped at `max_output_bytes`
    pub output: String,
    pub stderr: String,
    /// Display form of `exception`
    pub error: Option<String>,
    pub exception: Option<SandboxError>,
    /// Top-level locals whose names do not start with `_`
    pub locals: BTreeMap<String, Value>,
    /// The `result` local, when the code set one
    pub return_value: Option<Value>,
    pub duration: Duration,
}

impl SandboxResult {
    fn failed(err: SandboxError, output: String, stderr: String) -> Self {
        Self {
            success: false,
            output,
            stderr,
            error: Some(err.to_string()),
            exception: Some(err),
            ..Default::default()
        }
    }

    pub fn to_dict(&self) -> Value {
        json!({
            "success": self.success,
            "output": self.output,
            "stderr": self.stderr,
            "error": self.error,
            "error_kind": self.exception.as_ref().map(SandboxError::kind),
            "locals": self.locals,
            "return_value": self.return_value,
            "duration_ms": self.duration.as_millis() as u64,
        })
    }
}

/// Runs Python source in a child interpreter under import, path and resource restrictions.
pub struct PythonSandbox {
    python_path: PathBuf,
    import_restrictions: ImportRestrictions,
    path_restrictions: PathRestrictions,
    resource_limits: ResourceLimits,
    validate_before_exec: bool,
}

impl PythonSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let python_path = match &config.python_path {
            Some(path) if path.exists() => path.clone(),
            Some(path) => which::which(path).map_err(|_| SandboxError::PythonNotFound)?,
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|_| SandboxError::PythonNotFound)?,
        };

        info!("[SANDBOX] using interpreter {}", python_path.display());

        Ok(Self {
            python_path,
            import_restrictions: config.import_restrictions(),
            path_restrictions: config.path_restrictions(),
            resource_limits: config.resource_limits(),
            validate_before_exec: config.validate_before_exec,
        })
    }

    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    pub fn import_restrictions(&self) -> &ImportRestrictions {
        &self.import_restrictions
    }

    pub fn path_restrictions(&self) -> &PathRestrictions {
        &self.path_restrictions
    }

    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.resource_limits
    }

    pub fn resource_limits_mut(&mut self) -> &mut ResourceLimits {
        &mut self.resource_limits
    }

    /// Execute `code` with optional extra globals.
    ///
    /// Never fails: every error, including host-side I/O problems, is
    /// reported through the returned [`SandboxResult`].
    pub async fn execute(
        &self,
        code: &str,
        extra_globals: Option<&Map<String, Value>>,
    ) -> SandboxResult {
        let execution_id = uuid::Uuid::new_v4();
        let started = Instant::now();
        debug!("[SANDBOX] execution {} starting ({} bytes)", execution_id, code.len());

        if self.validate_before_exec {
            let analysis = analyze_python(code, RiskLevel::default());
            if !analysis.syntax_valid {
                let message = analysis.syntax_error.unwrap_or_default();
                info!("[SANDBOX] execution {} rejected: syntax error", execution_id);
                let mut result = SandboxResult::failed(
                    SandboxError::SyntaxError(message),
                    String::new(),
                    String::new(),
                );
                result.duration = started.elapsed();
                return result;
            }
        }

        let empty = Map::new();
        let globals = extra_globals.unwrap_or(&empty);
        let mut result = match self.run(code, globals).await {
            Ok(result) => result,
            Err(err) => {
                warn!("[SANDBOX] execution {} failed on the host: {}", execution_id, err);
                SandboxResult::failed(err, String::new(), String::new())
            }
        };
        result.duration = started.elapsed();

        match &result.exception {
            None => info!(
                "[SANDBOX] execution {} succeeded in {:?}",
                execution_id, result.duration
            ),
            Some(err) if err.is_violation() => warn!(
                "[SANDBOX] execution {} stopped by policy: {}",
                execution_id, err
            ),
            Some(err) => info!(
                "[SANDBOX] execution {} failed ({}): {}",
                execution_id,
                err.kind(),
                err
            ),
        }
        result
    }

    async fn run(&self, code: &str, globals: &Map<String, Value>) -> Result<SandboxResult> {
        let workdir = tempfile::Builder::new().prefix("pyshield-").tempdir()?;
        let runner_path = workdir.path().join(RUNNER_FILE);
        let job_path = workdir.path().join(JOB_FILE);
        let report_path = workdir.path().join(REPORT_FILE);

        let job = RunnerJob {
            code,
            globals,
            imports: ImportPolicyData::from_restrictions(&self.import_restrictions),
            paths: PathPolicyData::from_restrictions(&self.path_restrictions)?,
            timeout: self.resource_limits.timeout().map(|t| t.as_secs_f64()),
        };
        tokio::fs::write(&runner_path, RUNNER_SOURCE).await?;
        tokio::fs::write(&job_path, serde_json::to_vec(&job)?).await?;

        let mut cmd = Command::new(&self.python_path);
        // -I ignores PYTHON* variables, so UTF-8 stdio is requested with -X
        cmd.args(["-I", "-u", "-B", "-X", "utf8"])
            .arg(&runner_path)
            .arg(&job_path)
            .arg(&report_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.path_restrictions.working_directory {
            cmd.current_dir(dir);
        }

        let limiter = ResourceLimiter::new(&self.resource_limits);
        limiter.configure(&mut cmd);

        let child = cmd.spawn()?;
        let outcome = limiter.supervise(child).await?;

        let report = match tokio::fs::read(&report_path).await {
            Ok(bytes) => match serde_json::from_slice::<RunnerReport>(&bytes) {
                Ok(report) => Some(report),
                // A killed interpreter can leave a partial report behind
                Err(e) => {
                    debug!("[SANDBOX] discarding unreadable report: {}", e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(self.interpret(outcome, report))
    }

    fn interpret(&self, outcome: ChildOutcome, report: Option<RunnerReport>) -> SandboxResult {
        let timed_out = outcome.timed_out;
        let status = outcome.status;
        let output = outcome.stdout.into_text();
        let stderr = outcome.stderr.into_text();

        let (failure, locals) = match report {
            Some(RunnerReport::Ok { locals }) if !timed_out => (None, locals),
            Some(RunnerReport::Ok { locals }) => (Some(self.timeout_error()), locals),
            Some(RunnerReport::Error { failure, locals }) => {
                (Some(self.map_failure(failure)), locals)
            }
            None if timed_out => (Some(self.timeout_error()), BTreeMap::new()),
            None => (Some(self.missing_report_error(status, &stderr)), BTreeMap::new()),
        };

        let mut result = match failure {
            Some(err) => SandboxResult::failed(err, output, stderr),
            None => SandboxResult {
                success: true,
                output,
                stderr,
                return_value: locals.get("result").cloned(),
                ..Default::default()
            },
        };
        result.locals = locals;
        result
    }

    fn map_failure(&self, failure: RunnerFailure) -> SandboxError {
        match failure {
            RunnerFailure::ImportViolation { module, reason } => {
                SandboxError::ImportViolation { module, reason }
            }
            RunnerFailure::PathViolation { path, operation } => {
                SandboxError::PathViolation { path, operation }
            }
            RunnerFailure::Timeout => self.timeout_error(),
            RunnerFailure::MemoryError { message } => match self.resource_limits.max_memory_bytes {
                Some(limit_bytes) => SandboxError::MemoryLimitExceeded { limit_bytes },
                None => SandboxError::RuntimeError {
                    type_name: "MemoryError".to_string(),
                    message,
                },
            },
            RunnerFailure::Syntax { message } => SandboxError::SyntaxError(message),
            RunnerFailure::Runtime { type_name, message } => {
                SandboxError::RuntimeError { type_name, message }
            }
        }
    }

    fn timeout_error(&self) -> SandboxError {
        SandboxError::Timeout {
            seconds: self.resource_limits.timeout_seconds,
        }
    }

    fn missing_report_error(
        &self,
        status: Option<std::process::ExitStatus>,
        stderr: &str,
    ) -> SandboxError {
        if let Some(limit_bytes) = self.resource_limits.max_memory_bytes {
            if stderr.contains("MemoryError") {
                return SandboxError::MemoryLimitExceeded { limit_bytes };
            }
        }
        match status.and_then(|s| s.code()) {
            Some(code) => SandboxError::ProcessExitCode(code),
            None => SandboxError::ProcessKilled,
        }
    }

    /// Read a file on the host, subject to the read grants.
    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let resolved = self.checked_path(path, "read")?;
        Ok(std::fs::read_to_string(resolved)?)
    }

    /// Write a file on the host, subject to the write grants.
    pub fn write_file(&self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        let path = path.as_ref();
        let resolved = self.checked_path(path, "write")?;
        std::fs::write(resolved, content)?;
        Ok(())
    }

    fn checked_path(&self, path: &Path, operation: &str) -> Result<PathBuf> {
        let allowed = match operation {
            "write" => self.path_restrictions.can_write(path),
            _ => self.path_restrictions.can_read(path),
        };
        if !allowed {
            return Err(SandboxError::PathViolation {
                path: path.display().to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(self.path_restrictions.resolve(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sandbox(config: SandboxConfig) -> Option<PythonSandbox> {
        PythonSandbox::new(config).ok()
    }

    fn result_with(report: Option<RunnerReport>, timed_out: bool) -> SandboxResult {
        let sandbox = PythonSandbox {
            python_path: PathBuf::from("python3"),
            import_restrictions: ImportRestrictions::default(),
            path_restrictions: PathRestrictions::default(),
            resource_limits: ResourceLimits {
                timeout_seconds: 0.5,
                max_memory_bytes: Some(1 << 20),
                ..Default::default()
            },
            validate_before_exec: true,
        };
        let outcome = ChildOutcome {
            status: None,
            stdout: Default::default(),
            stderr: Default::default(),
            timed_out,
        };
        sandbox.interpret(outcome, report)
    }

    #[test]
    fn test_interpret_success_sets_return_value() {
        let mut locals = BTreeMap::new();
        locals.insert("result".to_string(), json!(12));
        let result = result_with(Some(RunnerReport::Ok { locals }), false);
        assert!(result.success);
        assert_eq!(result.return_value, Some(json!(12)));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_interpret_host_timeout() {
        let result = result_with(None, true);
        assert!(!result.success);
        assert!(matches!(result.exception, Some(SandboxError::Timeout { .. })));
        assert_eq!(
            result.error.as_deref(),
            Some("Execution exceeded timeout of 0.5 seconds")
        );
    }

    #[test]
    fn test_interpret_memory_error_under_limit() {
        let report = RunnerReport::Error {
            failure: RunnerFailure::MemoryError {
                message: String::new(),
            },
            locals: BTreeMap::new(),
        };
        let result = result_with(Some(report), false);
        assert_eq!(result.exception.as_ref().map(|e| e.kind()), Some("memory_limit"));
    }

    #[test]
    fn test_interpret_killed_without_report() {
        let result = result_with(None, false);
        assert!(matches!(result.exception, Some(SandboxError::ProcessKilled)));
    }

    #[test]
    fn test_to_dict_carries_error_kind() {
        let result = SandboxResult::failed(
            SandboxError::ImportViolation {
                module: "os".to_string(),
                reason: None,
            },
            "partial".to_string(),
            String::new(),
        );
        let dict = result.to_dict();
        assert_eq!(dict["success"], json!(false));
        assert_eq!(dict["error_kind"], json!("import_violation"));
        assert_eq!(dict["output"], json!("partial"));
    }

    #[test]
    fn test_read_and_write_file_confinement() {
        let dir = TempDir::new().unwrap();
        let Some(sandbox) = sandbox(
            SandboxConfig::default()
                .with_read_paths([dir.path()])
                .with_write_paths([dir.path()]),
        ) else {
            return;
        };

        let file = dir.path().join("notes.txt");
        sandbox.write_file(&file, "hello").unwrap();
        assert_eq!(sandbox.read_file(&file).unwrap(), "hello");
        assert_eq!(fs::read_to_string(&file).unwrap(), "hello");

        let err = sandbox.read_file("/etc/passwd").unwrap_err();
        assert!(matches!(
            err,
            SandboxError::PathViolation { ref operation, .. } if operation == "read"
        ));

        let other = TempDir::new().unwrap();
        let err = sandbox.write_file(other.path().join("x.txt"), "nope").unwrap_err();
        assert!(matches!(
            err,
            SandboxError::PathViolation { ref operation, .. } if operation == "write"
        ));
    }

    #[test]
    fn test_relative_paths_follow_working_directory() {
        let dir = TempDir::new().unwrap();
        let Some(sandbox) = sandbox(
            SandboxConfig::default()
                .with_allow_cwd(true)
                .with_working_directory(dir.path()),
        ) else {
            return;
        };
        sandbox.write_file("out.txt", "data").unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "data");
        assert_eq!(sandbox.read_file("out.txt").unwrap(), "data");
    }

    #[test]
    fn test_missing_interpreter() {
        let result = PythonSandbox::new(
            SandboxConfig::default().with_python_path("/nonexistent/pyshield-python"),
        );
        assert!(matches!(result, Err(SandboxError::PythonNotFound)));
    }
}
