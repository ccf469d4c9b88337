//! Interpreter-side half of the sandbox.
//!
//! The host writes a [`RunnerJob`] as JSON, launches the interpreter on
//! [`RUNNER_SOURCE`], and reads back a [`RunnerReport`]. User code never
//! travels through string interpolation; it is a JSON string field.

use crate::restrictions::{ImportRestrictions, PathRestrictions, ALWAYS_BLOCKED_IMPORTS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

pub const RUNNER_FILE: &str = "runner.py";
pub const JOB_FILE: &str = "job.json";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Serialize)]
pub struct RunnerJob<'a> {
    pub code: &'a str,
    pub globals: &'a Map<String, Value>,
    pub imports: ImportPolicyData<'a>,
    /// `None` leaves `open` out of the builtins entirely
    pub paths: Option<PathPolicyData>,
    pub timeout: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ImportPolicyData<'a> {
    pub always_blocked: &'static [&'static str],
    pub allowed: Vec<&'a str>,
    pub blocked: Vec<&'a str>,
    pub block_all: bool,
}

impl<'a> ImportPolicyData<'a> {
    pub fn from_restrictions(restrictions: &'a ImportRestrictions) -> Self {
        let mut allowed: Vec<&str> = restrictions.allowed.iter().map(String::as_str).collect();
        let mut blocked: Vec<&str> = restrictions.blocked.iter().map(String::as_str).collect();
        allowed.sort_unstable();
        blocked.sort_unstable();
        Self {
            always_blocked: ALWAYS_BLOCKED_IMPORTS,
            allowed,
            blocked,
            block_all: restrictions.block_all,
        }
    }
}

/// Resolved path grants. The interpreter compares `realpath` results against these roots.
#[derive(Debug, Serialize)]
pub struct PathPolicyData {
    pub read: Vec<PathBuf>,
    pub write: Vec<PathBuf>,
    /// Present only when the working directory itself is granted
    pub cwd: Option<PathBuf>,
    pub base: PathBuf,
}

impl PathPolicyData {
    pub fn from_restrictions(restrictions: &PathRestrictions) -> io::Result<Option<Self>> {
        if !restrictions.is_configured() {
            return Ok(None);
        }
        let (read, write, base) = restrictions.resolved_roots()?;
        Ok(Some(Self {
            read,
            write,
            cwd: restrictions.allow_cwd.then(|| base.clone()),
            base,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunnerReport {
    Ok {
        #[serde(default)]
        locals: BTreeMap<String, Value>,
    },
    Error {
        failure: RunnerFailure,
        #[serde(default)]
        locals: BTreeMap<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerFailure {
    ImportViolation {
        module: String,
        reason: Option<String>,
    },
    PathViolation {
        path: String,
        operation: String,
    },
    Timeout,
    MemoryError {
        message: String,
    },
    Syntax {
        message: String,
    },
    Runtime {
        type_name: String,
        message: String,
    },
}

/// The runner script. Invoked as `python -I -u -B runner.py <job> <report>`.
pub const RUNNER_SOURCE: &str = r##"import json
import os
import signal
import sys


class SandboxViolation(Exception):
    pass


class ImportViolation(SandboxViolation):
    def __init__(self, module, reason=None):
        self.module = module
        self.reason = reason
        message = "Import of '%s' is not allowed" % module
        if reason:
            message += ": " + reason
        super().__init__(message)


class PathViolation(SandboxViolation):
    def __init__(self, path, operation):
        self.path = path
        self.operation = operation
        super().__init__("Cannot %s path '%s': outside allowed directories" % (operation, path))


class ExecutionTimeout(BaseException):
    pass


SAFE_BUILTIN_NAMES = (
    "bool", "int", "float", "str", "bytes", "bytearray", "list", "tuple",
    "dict", "set", "frozenset", "type", "object",
    "abs", "all", "any", "bin", "chr", "divmod", "enumerate", "filter",
    "format", "hash", "hex", "id", "isinstance", "issubclass", "iter", "len",
    "map", "max", "min", "next", "oct", "ord", "pow", "print", "range",
    "repr", "reversed", "round", "slice", "sorted", "sum", "zip",
    "Exception", "BaseException", "ValueError", "TypeError", "KeyError",
    "IndexError", "AttributeError", "RuntimeError", "StopIteration",
    "ZeroDivisionError", "AssertionError", "NotImplementedError",
    "__build_class__",
)

MAX_REPR = 1000


def make_import_guard(policy, real_import):
    always_blocked = frozenset(policy["always_blocked"])
    allowed = frozenset(policy["allowed"])
    blocked = frozenset(policy["blocked"])
    block_all = bool(policy["block_all"])

    def is_allowed(name):
        top = name.split(".")[0]
        if name in always_blocked or top in always_blocked:
            return False, "Module is on the always-blocked list for security"
        if block_all:
            return False, "All imports are blocked in this sandbox"
        if name in blocked or top in blocked:
            return False, "Module is explicitly blocked"
        if allowed:
            if name in allowed or top in allowed:
                return True, None
            return False, "Module is not on the allowed list"
        return True, None

    def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
        ok, reason = is_allowed(name)
        if not ok:
            raise ImportViolation(name, reason)
        for item in fromlist or ():
            full_name = "%s.%s" % (name, item)
            ok, reason = is_allowed(full_name)
            if not ok:
                raise ImportViolation(full_name, reason)
        return real_import(name, globals, locals, fromlist, level)

    return guarded_import


def make_open_guard(policy, real_open):
    read_roots = list(policy["read"])
    write_roots = list(policy["write"])
    cwd = policy.get("cwd")
    base = policy["base"]

    def within(path, roots):
        for root in roots:
            try:
                if os.path.commonpath([path, root]) == root:
                    return True
            except ValueError:
                continue
        return False

    def resolve(file):
        path = os.fspath(file)
        if isinstance(path, bytes):
            path = os.fsdecode(path)
        if not os.path.isabs(path):
            path = os.path.join(base, path)
        return os.path.realpath(path)

    def guarded_open(file, mode="r", *args, **kwargs):
        mode_text = mode if isinstance(mode, str) else ""
        operation = "write" if any(c in mode_text for c in "wax+") else "read"
        try:
            resolved = resolve(file)
        except TypeError:
            raise PathViolation(str(file), operation) from None
        roots = write_roots if operation == "write" else read_roots
        if not (within(resolved, roots) or (cwd is not None and within(resolved, [cwd]))):
            raise PathViolation(str(file), operation)
        return real_open(resolved, mode, *args, **kwargs)

    return guarded_open


def build_builtins(job):
    import builtins

    safe = {name: getattr(builtins, name) for name in SAFE_BUILTIN_NAMES}
    safe["True"] = True
    safe["False"] = False
    safe["None"] = None
    safe["__import__"] = make_import_guard(job["imports"], builtins.__import__)
    if job.get("paths") is not None:
        safe["open"] = make_open_guard(job["paths"], builtins.open)
    return safe


def describe(value):
    try:
        text = repr(value)
    except BaseException:
        text = "<unrepresentable>"
    if len(text) > MAX_REPR:
        text = text[:MAX_REPR] + "..."
    return {"type": type(value).__name__, "repr": text}


def snapshot(namespace):
    result = {}
    for name, value in list(namespace.items()):
        if not isinstance(name, str) or name.startswith("_"):
            continue
        try:
            json.dumps(value, allow_nan=False)
            result[name] = value
        except BaseException:
            result[name] = describe(value)
    return result


def arm_timer(seconds):
    if not seconds or not hasattr(signal, "setitimer"):
        return False

    def on_alarm(signum, frame):
        raise ExecutionTimeout()

    signal.signal(signal.SIGALRM, on_alarm)
    signal.setitimer(signal.ITIMER_REAL, seconds)
    return True


def disarm_timer(armed):
    if armed:
        signal.setitimer(signal.ITIMER_REAL, 0)


def failure_for(exc):
    if isinstance(exc, ExecutionTimeout):
        return {"kind": "timeout"}
    if isinstance(exc, ImportViolation):
        return {"kind": "import_violation", "module": exc.module, "reason": exc.reason}
    if isinstance(exc, PathViolation):
        return {"kind": "path_violation", "path": exc.path, "operation": exc.operation}
    if isinstance(exc, MemoryError):
        return {"kind": "memory_error", "message": str(exc)}
    return {"kind": "runtime", "type_name": type(exc).__name__, "message": str(exc)}


def write_report(path, report):
    try:
        data = json.dumps(report, allow_nan=False)
    except BaseException:
        report["locals"] = {}
        data = json.dumps(report, allow_nan=False, default=str)
    with open(path, "w", encoding="utf-8") as handle:
        handle.write(data)


def main():
    job_path, report_path = sys.argv[1], sys.argv[2]
    with open(job_path, "r", encoding="utf-8") as handle:
        job = json.load(handle)

    try:
        compiled = compile(job["code"], "<sandbox>", "exec")
    except SyntaxError as exc:
        message = "%s (line %s)" % (exc.msg, exc.lineno) if exc.lineno else str(exc.msg)
        write_report(report_path, {"status": "error", "failure": {"kind": "syntax", "message": message}})
        return

    sandbox_globals = {"__builtins__": build_builtins(job), "__name__": "__sandbox__"}
    sandbox_globals.update(job.get("globals") or {})
    sandbox_locals = {}

    failure = None
    try:
        armed = arm_timer(job.get("timeout"))
        try:
            exec(compiled, sandbox_globals, sandbox_locals)
        finally:
            disarm_timer(armed)
    except BaseException as exc:
        failure = failure_for(exc)

    try:
        sys.stdout.flush()
        sys.stderr.flush()
    except BaseException:
        pass

    locals_snapshot = snapshot(sandbox_locals)
    if failure is None:
        write_report(report_path, {"status": "ok", "locals": locals_snapshot})
    else:
        write_report(report_path, {"status": "error", "failure": failure, "locals": locals_snapshot})


if __name__ == "__main__":
    main()
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_report() {
        let report: RunnerReport =
            serde_json::from_value(json!({"status": "ok", "locals": {"x": 42}})).unwrap();
        match report {
            RunnerReport::Ok { locals } => assert_eq!(locals["x"], json!(42)),
            other => panic!("unexpected report: {:?}", other),
        }
    }

    #[test]
    fn test_failure_reports() {
        let report: RunnerReport = serde_json::from_value(json!({
            "status": "error",
            "failure": {
                "kind": "import_violation",
                "module": "os",
                "reason": "Module is explicitly blocked"
            }
        }))
        .unwrap();
        assert_eq!(
            report,
            RunnerReport::Error {
                failure: RunnerFailure::ImportViolation {
                    module: "os".to_string(),
                    reason: Some("Module is explicitly blocked".to_string()),
                },
                locals: BTreeMap::new(),
            }
        );

        let timeout: RunnerReport =
            serde_json::from_value(json!({"status": "error", "failure": {"kind": "timeout"}}))
                .unwrap();
        assert!(matches!(
            timeout,
            RunnerReport::Error { failure: RunnerFailure::Timeout, .. }
        ));
    }

    #[test]
    fn test_job_serialization() {
        let restrictions = ImportRestrictions::new(
            ["math", "json"].iter().map(|s| s.to_string()).collect(),
            Default::default(),
        );
        let globals = Map::new();
        let job = RunnerJob {
            code: "x = 1",
            globals: &globals,
            imports: ImportPolicyData::from_restrictions(&restrictions),
            paths: PathPolicyData::from_restrictions(&PathRestrictions::default()).unwrap(),
            timeout: Some(2.5),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["imports"]["allowed"], json!(["json", "math"]));
        assert_eq!(value["paths"], Value::Null);
        assert!(value["imports"]["always_blocked"]
            .as_array()
            .unwrap()
            .contains(&json!("subprocess")));
    }

    #[test]
    fn test_runner_source_defines_guards() {
        assert!(RUNNER_SOURCE.contains("def guarded_import"));
        assert!(RUNNER_SOURCE.contains("__build_class__"));
    }
}
