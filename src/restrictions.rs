//! Import and filesystem restriction policies.
//!
//! Both policies are plain data with pure predicates. The sandbox evaluates
//! them host-side for `read_file`/`write_file`, and ships the same data to
//! the interpreter so the guarded `__import__` and `open` apply identical
//! rules inside the child.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Modules that can never be imported, whatever the configuration says.
pub const ALWAYS_BLOCKED_IMPORTS: &[&str] = &[
    // Native code and memory
    "ctypes",
    "ctypes.util",
    "_ctypes",
    // Concurrency
    "multiprocessing",
    "_multiprocessing",
    "threading",
    "_thread",
    "concurrent",
    "concurrent.futures",
    // Interpreter internals
    "gc",
    "sys",
    "_sys",
    "builtins",
    "_builtins",
    "importlib",
    "importlib.util",
    "importlib.abc",
    "importlib.machinery",
    "importlib.resources",
    "pkgutil",
    "runpy",
    "code",
    "codeop",
    // Introspection
    "ast",
    "dis",
    "inspect",
    "traceback",
    "linecache",
    "tokenize",
    "token",
    "symbol",
    "parser",
    // Debugging
    "pdb",
    "bdb",
    "trace",
    "faulthandler",
    // Serialization with code execution
    "pickle",
    "cPickle",
    "_pickle",
    "shelve",
    "marshal",
    "pickletools",
    // OS and processes
    "os",
    "posix",
    "nt",
    "posixpath",
    "ntpath",
    "_posixsubprocess",
    "subprocess",
    "shutil",
    "pathlib",
    "glob",
    "fnmatch",
    "signal",
    "pty",
    "tty",
    "termios",
    "resource",
    "msilib",
    "winreg",
    "_winapi",
    "msvcrt",
    "platform",
    "sysconfig",
    // Network
    "socket",
    "_socket",
    "ssl",
    "_ssl",
    "select",
    "selectors",
    "asyncio",
    // Raw I/O
    "io",
    "_io",
    "tempfile",
    // Lifecycle hooks
    "weakref",
    "atexit",
];

/// Pure computational and data modules with no OS or process surface.
pub const SAFE_IMPORTS: &[&str] = &[
    "json",
    "re",
    "math",
    "statistics",
    "decimal",
    "fractions",
    "random",
    "collections",
    "itertools",
    "functools",
    "operator",
    "string",
    "textwrap",
    "unicodedata",
    "difflib",
    "typing",
    "dataclasses",
    "enum",
    "numbers",
    "datetime",
    "calendar",
    "time",
    "copy",
    "pprint",
    "reprlib",
    "types",
    "abc",
    "contextlib",
    "heapq",
    "bisect",
    "array",
    "hashlib",
    "hmac",
    "secrets",
    "base64",
    "binascii",
    "struct",
    "codecs",
    "html",
    "html.parser",
    "html.entities",
    "urllib.parse",
    "zlib",
    "gzip",
    "bz2",
    "lzma",
    "csv",
];

/// Owned copy of [`SAFE_IMPORTS`] for callers that want to extend it.
pub fn safe_imports() -> HashSet<String> {
    SAFE_IMPORTS.iter().map(|s| s.to_string()).collect()
}

/// Import policy: blacklist, whitelist, or block-all, under the fixed
/// always-blocked list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRestrictions {
    /// Whitelist. Empty means no whitelist.
    pub allowed: HashSet<String>,
    pub blocked: HashSet<String>,
    pub block_all: bool,
}

impl ImportRestrictions {
    pub fn new(allowed: HashSet<String>, blocked: HashSet<String>) -> Self {
        Self {
            allowed,
            blocked,
            block_all: false,
        }
    }

    pub fn block_all() -> Self {
        Self {
            block_all: true,
            ..Default::default()
        }
    }

    /// Check a dotted module name. Returns the verdict and, on denial, the reason.
    ///
    /// The order is fixed: always-blocked, block-all, explicit block, whitelist.
    /// An explicit block therefore wins over an explicit allow.
    pub fn is_allowed(&self, module: &str) -> (bool, Option<&'static str>) {
        let top = top_level(module);

        if ALWAYS_BLOCKED_IMPORTS.contains(&module) || ALWAYS_BLOCKED_IMPORTS.contains(&top) {
            return (false, Some("Module is on the always-blocked list for security"));
        }

        if self.block_all {
            return (false, Some("All imports are blocked in this sandbox"));
        }

        if self.blocked.contains(module) || self.blocked.contains(top) {
            return (false, Some("Module is explicitly blocked"));
        }

        if !self.allowed.is_empty() {
            if self.allowed.contains(module) || self.allowed.contains(top) {
                return (true, None);
            }
            return (false, Some("Module is not on the allowed list"));
        }

        (true, None)
    }
}

fn top_level(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

/// Filesystem policy. Deny-by-default: with no grants configured nothing is readable or writable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRestrictions {
    pub allowed_read: Vec<PathBuf>,
    pub allowed_write: Vec<PathBuf>,
    pub allow_cwd: bool,
    /// Base for relative paths; the process working directory when unset
    pub working_directory: Option<PathBuf>,
}

impl PathRestrictions {
    pub fn is_configured(&self) -> bool {
        !self.allowed_read.is_empty() || !self.allowed_write.is_empty() || self.allow_cwd
    }

    pub fn can_read(&self, path: impl AsRef<Path>) -> bool {
        self.check(path.as_ref(), &self.allowed_read)
    }

    pub fn can_write(&self, path: impl AsRef<Path>) -> bool {
        self.check(path.as_ref(), &self.allowed_write)
    }

    fn check(&self, path: &Path, roots: &[PathBuf]) -> bool {
        let Ok(resolved) = self.resolve(path) else {
            return false;
        };

        for root in roots {
            if let Ok(root) = self.resolve(root) {
                if resolved.starts_with(&root) {
                    return true;
                }
            }
        }

        if self.allow_cwd {
            if let Ok(cwd) = self.base_directory().and_then(|base| realpath(&base)) {
                if resolved.starts_with(&cwd) {
                    return true;
                }
            }
        }

        false
    }

    /// Absolute, symlink-resolved form of `path`, relative paths taken from the working directory.
    pub fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        if path.is_absolute() {
            realpath(path)
        } else {
            realpath(&self.base_directory()?.join(path))
        }
    }

    fn base_directory(&self) -> io::Result<PathBuf> {
        match &self.working_directory {
            Some(dir) if dir.is_absolute() => Ok(dir.clone()),
            Some(dir) => Ok(std::env::current_dir()?.join(dir)),
            None => std::env::current_dir(),
        }
    }

    /// Resolved read roots, write roots and working directory, in the form
    /// the interpreter-side guard expects.
    pub(crate) fn resolved_roots(&self) -> io::Result<(Vec<PathBuf>, Vec<PathBuf>, PathBuf)> {
        let read = self
            .allowed_read
            .iter()
            .map(|p| self.resolve(p))
            .collect::<io::Result<Vec<_>>>()?;
        let write = self
            .allowed_write
            .iter()
            .map(|p| self.resolve(p))
            .collect::<io::Result<Vec<_>>>()?;
        let cwd = realpath(&self.base_directory()?)?;
        Ok((read, write, cwd))
    }
}

/// Non-strict realpath: walk components left to right, resolving symlinks for
/// every prefix that exists and treating the rest lexically.
fn realpath(path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if let Ok(canonical) = resolved.canonicalize() {
                    resolved = canonical;
                }
            }
        }
    }
    if resolved.as_os_str().is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_always_blocked_overrides_allow_list() {
        let restrictions = ImportRestrictions::new(set(&["os", "json"]), HashSet::new());
        let (allowed, reason) = restrictions.is_allowed("os");
        assert!(!allowed);
        assert_eq!(reason, Some("Module is on the always-blocked list for security"));

        let (allowed, _) = restrictions.is_allowed("os.path");
        assert!(!allowed);
        assert!(restrictions.is_allowed("json").0);
    }

    #[test]
    fn test_block_wins_over_allow() {
        let restrictions = ImportRestrictions::new(set(&["requests"]), set(&["requests"]));
        assert_eq!(
            restrictions.is_allowed("requests"),
            (false, Some("Module is explicitly blocked"))
        );
    }

    #[test]
    fn test_whitelist_mode() {
        let restrictions = ImportRestrictions::new(set(&["json", "urllib.parse"]), HashSet::new());
        assert!(restrictions.is_allowed("json").0);
        assert!(restrictions.is_allowed("json.decoder").0);
        assert!(restrictions.is_allowed("urllib.parse").0);
        assert_eq!(
            restrictions.is_allowed("urllib.request"),
            (false, Some("Module is not on the allowed list"))
        );
        assert!(!restrictions.is_allowed("math").0);
    }

    #[test]
    fn test_blacklist_mode_and_block_all() {
        let restrictions = ImportRestrictions::new(HashSet::new(), set(&["requests"]));
        assert!(restrictions.is_allowed("json").0);
        assert!(!restrictions.is_allowed("requests.adapters").0);

        let none = ImportRestrictions::block_all();
        assert_eq!(
            none.is_allowed("json"),
            (false, Some("All imports are blocked in this sandbox"))
        );
    }

    #[test]
    fn test_unrestricted_still_blocks_hard_list() {
        let restrictions = ImportRestrictions::default();
        assert!(restrictions.is_allowed("json").0);
        assert!(!restrictions.is_allowed("subprocess").0);
    }

    #[test]
    fn test_safe_imports_copy() {
        let mut safe = safe_imports();
        assert!(safe.contains("json"));
        assert!(!safe.contains("os"));
        safe.insert("numpy".to_string());
        assert!(!SAFE_IMPORTS.contains(&"numpy"));
    }

    #[test]
    fn test_path_default_deny() {
        let restrictions = PathRestrictions::default();
        assert!(!restrictions.is_configured());
        let cwd = std::env::current_dir().unwrap();
        assert!(!restrictions.can_read(cwd.join("Cargo.toml")));
        assert!(!restrictions.can_write(cwd.join("out.txt")));
        assert!(!restrictions.can_read("/etc/passwd"));
    }

    #[test]
    fn test_read_and_write_roots_are_independent() {
        let dir = TempDir::new().unwrap();
        let read_dir = dir.path().join("in");
        let write_dir = dir.path().join("out");
        fs::create_dir_all(&read_dir).unwrap();
        fs::create_dir_all(&write_dir).unwrap();

        let restrictions = PathRestrictions {
            allowed_read: vec![read_dir.clone()],
            allowed_write: vec![write_dir.clone()],
            ..Default::default()
        };
        assert!(restrictions.can_read(read_dir.join("data.csv")));
        assert!(!restrictions.can_write(read_dir.join("data.csv")));
        assert!(restrictions.can_write(write_dir.join("new/report.txt")));
        assert!(!restrictions.can_read(write_dir.join("report.txt")));
    }

    #[test]
    fn test_parent_traversal_is_normalized() {
        let dir = TempDir::new().unwrap();
        let allowed = dir.path().join("allowed");
        fs::create_dir_all(&allowed).unwrap();

        let restrictions = PathRestrictions {
            allowed_read: vec![allowed.clone()],
            ..Default::default()
        };
        assert!(!restrictions.can_read(allowed.join("../secret.txt")));
        assert!(!restrictions.can_read(allowed.join("missing/../../secret.txt")));
        assert!(restrictions.can_read(allowed.join("missing/../ok.txt")));
    }

    #[test]
    fn test_sibling_prefix_is_not_a_descendant() {
        let dir = TempDir::new().unwrap();
        let allowed = dir.path().join("data");
        fs::create_dir_all(&allowed).unwrap();

        let restrictions = PathRestrictions {
            allowed_read: vec![allowed],
            ..Default::default()
        };
        assert!(!restrictions.can_read(dir.path().join("data2/file.txt")));
    }

    #[test]
    fn test_relative_paths_use_working_directory() {
        let dir = TempDir::new().unwrap();
        let restrictions = PathRestrictions {
            allow_cwd: true,
            working_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(restrictions.is_configured());
        assert!(restrictions.can_read("notes.txt"));
        assert!(restrictions.can_write("sub/notes.txt"));
        assert!(!restrictions.can_read("../outside.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_denied() {
        let dir = TempDir::new().unwrap();
        let allowed = dir.path().join("allowed");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&allowed).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, allowed.join("link")).unwrap();

        let restrictions = PathRestrictions {
            allowed_read: vec![allowed.clone()],
            ..Default::default()
        };
        assert!(!restrictions.can_read(allowed.join("link/secret.txt")));
    }
}
