use crate::features::CodeFeatures;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Coarse danger classification. Ordered from least to most dangerous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn ordinal(self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }

    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 70 => RiskLevel::Critical,
            s if s >= 40 => RiskLevel::High,
            s if s >= 15 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Weighted sum of triggered rules, clamped to 0..=100
    pub score: u32,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    /// Critical imports found in the source
    pub blocked_imports: BTreeSet<String>,
}

impl RiskAssessment {
    /// Assessment used when the source could not be parsed at all.
    pub fn syntax_failure(message: &str) -> Self {
        Self {
            level: RiskLevel::Critical,
            score: 100,
            reasons: vec![format!("Syntax error: {}", message)],
            warnings: Vec::new(),
            blocked_imports: BTreeSet::new(),
        }
    }
}

/// Imports that make an analysis critical on their own.
pub const CRITICAL_IMPORTS: &[&str] = &[
    "ctypes",
    "multiprocessing",
    "threading",
    "_thread",
    "gc",
    "sys",
    "builtins",
    "importlib",
    "pkgutil",
    "code",
    "codeop",
    "rlcompleter",
    "pdb",
    "bdb",
    "trace",
    "traceback",
    "linecache",
    "inspect",
    "dis",
    "pickletools",
    "formatter",
    "msilib",
    "winreg",
    "_winapi",
    "posix",
    "posixpath",
    "nt",
    "ntpath",
    "_posixsubprocess",
];

pub const HIGH_RISK_IMPORTS: &[&str] = &[
    "os",
    "subprocess",
    "shutil",
    "pathlib",
    "pickle",
    "shelve",
    "marshal",
    "socket",
    "ssl",
    "asyncio",
    "signal",
    "pty",
    "tty",
    "termios",
    "resource",
    "syslog",
    "tempfile",
    "glob",
    "fnmatch",
];

pub const MEDIUM_RISK_IMPORTS: &[&str] = &[
    "urllib",
    "http",
    "email",
    "mailbox",
    "mimetypes",
    "base64",
    "binascii",
    "quopri",
    "uu",
    "html",
    "xml",
    "configparser",
    "logging",
    "warnings",
    "contextlib",
    "abc",
    "atexit",
    "weakref",
    "copy",
    "pprint",
    "reprlib",
];

const CRITICAL_IMPORT_WEIGHT: u32 = 100;
const HIGH_RISK_IMPORT_WEIGHT: u32 = 40;
const MEDIUM_RISK_IMPORT_WEIGHT: u32 = 15;
const EXEC_EVAL_WEIGHT: u32 = 80;
const SYSTEM_CALL_WEIGHT: u32 = 80;
const NETWORK_WEIGHT: u32 = 35;
const FILE_OPERATION_WEIGHT: u32 = 25;
const DANGEROUS_BUILTIN_WEIGHT: u32 = 20;
const GLOBAL_WEIGHT: u32 = 10;
const NONLOCAL_WEIGHT: u32 = 5;

/// Score a feature fingerprint. Every rule fires independently; the sum is clamped to 100.
pub fn calculate_risk(features: &CodeFeatures) -> RiskAssessment {
    let mut score = 0u32;
    let mut reasons = Vec::new();
    let mut warnings = Vec::new();

    let critical = matching_imports(&features.imports, CRITICAL_IMPORTS);
    if !critical.is_empty() {
        score += CRITICAL_IMPORT_WEIGHT;
        reasons.push(format!("Critical imports detected: {}", join(&critical)));
    }

    let high = matching_imports(&features.imports, HIGH_RISK_IMPORTS);
    if !high.is_empty() {
        score += HIGH_RISK_IMPORT_WEIGHT;
        reasons.push(format!("High-risk imports: {}", join(&high)));
    }

    let medium = matching_imports(&features.imports, MEDIUM_RISK_IMPORTS);
    if !medium.is_empty() {
        score += MEDIUM_RISK_IMPORT_WEIGHT;
        warnings.push(format!("Medium-risk imports: {}", join(&medium)));
    }

    if !features.exec_eval_usage.is_empty() {
        score += EXEC_EVAL_WEIGHT;
        reasons.push(format!(
            "Dynamic code execution: {}",
            call_names(&features.exec_eval_usage)
        ));
    }

    if !features.system_calls.is_empty() {
        score += SYSTEM_CALL_WEIGHT;
        reasons.push(format!(
            "System calls detected: {}",
            call_names(&features.system_calls)
        ));
    }

    if !features.network_calls.is_empty() {
        score += NETWORK_WEIGHT;
        reasons.push(format!(
            "Network operations: {}",
            call_names(&features.network_calls)
        ));
    }

    if !features.file_operations.is_empty() {
        score += FILE_OPERATION_WEIGHT;
        warnings.push(format!(
            "File operations: {}",
            call_names(&features.file_operations)
        ));
    }

    if !features.dangerous_builtins.is_empty() {
        score += DANGEROUS_BUILTIN_WEIGHT;
        let names: Vec<&str> = features.dangerous_builtins.iter().map(String::as_str).collect();
        warnings.push(format!("Dangerous builtins: {}", names.join(", ")));
    }

    if features.has_global_statements {
        score += GLOBAL_WEIGHT;
        warnings.push("Uses global statements".to_string());
    }

    if features.has_nonlocal_statements {
        score += NONLOCAL_WEIGHT;
        warnings.push("Uses nonlocal statements".to_string());
    }

    let score = score.min(100);
    RiskAssessment {
        level: RiskLevel::from_score(score),
        score,
        reasons,
        warnings,
        blocked_imports: critical.into_iter().map(str::to_string).collect(),
    }
}

/// Sorted intersection; `imports` is already ordered.
fn matching_imports<'a>(imports: &'a BTreeSet<String>, table: &[&str]) -> Vec<&'a str> {
    imports
        .iter()
        .map(String::as_str)
        .filter(|name| table.contains(name))
        .collect()
}

fn join(names: &[&str]) -> String {
    names.join(", ")
}

fn call_names(calls: &[(String, Vec<String>)]) -> String {
    calls
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
