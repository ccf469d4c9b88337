//! # pyshield
//!
//! Static risk analysis and guarded execution for untrusted Python source.
//!
//! Two independent entry points:
//!
//! - [`analyze_python`] parses source with tree-sitter, extracts a structural
//!   fingerprint ([`CodeFeatures`]) and scores it ([`RiskAssessment`]). Nothing
//!   is executed.
//! - [`PythonSandbox`] runs source in a child interpreter with a restricted
//!   builtins table, a policy-checked `__import__` and `open`, a wall-clock
//!   deadline, an optional address-space cap and capped output.
//!
//! The sandbox is a language-level mitigation, not an isolation boundary.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pyshield::{analyze_python, PythonSandbox, RiskLevel, SandboxConfig};
//!
//! # async fn example() -> pyshield::Result<()> {
//! let analysis = analyze_python("import json\nprint(json.dumps({'a': 1}))", RiskLevel::Medium);
//! assert!(analysis.is_safe);
//!
//! let sandbox = PythonSandbox::new(
//!     SandboxConfig::default()
//!         .with_allowed_imports(["json"])
//!         .with_timeout_seconds(5.0),
//! )?;
//! let result = sandbox.execute("import json\nprint(json.dumps({'a': 1}))", None).await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod config;
pub mod errors;
pub mod features;
pub mod limits;
pub mod restrictions;
pub mod risk;
pub mod runner;
pub mod sandbox;

pub use analyzer::{analyze_python, CodeAnalysis};
pub use config::SandboxConfig;
pub use errors::{Result, SandboxError};
pub use features::{extract_features, CodeFeatures};
pub use limits::{ResourceLimiter, ResourceLimits};
pub use restrictions::{
    safe_imports, ImportRestrictions, PathRestrictions, ALWAYS_BLOCKED_IMPORTS, SAFE_IMPORTS,
};
pub use risk::{calculate_risk, RiskAssessment, RiskLevel};
pub use sandbox::{PythonSandbox, SandboxResult};
