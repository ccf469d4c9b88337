use crate::errors::SandboxError;
use crate::features::{extract_features, CodeFeatures};
use crate::risk::{calculate_risk, RiskAssessment, RiskLevel};
use serde::Serialize;
use serde_json::{json, Value};

/// Result of a static analysis pass over Python source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeAnalysis {
    pub source: String,
    pub features: CodeFeatures,
    pub risk: RiskAssessment,
    pub is_safe: bool,
    pub syntax_valid: bool,
    pub syntax_error: Option<String>,
}

impl CodeAnalysis {
    pub fn risk_level(&self) -> RiskLevel {
        self.risk.level
    }

    pub fn risk_score(&self) -> u32 {
        self.risk.score
    }

    /// Stable JSON rendering consumed by hosting layers.
    ///
    /// Attribute accesses are collected but not part of this map.
    pub fn to_dict(&self) -> Value {
        let f = &self.features;
        json!({
            "source": self.source,
            "syntax_valid": self.syntax_valid,
            "syntax_error": self.syntax_error,
            "is_safe": self.is_safe,
            "risk": {
                "level": self.risk.level,
                "score": self.risk.score,
                "reasons": self.risk.reasons,
                "warnings": self.risk.warnings,
                "blocked_imports": self.risk.blocked_imports,
            },
            "features": {
                "imports": f.imports,
                "file_operations": f.file_operations,
                "network_calls": f.network_calls,
                "system_calls": f.system_calls,
                "exec_eval_usage": f.exec_eval_usage,
                "dangerous_builtins": f.dangerous_builtins,
                "function_calls": f.function_calls,
                "has_global_statements": f.has_global_statements,
                "has_nonlocal_statements": f.has_nonlocal_statements,
                "class_definitions": f.class_definitions,
                "async_operations": f.async_operations,
            },
        })
    }
}

/// Analyze Python source for security risks without running it.
///
/// Code whose risk level is at or below `safe_threshold` is marked safe.
/// Source that does not parse is always critical and unsafe.
pub fn analyze_python(source: &str, safe_threshold: RiskLevel) -> CodeAnalysis {
    let features = match extract_features(source) {
        Ok(features) => features,
        Err(err) => {
            let message = match err {
                SandboxError::SyntaxError(message) => message,
                other => other.to_string(),
            };
            return CodeAnalysis {
                source: source.to_string(),
                features: CodeFeatures::default(),
                risk: RiskAssessment::syntax_failure(&message),
                is_safe: false,
                syntax_valid: false,
                syntax_error: Some(message),
            };
        }
    };

    let risk = calculate_risk(&features);
    let is_safe = risk.level.ordinal() <= safe_threshold.ordinal();

    CodeAnalysis {
        source: source.to_string(),
        features,
        risk,
        is_safe,
        syntax_valid: true,
        syntax_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_code() {
        let analysis = analyze_python("x = 1 + 2\nprint(x)\n", RiskLevel::default());
        assert!(analysis.syntax_valid);
        assert!(analysis.is_safe);
        assert_eq!(analysis.risk_level(), RiskLevel::Low);
        assert!(analysis.risk_score() < 15);
    }

    #[test]
    fn test_subprocess_is_critical() {
        let analysis = analyze_python(
            "import subprocess; subprocess.run(['ls'])",
            RiskLevel::default(),
        );
        assert!(analysis.syntax_valid);
        assert_eq!(analysis.risk_level(), RiskLevel::Critical);
        assert!(!analysis.is_safe);
        assert!(analysis
            .features
            .system_calls
            .iter()
            .any(|(name, _)| name == "subprocess.run"));
    }

    #[test]
    fn test_syntax_error_short_circuits() {
        let analysis = analyze_python("def foo(", RiskLevel::Critical);
        assert!(!analysis.syntax_valid);
        assert!(!analysis.is_safe);
        assert_eq!(analysis.risk_score(), 100);
        assert_eq!(analysis.risk_level(), RiskLevel::Critical);
        assert!(analysis.syntax_error.is_some());
        assert!(analysis.risk.reasons[0].starts_with("Syntax error: "));
        assert_eq!(analysis.features, CodeFeatures::default());
    }

    #[test]
    fn test_grammar_rejections_are_critical() {
        for source in [
            "f(**x, *y)\n",
            "del f()\n",
            "def f(a=1, b):\n    pass\n",
            "f(a=1, 2)\n",
            "x = 0777\n",
            "f(x for x in y, 1)\n",
            "x = b'\\xff' 'a'\n",
        ] {
            let analysis = analyze_python(source, RiskLevel::Critical);
            assert!(!analysis.syntax_valid, "{:?} should be rejected", source);
            assert!(!analysis.is_safe);
            assert_eq!(analysis.risk_score(), 100);
        }
    }

    #[test]
    fn test_threshold_is_ordinal() {
        let source = "import os\n";
        assert!(!analyze_python(source, RiskLevel::Medium).is_safe);
        assert!(analyze_python(source, RiskLevel::High).is_safe);
        assert!(analyze_python(source, RiskLevel::Critical).is_safe);
        assert!(!analyze_python(source, RiskLevel::Low).is_safe);
    }

    #[test]
    fn test_medium_is_safe_by_default() {
        let analysis = analyze_python("import base64\n", RiskLevel::default());
        assert_eq!(analysis.risk_level(), RiskLevel::Medium);
        assert!(analysis.is_safe);
    }

    #[test]
    fn test_idempotent() {
        let source = "import json\nexec('1')\nclass A: pass\n";
        assert_eq!(
            analyze_python(source, RiskLevel::default()),
            analyze_python(source, RiskLevel::default())
        );
    }

    #[test]
    fn test_to_dict_shape() {
        let analysis = analyze_python(
            "import os\nos.system('ls')\nobj.attr\n",
            RiskLevel::default(),
        );
        let dict = analysis.to_dict();

        assert_eq!(dict["syntax_valid"], json!(true));
        assert_eq!(dict["syntax_error"], Value::Null);
        assert_eq!(dict["risk"]["level"], json!("critical"));
        assert_eq!(dict["features"]["imports"], json!(["os"]));
        assert_eq!(dict["features"]["system_calls"], json!([["os.system", ["ls"]]]));
        assert!(dict["features"].get("attribute_accesses").is_none());
        assert_eq!(dict["features"]["async_operations"], json!(false));
    }
}
