use pyshield::{analyze_python, PythonSandbox, RiskLevel, SandboxConfig};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Default)]
struct WorkerConfig {
    base_config: SandboxConfig,
    python_path_override: Option<PathBuf>,
}

impl WorkerConfig {
    fn from_env_and_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();

        let mut config_path = std::env::var("PYSHIELD_CONFIG").ok().map(PathBuf::from);
        let mut python_path_override = std::env::var("PYSHIELD_PYTHON").ok().map(PathBuf::from);

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    if let Some(v) = args.get(i + 1) {
                        config_path = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--python-path" => {
                    if let Some(v) = args.get(i + 1) {
                        python_path_override = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }

        let base_config = match &config_path {
            Some(path) => SandboxConfig::from_json_file(path)?,
            None => SandboxConfig::default(),
        };

        Ok(Self {
            base_config,
            python_path_override,
        })
    }

    /// Sandbox configuration for one request: the base config overlaid with
    /// any `config` object in the params, then the interpreter override.
    fn sandbox_config(&self, params: &Value) -> std::result::Result<SandboxConfig, Value> {
        let mut config = match params.get("config") {
            Some(Value::Object(overrides)) => {
                let mut merged = match serde_json::to_value(&self.base_config) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                for (key, value) in overrides {
                    merged.insert(key.clone(), value.clone());
                }
                serde_json::from_value(Value::Object(merged))
                    .map_err(|e| invalid_params(format!("invalid config: {}", e)))?
            }
            Some(Value::Null) | None => self.base_config.clone(),
            Some(_) => return Err(invalid_params("config must be an object".to_string())),
        };
        if config.python_path.is_none() {
            config.python_path = self.python_path_override.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "pyshield_worker=info,pyshield=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = WorkerConfig::from_env_and_args()?;
    tracing::info!(
        "pyshield-worker starting (python override={:?})",
        cfg.python_path_override
    );

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid request line: {} | err={}", line, e);
                continue;
            }
        };

        if parsed.get("method").and_then(|m| m.as_str()) == Some("shutdown") {
            tracing::info!("shutdown requested");
            break;
        }

        let response = handle_message(&cfg, parsed).await;
        let s = serde_json::to_string(&response)?;
        stdout.write_all(s.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}

async fn handle_message(cfg: &WorkerConfig, msg: Value) -> Value {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned().unwrap_or(Value::Null);
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "ping" => Ok(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") })),
        "analyze" => analyze(&params),
        "execute" => execute(cfg, &params).await,
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    match result {
        Ok(v) => json!({ "id": id, "result": v }),
        Err(err_obj) => json!({ "id": id, "error": err_obj }),
    }
}

fn analyze(params: &Value) -> std::result::Result<Value, Value> {
    let source = params
        .get("source")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid_params("missing string param: source".to_string()))?;

    let threshold = match params.get("safe_threshold").and_then(|v| v.as_str()) {
        Some(raw) => raw.parse::<RiskLevel>().map_err(invalid_params)?,
        None => RiskLevel::default(),
    };

    Ok(analyze_python(source, threshold).to_dict())
}

async fn execute(cfg: &WorkerConfig, params: &Value) -> std::result::Result<Value, Value> {
    let code = params
        .get("code")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid_params("missing string param: code".to_string()))?;

    let globals = match params.get("globals") {
        Some(Value::Object(map)) => Some(map),
        Some(Value::Null) | None => None,
        Some(_) => return Err(invalid_params("globals must be an object".to_string())),
    };

    let config = cfg.sandbox_config(params)?;
    let sandbox = PythonSandbox::new(config).map_err(|e| {
        json!({
            "code": -32000,
            "message": e.to_string(),
            "data": { "kind": e.kind() }
        })
    })?;

    let result = sandbox.execute(code, globals).await;
    Ok(result.to_dict())
}

fn invalid_params(message: String) -> Value {
    json!({ "code": -32602, "message": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_request() {
        let result = analyze(&json!({ "source": "import os" })).unwrap();
        assert_eq!(result["risk"]["level"], json!("high"));
        assert_eq!(result["is_safe"], json!(false));

        let lenient = analyze(&json!({ "source": "import os", "safe_threshold": "high" })).unwrap();
        assert_eq!(lenient["is_safe"], json!(true));
    }

    #[test]
    fn test_analyze_rejects_bad_params() {
        let err = analyze(&json!({})).unwrap_err();
        assert_eq!(err["code"], json!(-32602));

        let err = analyze(&json!({ "source": "x = 1", "safe_threshold": "severe" })).unwrap_err();
        assert_eq!(err["code"], json!(-32602));
    }

    #[test]
    fn test_config_overlay() {
        let cfg = WorkerConfig {
            base_config: SandboxConfig::default().with_timeout_seconds(3.0),
            python_path_override: Some(PathBuf::from("/opt/python/bin/python3")),
        };
        let config = cfg
            .sandbox_config(&json!({ "config": { "allowed_imports": ["json"] } }))
            .unwrap();
        assert_eq!(config.timeout_seconds, 3.0);
        assert_eq!(config.allowed_imports, Some(vec!["json".to_string()]));
        assert_eq!(config.python_path, Some(PathBuf::from("/opt/python/bin/python3")));

        assert!(cfg.sandbox_config(&json!({ "config": 5 })).is_err());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response =
            handle_message(&WorkerConfig::default(), json!({ "id": 7, "method": "nope" })).await;
        assert_eq!(response["id"], json!(7));
        assert_eq!(response["error"]["code"], json!(-32601));
    }
}
