//! Target collaborator: registry, subprocess invocation, result model
//!
//! Targets are external parser harnesses that read one input and print a
//! JSON result document on stdout. The runner enforces the per-run timeout
//! and normalizes process-level failures into run statuses. Closed targets
//! may name an open-source oracle; its result rides along for differential
//! scoring.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unknown target: {name}; known targets: {known}")]
    UnknownTarget { name: String, known: String },
    #[error("target directory not found: {0}")]
    MissingTargetDir(PathBuf),
    #[error("failed to read targets file {path}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse targets file {path}: {source}")]
    RegistryParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("i/o while running target '{target}': {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Identity of a classified failure, as reported by a target harness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BugSignature {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64_lossy")]
    pub line: Option<i64>,
}

impl BugSignature {
    /// True when all five identity fields agree.
    pub fn same_identity(&self, other: &BugSignature) -> bool {
        self.kind == other.kind
            && self.exception == other.exception
            && self.message == other.message
            && self.file == other.file
            && self.line == other.line
    }

    pub fn is_meaningful(&self) -> bool {
        self.kind.as_deref().is_some_and(|s| !s.is_empty())
            || self.exception.as_deref().is_some_and(|s| !s.is_empty())
            || self.message.as_deref().is_some_and(|s| !s.is_empty())
            || self.file.as_deref().is_some_and(|s| !s.is_empty())
            || self.line.is_some()
    }
}

/// One target invocation's normalized reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetResult {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub bug_signature: Option<BugSignature>,
    #[serde(default, deserialize_with = "de_opt_i64_lossy")]
    pub covered_branches: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64_lossy")]
    pub missing_branches: Option<i64>,
    #[serde(default)]
    pub branch_details_by_file: Option<serde_json::Value>,
    #[serde(default)]
    pub stdout_signature: Option<String>,
    #[serde(default)]
    pub stderr_signature: Option<String>,
}

impl TargetResult {
    pub fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::default()
        }
    }

    /// Case-folded, stripped status for score comparisons.
    pub fn normalized_status(&self) -> String {
        normalize_status(&self.status)
    }
}

/// Closed result plus the optional open-oracle result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParserResult {
    pub closed: TargetResult,
    pub open: Option<TargetResult>,
}

pub fn normalize_status(status: &str) -> String {
    status.trim().to_lowercase()
}

/// Statuses treated as failures by scoring and bug aggregation.
pub fn is_bug_class(status: &str) -> bool {
    matches!(status, "bug" | "crash" | "timeout" | "error")
}

/// Tolerate integers, floats, and numeric strings; anything else is None.
fn de_opt_i64_lossy<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_i64))
}

pub fn value_as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Wire shape printed by harnesses: closed fields at the top level with the
/// oracle reply nested under `open_result`.
#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(flatten)]
    closed: TargetResult,
    #[serde(default)]
    open_result: Option<TargetResult>,
}

/// How to invoke one registered target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    /// Directory under the targets base dir; also the working directory.
    pub path: String,
    /// Argv; relative entries are resolved against the target directory.
    pub cmd: Vec<String>,
    #[serde(default)]
    pub input_via_stdin: bool,
    /// Name of the open-oracle target run alongside this one.
    #[serde(default)]
    pub open: Option<String>,
}

/// Built-in registry covering the shipped parser harnesses.
pub fn builtin_targets() -> Vec<TargetSpec> {
    vec![
        TargetSpec {
            name: "json-decoder".to_string(),
            path: "json-decoder".to_string(),
            cmd: vec!["bin/json-decoder".to_string(), "--str-json".to_string()],
            input_via_stdin: false,
            open: None,
        },
        TargetSpec {
            name: "cidrize-runner".to_string(),
            path: "cidrize-runner".to_string(),
            cmd: vec![
                "bin/cidrize-runner".to_string(),
                "--func".to_string(),
                "cidrize".to_string(),
                "--ipstr".to_string(),
            ],
            input_via_stdin: false,
            open: Some("cidrize".to_string()),
        },
        TargetSpec {
            name: "IPv4-IPv6-parser".to_string(),
            path: "IPv4-IPv6-parser".to_string(),
            cmd: vec!["bin/ipv4-parser".to_string(), "--ipstr".to_string()],
            input_via_stdin: false,
            open: Some("ipyparse".to_string()),
        },
        TargetSpec {
            name: "cidrize".to_string(),
            path: "cidrize".to_string(),
            cmd: vec!["bin/cidr".to_string()],
            input_via_stdin: false,
            open: None,
        },
        TargetSpec {
            name: "ipyparse".to_string(),
            path: "ipyparse".to_string(),
            cmd: vec!["bin/ipyparse".to_string()],
            input_via_stdin: true,
            open: None,
        },
    ]
}

/// Known target names, for CLI validation and error messages.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    specs: HashMap<String, TargetSpec>,
    order: Vec<String>,
}

impl TargetRegistry {
    pub fn builtin() -> Self {
        Self::from_specs(builtin_targets())
    }

    pub fn from_specs(specs: Vec<TargetSpec>) -> Self {
        let order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let specs = specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { specs, order }
    }

    /// Load a YAML list of specs, replacing same-named builtin entries.
    pub fn with_overrides(path: &Path) -> Result<Self, TargetError> {
        let text = std::fs::read_to_string(path).map_err(|source| TargetError::RegistryIo {
            path: path.to_path_buf(),
            source,
        })?;
        let overrides: Vec<TargetSpec> =
            serde_yaml::from_str(&text).map_err(|source| TargetError::RegistryParse {
                path: path.to_path_buf(),
                source,
            })?;
        let mut registry = Self::builtin();
        for spec in overrides {
            if !registry.specs.contains_key(&spec.name) {
                registry.order.push(spec.name.clone());
            }
            registry.specs.insert(spec.name.clone(), spec);
        }
        Ok(registry)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, name: &str) -> Result<&TargetSpec, TargetError> {
        self.specs.get(name).ok_or_else(|| TargetError::UnknownTarget {
            name: name.to_string(),
            known: self.order.join(", "),
        })
    }
}

/// Anything that can execute one pre-mutated input against the target.
pub trait TargetRunner: Send + Sync {
    fn run(&self, input: &[u8]) -> Result<ParserResult, TargetError>;

    fn target_name(&self) -> &str;
}

/// Subprocess-backed runner for a registered target and its oracle.
pub struct CommandTarget {
    registry: TargetRegistry,
    base_dir: PathBuf,
    name: String,
    timeout: Duration,
}

impl CommandTarget {
    pub fn new(
        registry: TargetRegistry,
        base_dir: &Path,
        name: &str,
        timeout: Duration,
    ) -> Result<Self, TargetError> {
        registry.get(name)?;
        Ok(Self {
            registry,
            base_dir: base_dir.to_path_buf(),
            name: name.to_string(),
            timeout,
        })
    }

    fn run_one(
        &self,
        spec: &TargetSpec,
        input: &[u8],
    ) -> Result<(TargetResult, Option<TargetResult>), TargetError> {
        let target_dir = self.base_dir.join(&spec.path);
        if !target_dir.is_dir() {
            return Err(TargetError::MissingTargetDir(target_dir));
        }

        if spec.cmd.is_empty() {
            let mut result = TargetResult::with_status("error");
            result.target = Some(spec.name.clone());
            return Ok((result, None));
        }

        let mut argv = Vec::with_capacity(spec.cmd.len() + 1);
        for part in &spec.cmd {
            let candidate = target_dir.join(part);
            if !Path::new(part).is_absolute() && candidate.exists() {
                argv.push(candidate.to_string_lossy().into_owned());
            } else {
                argv.push(part.clone());
            }
        }
        if !spec.input_via_stdin {
            argv.push(String::from_utf8_lossy(input).into_owned());
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&target_dir)
            .stdin(if spec.input_via_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::debug!(target_name = %spec.name, error = %err, "spawn failed");
                let mut result = TargetResult::with_status("crash");
                result.target = Some(spec.name.clone());
                result.bug_signature = Some(BugSignature {
                    kind: Some("spawn".to_string()),
                    message: Some(err.to_string()),
                    ..BugSignature::default()
                });
                return Ok((result, None));
            }
        };

        if spec.input_via_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                use std::io::Write;
                // A target that exits early may close the pipe; that is its
                // answer, not ours to fail on.
                let _ = stdin.write_all(input);
            }
        }

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TargetError::Io {
                        target: spec.name.clone(),
                        source,
                    });
                }
            }
        };

        let stdout = join_pipe_reader(stdout_reader);
        let stderr = join_pipe_reader(stderr_reader);

        let Some(exit) = exit else {
            let mut result = TargetResult::with_status("timeout");
            result.target = Some(spec.name.clone());
            return Ok((result, None));
        };

        let (mut result, embedded_open) = match serde_json::from_slice::<WireResult>(&stdout) {
            Ok(wire) => (wire.closed, wire.open_result),
            Err(_) => {
                // Harness did not speak the JSON contract; classify from the
                // exit code alone.
                (
                    TargetResult::with_status(if exit.success() { "ok" } else { "crash" }),
                    None,
                )
            }
        };
        if result.status.is_empty() {
            result.status = if exit.success() { "ok" } else { "crash" }.to_string();
        }
        result.target = Some(spec.name.clone());
        if !exit.success() && !is_bug_class(&result.normalized_status()) {
            result.status = "crash".to_string();
        }
        if result.bug_signature.is_none() && !stderr.is_empty() && !exit.success() {
            result.bug_signature = Some(BugSignature {
                kind: Some("message".to_string()),
                message: Some(String::from_utf8_lossy(&stderr).trim().chars().take(500).collect()),
                ..BugSignature::default()
            });
        }
        Ok((result, embedded_open))
    }
}

impl TargetRunner for CommandTarget {
    fn run(&self, input: &[u8]) -> Result<ParserResult, TargetError> {
        let spec = self.registry.get(&self.name)?.clone();
        let (closed, embedded_open) = self.run_one(&spec, input)?;
        // A harness that already ran its oracle embeds the reply; otherwise
        // the registered open target runs on the same input.
        let open = match (embedded_open, &spec.open) {
            (Some(open), _) => Some(open),
            (None, Some(open_name)) => {
                let open_spec = self.registry.get(open_name)?.clone();
                Some(self.run_one(&open_spec, input)?.0)
            }
            (None, None) => None,
        };
        Ok(ParserResult { closed, open })
    }

    fn target_name(&self) -> &str {
        &self.name
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> Option<std::thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = reader.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn join_pipe_reader(handle: Option<std::thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
