//! Execution requests and per-call context

use crate::cancel::CancelSignal;
use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

// =============================================================================
// Language
// =============================================================================

/// Languages a code request may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    Ruby,
    Bash,
    Sh,
    Perl,
}

impl Language {
    /// Parse a language name or common alias
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "javascript" | "js" | "node" | "nodejs" => Some(Self::JavaScript),
            "python" | "python3" | "py" => Some(Self::Python),
            "ruby" | "rb" => Some(Self::Ruby),
            "bash" | "shell" => Some(Self::Bash),
            "sh" => Some(Self::Sh),
            "perl" | "pl" => Some(Self::Perl),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::Python => "python",
            Self::Ruby => "ruby",
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::Perl => "perl",
        }
    }

    /// Interpreter program and arguments that evaluate `code`
    pub fn interpreter(&self, code: &str) -> (String, Vec<String>) {
        let (program, flag) = match self {
            Self::JavaScript => ("node", "-e"),
            Self::Python => ("python3", "-c"),
            Self::Ruby => ("ruby", "-e"),
            Self::Bash => ("bash", "-c"),
            Self::Sh => ("sh", "-c"),
            Self::Perl => ("perl", "-e"),
        };
        (program.to_string(), vec![flag.to_string(), code.to_string()])
    }

    /// Container image used when the config does not pin one
    pub fn default_image(&self) -> &'static str {
        match self {
            Self::JavaScript => "node:20-alpine",
            Self::Python => "python:3.12-alpine",
            Self::Ruby => "ruby:3.3-alpine",
            Self::Bash => "bash:5",
            Self::Sh => "alpine:3.20",
            Self::Perl => "perl:5-slim",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ExecutionRequest
// =============================================================================

/// Run a snippet of code through a language interpreter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub code: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Files written into the workspace before the run, keyed by relative path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

/// Run a program with arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// What to run inside the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionRequest {
    Code(CodeRequest),
    Command(CommandRequest),
}

impl ExecutionRequest {
    /// Create a code execution request
    pub fn code(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self::Code(CodeRequest {
            code: code.into(),
            language: language.into(),
            env: BTreeMap::new(),
            files: BTreeMap::new(),
        })
    }

    /// Create a command execution request
    pub fn command<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Command(CommandRequest {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
        })
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self {
            Self::Code(req) => req.env.insert(key.into(), value.into()),
            Self::Command(req) => req.env.insert(key.into(), value.into()),
        };
        self
    }

    /// Add a workspace file; ignored for command requests
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        if let Self::Code(req) = &mut self {
            req.files.insert(path.into(), content.into());
        }
        self
    }

    /// Set the working directory; ignored for code requests
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        if let Self::Command(req) = &mut self {
            req.cwd = Some(cwd.into());
        }
        self
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Code(req) => &req.env,
            Self::Command(req) => &req.env,
        }
    }

    /// Audit resource name: the language for code, the command otherwise
    pub fn resource_name(&self) -> &str {
        match self {
            Self::Code(req) => &req.language,
            Self::Command(req) => &req.command,
        }
    }

    /// Reject malformed requests
    pub fn validate(&self) -> SandboxResult<()> {
        match self {
            Self::Code(req) => {
                if req.code.trim().is_empty() {
                    return Err(SandboxError::validation("code", "must not be empty"));
                }
                if Language::parse(&req.language).is_none() {
                    return Err(SandboxError::validation(
                        "language",
                        format!("unsupported language '{}'", req.language),
                    ));
                }
                for path in req.files.keys() {
                    validate_relative_path("files", path)?;
                }
            }
            Self::Command(req) => {
                if req.command.trim().is_empty() {
                    return Err(SandboxError::validation("command", "must not be empty"));
                }
                if let Some(cwd) = &req.cwd {
                    validate_relative_path("cwd", cwd)?;
                }
            }
        }

        for key in self.env().keys() {
            if !is_valid_env_name(key) {
                return Err(SandboxError::validation(
                    "env",
                    format!("invalid variable name '{}'", key),
                ));
            }
        }
        Ok(())
    }
}

fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap_or('0').is_ascii_digit()
}

fn validate_relative_path(field: &str, path: &str) -> SandboxResult<()> {
    let parsed = Path::new(path);
    if path.is_empty() || parsed.is_absolute() {
        return Err(SandboxError::validation(
            field,
            format!("'{}' must be a relative path", path),
        ));
    }
    if parsed
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(SandboxError::validation(
            field,
            format!("'{}' must stay inside the workspace", path),
        ));
    }
    Ok(())
}

// =============================================================================
// ExecutionContext
// =============================================================================

/// Per-call context
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Actor for the audit record; no record is emitted without it
    pub user_id: Option<String>,
    /// Overrides the configured timeout for this call
    pub timeout_ms: Option<u64>,
    /// Caller-driven cancellation
    pub cancel: Option<CancelSignal>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}
