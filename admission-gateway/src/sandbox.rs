use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::worker_pool::{ExecResult, ExecSpec, PoolError, PoolHandle, PoolLane};

const FORBIDDEN_CHARS: &[char] = &[
    '|', '&', ';', '$', '`', '(', ')', '{', '}', '!', '<', '>', '\\', '#', '~',
];

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("command execution is disabled")]
    Disabled,
    #[error("empty command")]
    EmptyCommand,
    #[error("token contains forbidden character: {0}")]
    ForbiddenToken(String),
    #[error("no policy for command '{0}'")]
    UnknownCommand(String),
    #[error("subcommand '{subcommand}' not allowed for '{binary}'")]
    SubcommandNotAllowed { binary: String, subcommand: String },
    #[error("flag '{flag}' is denied for '{binary}'")]
    FlagDenied { binary: String, flag: String },
    #[error("path escapes the jail: {0}")]
    PathOutsideJail(String),
    #[error("symlink component in path: {0}")]
    SymlinkComponent(String),
    #[error("audit log unavailable")]
    AuditUnavailable,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Disabled => "SANDBOX_DISABLED",
            SandboxError::EmptyCommand => "EMPTY_COMMAND",
            SandboxError::ForbiddenToken(_) => "FORBIDDEN_TOKEN",
            SandboxError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            SandboxError::SubcommandNotAllowed { .. } => "SUBCOMMAND_DENIED",
            SandboxError::FlagDenied { .. } => "FLAG_DENIED",
            SandboxError::PathOutsideJail(_) => "PATH_OUTSIDE_JAIL",
            SandboxError::SymlinkComponent(_) => "SYMLINK_REJECTED",
            SandboxError::AuditUnavailable => "AUDIT_UNAVAILABLE",
            SandboxError::Pool(err) => err.code(),
        }
    }
}

/// Per-binary execution policy.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    pub subcommands: Option<&'static [&'static str]>,
    pub denied_flags: &'static [&'static str],
    /// Non-flag arguments are jail-validated paths.
    pub file_command: bool,
    /// Read-only commands may proceed with a degraded warning when the
    /// audit log is unavailable; everything else fails closed.
    pub read_only: bool,
}

pub fn default_policies(agent_binary: &str) -> HashMap<String, CommandPolicy> {
    let mut policies = HashMap::new();
    for name in ["ls", "cat", "head", "tail", "wc"] {
        policies.insert(
            name.to_string(),
            CommandPolicy {
                subcommands: None,
                denied_flags: &[],
                file_command: true,
                read_only: true,
            },
        );
    }
    policies.insert(
        "grep".to_string(),
        CommandPolicy {
            subcommands: None,
            denied_flags: &["-P"],
            file_command: true,
            read_only: true,
        },
    );
    policies.insert(
        "git".to_string(),
        CommandPolicy {
            subcommands: Some(&["status", "log", "diff", "show"]),
            denied_flags: &["--exec-path", "--upload-pack"],
            file_command: false,
            read_only: true,
        },
    );
    policies.insert(
        "rm".to_string(),
        CommandPolicy {
            subcommands: None,
            denied_flags: &["-r", "-f", "--recursive", "--force", "--no-preserve-root"],
            file_command: true,
            read_only: false,
        },
    );
    policies.insert(
        agent_binary.to_string(),
        CommandPolicy {
            subcommands: None,
            denied_flags: &[],
            file_command: true,
            read_only: false,
        },
    );
    policies
}

/// Whitespace tokenization with a hard reject on shell metacharacters;
/// there is no shell between the gateway and the child process.
pub fn tokenize(command_line: &str) -> Result<Vec<String>, SandboxError> {
    let tokens: Vec<String> = command_line
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return Err(SandboxError::EmptyCommand);
    }
    for token in &tokens {
        if token.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
            return Err(SandboxError::ForbiddenToken(token.clone()));
        }
    }
    Ok(tokens)
}

fn flag_denied(denied: &[&str], token: &str) -> Option<String> {
    if !token.starts_with('-') {
        return None;
    }
    let name = token.split_once('=').map(|(name, _)| name).unwrap_or(token);
    if denied.contains(&name) {
        return Some(name.to_string());
    }
    // combined short flags: -rf trips a denied -r or -f
    if !token.starts_with("--") && token.len() > 2 {
        for flag in denied {
            if let Some(short) = flag.strip_prefix('-') {
                if short.len() == 1 && token[1..].contains(short) {
                    return Some((*flag).to_string());
                }
            }
        }
    }
    None
}

/// Jail check: walk every component, rejecting any symlink along the way,
/// then require the walked path to stay under the (already canonical)
/// jail root. Rejecting symlink components keeps the lexical walk honest
/// even for targets that resolve back inside the jail.
pub fn validate_path(jail_root: &Path, raw: &str) -> Result<PathBuf, SandboxError> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        jail_root.join(candidate)
    };

    let mut walked = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::RootDir => walked.push("/"),
            Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                walked.pop();
            }
            Component::Normal(part) => {
                walked.push(part);
                if let Ok(meta) = std::fs::symlink_metadata(&walked) {
                    if meta.file_type().is_symlink() {
                        return Err(SandboxError::SymlinkComponent(
                            walked.display().to_string(),
                        ));
                    }
                }
            }
        }
    }

    if walked == jail_root || walked.starts_with(jail_root) {
        Ok(walked)
    } else {
        Err(SandboxError::PathOutsideJail(raw.to_string()))
    }
}

// ---------------- Secret redaction ----------------

static KEY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"dk_key_[0-9a-f]{16}\.[A-Za-z0-9_-]{43}").expect("static regex"),
        Regex::new(r"\bsk-[A-Za-z0-9_-]{20,}\b").expect("static regex"),
    ]
});

static KV_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(key|token|secret|password)(\s*[:=]\s*)[^\s'\x22]{8,}").expect("static regex")
});

#[derive(Clone, Default)]
pub struct SecretRedactor {
    known: Vec<String>,
}

impl SecretRedactor {
    pub fn new(known: Vec<String>) -> Self {
        Self {
            known: known.into_iter().filter(|value| value.len() >= 8).collect(),
        }
    }

    pub fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        for value in &self.known {
            output = output.replace(value, "[REDACTED]");
        }
        for pattern in KEY_PATTERNS.iter() {
            output = pattern.replace_all(&output, "[REDACTED]").into_owned();
        }
        output = KV_PATTERN.replace_all(&output, "$1$2[REDACTED]").into_owned();
        output
    }
}

// ---------------- Executor ----------------

pub struct SandboxExecutor {
    enabled: bool,
    jail_root: PathBuf,
    policies: HashMap<String, CommandPolicy>,
    binaries: HashMap<String, PathBuf>,
    audit: AuditLog,
    pool: PoolHandle,
    redactor: SecretRedactor,
    default_timeout_ms: u64,
    max_output_bytes: usize,
}

impl SandboxExecutor {
    /// Canonicalizes the jail root and resolves every policy binary to its
    /// realpath once, at construction.
    pub fn new(
        enabled: bool,
        jail_root: &Path,
        policies: HashMap<String, CommandPolicy>,
        audit: AuditLog,
        pool: PoolHandle,
        redactor: SecretRedactor,
        default_timeout_ms: u64,
        max_output_bytes: usize,
    ) -> Result<Self, SandboxError> {
        let jail_root = std::fs::canonicalize(jail_root)
            .map_err(|_| SandboxError::PathOutsideJail(jail_root.display().to_string()))?;
        let mut binaries = HashMap::new();
        for name in policies.keys() {
            match resolve_binary(name) {
                Some(path) => {
                    binaries.insert(name.clone(), path);
                }
                None => warn!(binary = %name, "policy binary not found on PATH; disabled"),
            }
        }
        Ok(Self {
            enabled,
            jail_root,
            policies,
            binaries,
            audit,
            pool,
            redactor,
            default_timeout_ms,
            max_output_bytes,
        })
    }

    pub fn jail_root(&self) -> &Path {
        &self.jail_root
    }

    pub async fn execute(
        &self,
        command_line: &str,
        lane: PoolLane,
        session_id: Option<String>,
    ) -> Result<ExecResult, SandboxError> {
        match self.check(command_line) {
            Ok((binary, tokens, policy)) => {
                self.dispatch(binary, tokens, policy, lane, session_id).await
            }
            Err(err) => {
                let entry = AuditEntry::now(
                    AuditAction::Deny,
                    command_line.split_whitespace().next().unwrap_or(""),
                    Vec::new(),
                )
                .with_reason(err.code());
                if let Err(audit_err) = self.audit.append(&entry).await {
                    warn!(error = %audit_err, "audit append failed on deny");
                }
                Err(err)
            }
        }
    }

    fn check(
        &self,
        command_line: &str,
    ) -> Result<(PathBuf, Vec<String>, CommandPolicy), SandboxError> {
        if !self.enabled {
            return Err(SandboxError::Disabled);
        }
        let tokens = tokenize(command_line)?;
        let name = tokens[0].clone();
        let policy = self
            .policies
            .get(&name)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownCommand(name.clone()))?;

        let mut args = tokens[1..].iter();
        if let Some(allowed) = policy.subcommands {
            let subcommand = args
                .next()
                .ok_or_else(|| SandboxError::SubcommandNotAllowed {
                    binary: name.clone(),
                    subcommand: "<none>".to_string(),
                })?;
            if !allowed.contains(&subcommand.as_str()) {
                return Err(SandboxError::SubcommandNotAllowed {
                    binary: name,
                    subcommand: subcommand.clone(),
                });
            }
        }

        for token in args.clone() {
            if let Some(flag) = flag_denied(policy.denied_flags, token) {
                return Err(SandboxError::FlagDenied { binary: name, flag });
            }
        }

        if policy.file_command {
            for token in args.filter(|token| !token.starts_with('-')) {
                validate_path(&self.jail_root, token)?;
            }
        }

        let binary = self
            .binaries
            .get(&name)
            .cloned()
            .ok_or(SandboxError::UnknownCommand(name))?;
        Ok((binary, tokens, policy))
    }

    async fn dispatch(
        &self,
        binary: PathBuf,
        tokens: Vec<String>,
        policy: CommandPolicy,
        lane: PoolLane,
        session_id: Option<String>,
    ) -> Result<ExecResult, SandboxError> {
        let command = tokens[0].clone();
        let args: Vec<String> = tokens[1..].to_vec();

        let allow_entry = AuditEntry::now(AuditAction::Allow, &command, args.clone());
        if let Err(err) = self.audit.append(&allow_entry).await {
            if policy.read_only {
                warn!(error = %err, command = %command, "audit degraded; read-only command proceeds");
            } else {
                warn!(error = %err, command = %command, "audit unavailable; failing closed");
                return Err(SandboxError::AuditUnavailable);
            }
        }

        let spec = ExecSpec {
            binary,
            args: args.clone(),
            cwd: self.jail_root.clone(),
            timeout_ms: self.default_timeout_ms,
            env: sanitized_env(&self.jail_root),
            max_output_bytes: self.max_output_bytes,
            session_id,
        };
        let mut result = self.pool.execute(lane, spec).await?;

        result.stdout = self.redactor.redact(&result.stdout);
        result.stderr = self.redactor.redact(&result.stderr);
        debug!(command = %command, exit = result.exit_code, "sandboxed command finished");

        let mut update = AuditEntry::now(AuditAction::Update, &command, args);
        update.duration = Some(result.duration_ms);
        update.output_size = Some(result.stdout.len() + result.stderr.len());
        if let Err(err) = self.audit.append(&update).await {
            warn!(error = %err, "audit append failed post-exec");
        }

        Ok(result)
    }
}

fn sanitized_env(jail_root: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env.insert("HOME".to_string(), jail_root.display().to_string());
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env
}

fn resolve_binary(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        return std::fs::canonicalize(name).ok();
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return std::fs::canonicalize(candidate).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_rejects_shell_metacharacters() {
        for line in [
            "ls | grep x",
            "cat a;b",
            "echo $(id)",
            "cat <(secret)",
            "ls `pwd`",
            "cat a&",
            "grep x file#1",
        ] {
            assert!(tokenize(line).is_err(), "accepted: {line}");
        }
        assert_eq!(tokenize("ls -l src").unwrap(), vec!["ls", "-l", "src"]);
    }

    #[test]
    fn denied_flags_cover_all_forms() {
        let denied = &["-f", "--force", "-r"];
        assert_eq!(flag_denied(denied, "-f").as_deref(), Some("-f"));
        assert_eq!(flag_denied(denied, "--force").as_deref(), Some("--force"));
        assert_eq!(flag_denied(denied, "--force=yes").as_deref(), Some("--force"));
        assert_eq!(flag_denied(denied, "-rf").as_deref(), Some("-r"));
        assert!(flag_denied(denied, "-l").is_none());
        assert!(flag_denied(denied, "file").is_none());
    }

    #[test]
    fn redactor_masks_known_values_and_patterns() {
        let redactor = SecretRedactor::new(vec!["super-secret-value".to_string()]);
        let input = "a=super-secret-value key: abcdefgh12345 plain dk_key_0123456789abcdef.AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let output = redactor.redact(input);
        assert!(!output.contains("super-secret-value"));
        assert!(!output.contains("abcdefgh12345"));
        assert!(!output.contains("dk_key_0123456789abcdef"));
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn short_values_are_not_registered_as_known_secrets() {
        let redactor = SecretRedactor::new(vec!["ab".to_string()]);
        assert_eq!(redactor.redact("cabbage"), "cabbage");
    }
}
