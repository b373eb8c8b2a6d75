use std::collections::HashMap;
use std::sync::Arc;

use admission_gateway::audit::AuditLog;
use admission_gateway::sandbox::{
    default_policies, validate_path, CommandPolicy, SandboxError, SandboxExecutor, SecretRedactor,
};
use admission_gateway::worker_pool::{PoolConfig, PoolHandle, PoolLane, SubprocessRunner};
use tempfile::TempDir;

fn jail() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data/notes.txt"), "hello\n").unwrap();
    dir
}

fn executor(jail: &TempDir, enabled: bool) -> SandboxExecutor {
    let pool = PoolHandle::start(PoolConfig::default(), Arc::new(SubprocessRunner));
    SandboxExecutor::new(
        enabled,
        jail.path(),
        default_policies("loa-agent"),
        AuditLog::new(jail.path().join("audit.log")),
        pool,
        SecretRedactor::new(Vec::new()),
        5_000,
        1 << 16,
    )
    .unwrap()
}

#[test]
fn paths_inside_the_jail_validate() {
    let jail = jail();
    let root = std::fs::canonicalize(jail.path()).unwrap();
    assert!(validate_path(&root, "data/notes.txt").is_ok());
    assert!(validate_path(&root, "data/new-file.txt").is_ok());
    let absolute = root.join("data/notes.txt");
    assert!(validate_path(&root, absolute.to_str().unwrap()).is_ok());
}

#[test]
fn traversal_and_absolute_escapes_are_rejected() {
    let jail = jail();
    let root = std::fs::canonicalize(jail.path()).unwrap();
    for escape in ["../outside", "data/../../outside", "/etc/passwd"] {
        match validate_path(&root, escape) {
            Err(SandboxError::PathOutsideJail(_)) => {}
            other => panic!("{escape} should escape the jail, got {other:?}"),
        }
    }
}

#[cfg(unix)]
#[test]
fn any_symlink_component_rejects_even_when_the_target_is_inside() {
    let jail = jail();
    let root = std::fs::canonicalize(jail.path()).unwrap();
    // Symlink pointing back inside the jail: still rejected.
    std::os::unix::fs::symlink(root.join("data"), root.join("alias")).unwrap();
    match validate_path(&root, "alias/notes.txt") {
        Err(SandboxError::SymlinkComponent(_)) => {}
        other => panic!("expected symlink rejection, got {other:?}"),
    }
    // Symlink escaping the jail.
    std::os::unix::fs::symlink("/etc", root.join("sneaky")).unwrap();
    match validate_path(&root, "sneaky/passwd") {
        Err(SandboxError::SymlinkComponent(_)) => {}
        other => panic!("expected symlink rejection, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_executor_fails_closed() {
    let jail = jail();
    let sandbox = executor(&jail, false);
    match sandbox.execute("ls data", PoolLane::Interactive, None).await {
        Err(SandboxError::Disabled) => {}
        other => panic!("expected Disabled, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn allowed_read_only_command_runs_and_audits() {
    let jail = jail();
    let sandbox = executor(&jail, true);
    let result = sandbox
        .execute("ls data", PoolLane::Interactive, Some("s1".to_string()))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("notes.txt"));

    let audit = std::fs::read_to_string(jail.path().join("audit.log")).unwrap();
    let lines: Vec<&str> = audit.lines().collect();
    assert!(lines.len() >= 2, "expected allow + update entries");
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["action"], "allow");
    assert_eq!(first["command"], "ls");
}

#[tokio::test(flavor = "multi_thread")]
async fn jail_escape_in_command_arguments_is_denied_and_audited() {
    let jail = jail();
    let sandbox = executor(&jail, true);
    match sandbox
        .execute("cat /etc/passwd", PoolLane::Interactive, None)
        .await
    {
        Err(SandboxError::PathOutsideJail(_)) => {}
        other => panic!("expected jail rejection, got {other:?}"),
    }
    let audit = std::fs::read_to_string(jail.path().join("audit.log")).unwrap();
    let entry: serde_json::Value = serde_json::from_str(audit.lines().next().unwrap()).unwrap();
    assert_eq!(entry["action"], "deny");
    assert_eq!(entry["reason"], "PATH_OUTSIDE_JAIL");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_commands_and_denied_flags_are_refused() {
    let jail = jail();
    let sandbox = executor(&jail, true);
    match sandbox
        .execute("curl http://x", PoolLane::Interactive, None)
        .await
    {
        Err(SandboxError::UnknownCommand(name)) => assert_eq!(name, "curl"),
        other => panic!("expected UnknownCommand, got {other:?}"),
    }
    match sandbox
        .execute("rm -rf data", PoolLane::Interactive, None)
        .await
    {
        Err(SandboxError::FlagDenied { .. }) => {}
        other => panic!("expected FlagDenied, got {other:?}"),
    }
    match sandbox
        .execute("git push", PoolLane::Interactive, None)
        .await
    {
        Err(SandboxError::SubcommandNotAllowed { subcommand, .. }) => {
            assert_eq!(subcommand, "push")
        }
        other => panic!("expected SubcommandNotAllowed, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_policy_redacts_secrets_in_output() {
    let jail = jail();
    std::fs::write(
        jail.path().join("data/config.txt"),
        "api token=verysecretvalue123 end\n",
    )
    .unwrap();
    let mut policies: HashMap<String, CommandPolicy> = default_policies("loa-agent");
    policies.insert(
        "cat".to_string(),
        CommandPolicy {
            subcommands: None,
            denied_flags: &[],
            file_command: true,
            read_only: true,
        },
    );
    let pool = PoolHandle::start(PoolConfig::default(), Arc::new(SubprocessRunner));
    let sandbox = SandboxExecutor::new(
        true,
        jail.path(),
        policies,
        AuditLog::new(jail.path().join("audit.log")),
        pool,
        SecretRedactor::new(Vec::new()),
        5_000,
        1 << 16,
    )
    .unwrap();

    let result = sandbox
        .execute("cat data/config.txt", PoolLane::Interactive, None)
        .await
        .unwrap();
    assert!(!result.stdout.contains("verysecretvalue123"));
    assert!(result.stdout.contains("[REDACTED]"));
}
