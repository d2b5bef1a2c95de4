use nix::sys::signal::Signal;
use nsgate_core::{Error, ExitOutcome, IdKind, IdMapRange, ProcessId, Result};
use nsgate_namespace::*;
use std::cell::RefCell;
use std::path::PathBuf;

/// Check if running as root
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Records every mapping call and optionally fails one kind
#[derive(Default)]
struct RecordingMapper {
    calls: RefCell<Vec<(IdKind, ProcessId, Vec<IdMapRange>)>>,
    fail_on: Option<IdKind>,
}

impl RecordingMapper {
    fn failing_on(kind: IdKind) -> Self {
        Self {
            fail_on: Some(kind),
            ..Self::default()
        }
    }

    fn kinds(&self) -> Vec<IdKind> {
        self.calls.borrow().iter().map(|(kind, _, _)| *kind).collect()
    }
}

impl IdMapper for RecordingMapper {
    fn map(&self, kind: IdKind, target: ProcessId, ranges: &[IdMapRange]) -> Result<()> {
        self.calls.borrow_mut().push((kind, target, ranges.to_vec()));

        if self.fail_on == Some(kind) {
            return Err(Error::Mapping {
                kind,
                message: "refused by test".to_string(),
            });
        }
        Ok(())
    }
}

/// No namespaces at all: exercises the clone/handshake/reap path without privileges
fn unprivileged() -> NamespaceRequest {
    NamespaceRequest::new().with_mount(false).with_pid(false)
}

fn user_mode(args: &[&str]) -> IsolationMode {
    IsolationMode::UserNamespace(IdMapping::parse_args(args).unwrap())
}

/// Unique marker path the command creates if it ever runs
fn marker(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("nsgate-{name}-{}", std::process::id()))
}

#[test]
fn test_exit_code_is_returned_unchanged() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces).with_request(unprivileged());

    let outcome = executor.execute(&["sh", "-c", "exit 7"]).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(7));

    let outcome = executor.execute(&["true"]).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));
}

#[test]
fn test_signal_death_is_reported() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces).with_request(unprivileged());

    let outcome = executor.execute(&["sh", "-c", "kill -TERM $$"]).unwrap();
    assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGTERM));
}

#[test]
fn test_missing_command_exit_code() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces).with_request(unprivileged());

    let outcome = executor.execute(&["/nonexistent/nsgate-test-binary"]).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(127));
}

#[test]
fn test_empty_command_is_config_error() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces).with_request(unprivileged());

    let empty: &[&str] = &[];
    let err = executor.execute(empty).unwrap_err();
    assert!(err.is_config());
}

#[test]
fn test_uid_then_gid_mapping_before_exec() {
    let mapper = RecordingMapper::default();
    let executor = NamespaceExecutor::new(user_mode(&[
        "u", "0", "100000", "65536", "g", "0", "200000", "1", "1", "300000", "9",
    ]))
    .with_request(unprivileged())
    .with_mapper(&mapper);

    let outcome = executor.execute(&["true"]).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));

    assert_eq!(mapper.kinds(), vec![IdKind::Uid, IdKind::Gid]);

    let calls = mapper.calls.borrow();
    let (_, uid_pid, uid_ranges) = &calls[0];
    let (_, gid_pid, gid_ranges) = &calls[1];
    assert_eq!(uid_pid, gid_pid);
    assert_eq!(uid_ranges.len(), 1);
    assert_eq!(
        gid_ranges
            .iter()
            .map(|r| (r.namespace_start(), r.host_start(), r.count()))
            .collect::<Vec<_>>(),
        vec![(0, 200_000, 1), (1, 300_000, 9)]
    );
}

#[test]
fn test_uid_only_skips_gid_mapping() {
    let mapper = RecordingMapper::default();
    let executor = NamespaceExecutor::new(user_mode(&["u", "0", "100000", "65536"]))
        .with_request(unprivileged())
        .with_mapper(&mapper);

    executor.execute(&["true"]).unwrap();
    assert_eq!(mapper.kinds(), vec![IdKind::Uid]);
}

#[test]
fn test_uid_mapping_failure_never_runs_command() {
    let path = marker("uid-fail");
    let _ = std::fs::remove_file(&path);

    let mapper = RecordingMapper::failing_on(IdKind::Uid);
    let executor = NamespaceExecutor::new(user_mode(&[
        "u", "0", "100000", "65536", "g", "0", "100000", "65536",
    ]))
    .with_request(unprivileged())
    .with_mapper(&mapper);

    let script = format!("touch {}", path.display());
    let err = executor.execute(&["sh", "-c", script.as_str()]).unwrap_err();

    assert!(matches!(err, Error::Mapping { kind: IdKind::Uid, .. }));
    // The gid map is never attempted once the uid map failed
    assert_eq!(mapper.kinds(), vec![IdKind::Uid]);
    assert!(!path.exists(), "command ran despite mapping failure");
}

#[test]
fn test_gid_mapping_failure_never_runs_command() {
    let path = marker("gid-fail");
    let _ = std::fs::remove_file(&path);

    let mapper = RecordingMapper::failing_on(IdKind::Gid);
    let executor = NamespaceExecutor::new(user_mode(&[
        "u", "0", "100000", "65536", "g", "0", "100000", "65536",
    ]))
    .with_request(unprivileged())
    .with_mapper(&mapper);

    let script = format!("touch {}", path.display());
    let err = executor.execute(&["sh", "-c", script.as_str()]).unwrap_err();

    assert!(matches!(err, Error::Mapping { kind: IdKind::Gid, .. }));
    assert_eq!(mapper.kinds(), vec![IdKind::Uid, IdKind::Gid]);
    assert!(!path.exists(), "command ran despite mapping failure");
}

#[test]
fn test_failing_mapping_tool_is_mapping_error() {
    let mapper = ShadowIdMapper::new().with_newuidmap("false");
    let executor = NamespaceExecutor::new(user_mode(&["u", "0", "100000", "65536"]))
        .with_request(unprivileged())
        .with_mapper(mapper);

    let err = executor.execute(&["true"]).unwrap_err();
    assert!(matches!(err, Error::Mapping { kind: IdKind::Uid, .. }));
}

#[test]
fn test_namespaces_need_privileges() {
    // Skip if running as root
    if is_root() {
        return;
    }

    let executor = NamespaceExecutor::new(IsolationMode::Namespaces);
    let err = executor.execute(&["true"]).unwrap_err();
    assert!(matches!(err, Error::Resource { .. }), "got {err}");
}

#[test]
#[ignore] // Requires root
fn test_pid_namespace_has_fresh_proc() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces);

    // PID 1 is the namespace init; the command runs right under it
    let outcome = executor
        .execute(&["sh", "-c", "test $$ -eq 2 && test -d /proc/1 && test -d /proc/2"])
        .unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));
}

#[test]
#[ignore] // Requires root
fn test_exit_code_through_namespace_init() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces);

    let outcome = executor.execute(&["sh", "-c", "exit 42"]).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(42));

    let outcome = executor.execute(&["/nonexistent/nsgate-test-binary"]).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(127));
}

#[test]
#[ignore] // Requires root
fn test_self_signal_kills_command_in_pid_namespace() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces);

    let outcome = executor
        .execute(&["sh", "-c", "kill -TERM $$; echo survived"])
        .unwrap();
    assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGTERM));
}

#[test]
#[ignore] // Requires root
fn test_proc_mount_failure_is_protocol_error() {
    let executor = NamespaceExecutor::new(IsolationMode::Namespaces)
        .with_proc_mount("/nonexistent/nsgate-proc");

    // Returns instead of hanging: the child exits without signaling readiness
    let err = executor.execute(&["true"]).unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "got {err}");
}

#[test]
#[ignore] // Requires root
fn test_mounts_do_not_propagate() {
    let dir = marker("mnt");
    std::fs::create_dir_all(&dir).unwrap();

    let executor = NamespaceExecutor::new(IsolationMode::Namespaces);
    let script = format!("mount -t tmpfs none {0} && touch {0}/inside", dir.display());
    let outcome = executor.execute(&["sh", "-c", script.as_str()]).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));

    assert!(!dir.join("inside").exists());
    std::fs::remove_dir_all(&dir).ok();
}
