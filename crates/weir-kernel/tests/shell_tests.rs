//! Shell scoping and lifecycle tests through the public API.

use std::time::Duration;

use weir_kernel::{
    stage_fn, ProcessState, ShellConfig, ShellContext, ShellError, StageIo, VirtualId,
    WaitOutcome,
};

#[test]
fn child_scope_starts_with_env_only() {
    let mut parent = ShellContext::new(ShellConfig::isolated());
    parent.variable("X", "1");
    parent.export("Y", "2");

    let mut child = parent.subshell();
    assert!(child.vars().is_empty());
    assert_eq!(child.var("Y"), Some("2"));

    child.export("Y", "changed");
    child.unset("Y");
    assert_eq!(parent.var("Y"), Some("2"));
    assert_eq!(parent.var("X"), Some("1"));
}

#[test]
fn nested_subshells_share_one_registry() {
    let root = ShellContext::new(ShellConfig::isolated());
    let child = root.subshell();
    let grandchild = child.subshell();

    let a = root.command("true", Vec::<String>::new());
    let b = child.command("true", Vec::<String>::new());
    let c = grandchild.command("true", Vec::<String>::new());

    assert_eq!(
        [a.id(), b.id(), c.id()],
        [VirtualId(1), VirtualId(2), VirtualId(3)]
    );
    let status = root.status();
    assert_eq!(status.len(), 3);
    assert!(status.iter().all(|s| s.state == ProcessState::Ready));
}

#[tokio::test]
async fn timed_out_wait_leaves_handle_running() {
    let shell = ShellContext::new(ShellConfig::isolated());
    let slow = stage_fn(|_io: StageIo| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, ShellError>(0)
    });
    let handle = shell.function("slow", slow);
    handle.start().unwrap();

    let outcome = handle.wait(Some(Duration::from_millis(20))).await.unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert_eq!(handle.state(), ProcessState::Running);

    handle.kill().await.unwrap();
    assert_eq!(handle.state(), ProcessState::Terminated);
    // Killing again is a no-op.
    handle.kill().await.unwrap();
}

#[tokio::test]
async fn double_start_is_a_state_error() {
    let shell = ShellContext::new(ShellConfig::isolated());
    let handle = shell.function("once", stage_fn(|_io: StageIo| async move { Ok::<_, ShellError>(0) }));
    handle.start().unwrap();
    assert!(matches!(handle.start(), Err(ShellError::State { .. })));
    assert_eq!(handle.state(), ProcessState::Running);

    handle.wait(None).await.unwrap();
    assert!(matches!(handle.start(), Err(ShellError::State { .. })));
    assert_eq!(handle.state(), ProcessState::Terminated);
    assert_eq!(handle.exit_code(), Some(0));
}

#[cfg(unix)]
#[tokio::test]
async fn kill_all_reaches_os_processes_in_subshells() {
    let mut root = ShellContext::new(ShellConfig::isolated());
    if let Ok(path) = std::env::var("PATH") {
        root.export("PATH", path);
    }
    let child = root.subshell();
    let sleeper = child.command("sleep", ["30"]);
    child.registry().start_process(sleeper.id()).unwrap();
    assert!(sleeper.os_pid().is_some());

    tokio::time::timeout(Duration::from_secs(5), root.kill_all())
        .await
        .expect("kill_all hung")
        .unwrap();

    assert_eq!(sleeper.state(), ProcessState::Terminated);
    assert!(!sleeper.is_alive());
    assert_eq!(sleeper.exit_code(), Some(137));
}
