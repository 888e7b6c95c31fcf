//! Integration tests exercising the supervisor against real child
//! processes: graceful vs forced termination, orphan cleanup, and the
//! watchdog driving teardown through the shared stop path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pacekeeper_core::{MemoryWatchdog, Supervisor, SupervisorConfig, WatchdogConfig};

/// Tests a cooperative worker exits within the grace period and is
/// never forcibly killed.
#[tokio::test]
async fn graceful_stop_beats_the_grace_period() {
    let supervisor = Supervisor::new(SupervisorConfig { grace_period: Duration::from_secs(5) });
    supervisor.start("cooperative", "sleep", &["30".to_string()]).unwrap();

    let started = Instant::now();
    assert!(supervisor.stop("cooperative").await.unwrap());
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "SIGTERM should take down `sleep` well before the grace period"
    );
    assert!(!supervisor.is_running("cooperative"));
}

/// Tests a worker that ignores SIGTERM is forcibly killed once the
/// grace period elapses.
#[tokio::test]
async fn stubborn_worker_is_force_killed() {
    let supervisor =
        Supervisor::new(SupervisorConfig { grace_period: Duration::from_millis(300) });
    supervisor
        .start(
            "stubborn",
            "sh",
            &["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
        )
        .unwrap();

    // Let the shell install its trap before we signal it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    assert!(supervisor.stop("stubborn").await.unwrap());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "Grace period must elapse first");
    assert!(elapsed < Duration::from_secs(5), "Kill must not wait out the sleep");
    assert!(!supervisor.is_running("stubborn"));
}

/// Tests orphan cleanup kills an untracked process whose command line
/// carries the worker signature, while leaving tracked workers alone.
#[tokio::test]
async fn orphan_cleanup_spares_tracked_workers() {
    let signature = format!("pacekeeper-worker-{}", std::process::id());

    // An orphan: spawned outside the supervisor, signature in argv.
    let mut orphan = std::process::Command::new("sh")
        .arg("-c")
        .arg("sleep 30")
        .arg(&signature)
        .spawn()
        .unwrap();

    let supervisor = Supervisor::with_defaults();
    supervisor
        .start(
            "tracked",
            "sh",
            &["-c".to_string(), "sleep 30".to_string(), signature.clone()],
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let killed = supervisor.cleanup_orphans(&signature);
    assert_eq!(killed, 1, "Exactly the untracked process should be terminated");
    assert!(supervisor.is_running("tracked"), "Tracked worker must survive the sweep");

    orphan.wait().unwrap();
    supervisor.stop("tracked").await.unwrap();
}

/// Tests cleanup with a signature no process carries is a no-op.
#[tokio::test]
async fn orphan_cleanup_without_matches_is_noop() {
    let supervisor = Supervisor::with_defaults();
    assert_eq!(supervisor.cleanup_orphans("no-such-worker-signature-anywhere"), 0);
}

/// Tests the watchdog tears an over-budget worker down through the
/// supervisor, so the handle table is consistent afterwards.
#[tokio::test]
async fn watchdog_teardown_leaves_consistent_table() {
    let supervisor = Arc::new(Supervisor::with_defaults());
    supervisor.start("hungry", "sleep", &["30".to_string()]).unwrap();
    supervisor.start("modest", "sleep", &["30".to_string()]).unwrap();

    // One-byte budget: every real process is over it, so the watchdog
    // must stop both workers through the regular stop path.
    let config = WatchdogConfig { interval: Duration::from_millis(50), memory_limit_bytes: 1 };
    let watchdog = MemoryWatchdog::spawn(Arc::clone(&supervisor), config).unwrap();

    let mut drained = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if supervisor.running_workers().is_empty() {
            drained = true;
            break;
        }
    }
    watchdog.shutdown().await;

    assert!(drained, "Watchdog should stop every over-budget worker");
    assert!(!supervisor.is_running("hungry"));
    assert!(!supervisor.is_running("modest"));
}
