//! Pipe-drain regression: a child that pushes well past the kernel pipe
//! buffer on both streams at once must be fully captured. A sequential-read
//! implementation deadlocks here because the unread pipe fills while the
//! other is drained.

use tokio_util::sync::CancellationToken;

use agentium::repo::{CommandSpec, run_child, system_runner};

const MEGS: usize = 2 * 1024 * 1024;

#[tokio::test]
async fn two_megabytes_on_each_stream_are_fully_captured() {
    let script = format!(
        "( yes a | head -c {MEGS} ) & ( yes b | head -c {MEGS} >&2 ) & wait"
    );
    let spec = CommandSpec::new("sh", &["-c", &script]);
    let child = (system_runner())(&spec).unwrap();

    let output = tokio::time::timeout(
        std::time::Duration::from_secs(60),
        run_child(child, None, &CancellationToken::new()),
    )
    .await
    .expect("drain must not deadlock")
    .unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout.len(), MEGS, "stdout must be captured in full");
    assert_eq!(output.stderr.len(), MEGS, "stderr must be captured in full");
    assert!(output.stdout.bytes().all(|b| b == b'a' || b == b'\n'));
    assert!(output.stderr.bytes().all(|b| b == b'b' || b == b'\n'));
}

#[tokio::test]
async fn interleaved_writers_preserve_stream_separation() {
    // Alternating writers small enough to finish fast, large enough to wrap
    // the pipe buffer several times.
    let script = "i=0; while [ $i -lt 2000 ]; do echo stdout-$i; echo stderr-$i >&2; i=$((i+1)); done";
    let spec = CommandSpec::new("sh", &["-c", script]);
    let child = (system_runner())(&spec).unwrap();
    let output = run_child(child, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.stdout.lines().count(), 2000);
    assert_eq!(output.stderr.lines().count(), 2000);
    assert!(output.stdout.lines().all(|l| l.starts_with("stdout-")));
    assert!(output.stderr.lines().all(|l| l.starts_with("stderr-")));
}
