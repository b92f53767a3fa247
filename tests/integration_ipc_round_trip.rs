#![cfg(target_os = "linux")]

use anyhow::Result;
use perf_suite::ipc::{run_transfer, ChannelNames};
use std::path::Path;
use std::time::Duration;

const SEGMENT_BYTES: usize = 16 * 1024 * 1024;
const LATENCY_SLOTS: usize = 4096;

/// Named objects live under /dev/shm; semaphores carry a `sem.` prefix.
fn names_removed(names: &ChannelNames) -> bool {
    let shm = Path::new("/dev/shm");
    let gone = |name: &str| !shm.join(name.trim_start_matches('/')).exists();
    let sem_gone = |name: &str| !shm.join(format!("sem.{}", name.trim_start_matches('/'))).exists();
    gone(&names.shared_memory) && sem_gone(&names.producer_semaphore) && sem_gone(&names.consumer_semaphore)
}

/// Every message size crosses the process boundary exactly once, intact,
/// and leaves no named objects behind.
#[test]
fn shm_transfer_across_message_sizes() -> Result<()> {
    for size in [64, 1024, 64 * 1024, 1024 * 1024] {
        let outcome = run_transfer(size, Duration::from_millis(250), SEGMENT_BYTES, LATENCY_SLOTS)?;

        assert!(outcome.messages_sent > 0, "no {} byte messages sent", size);
        assert_eq!(outcome.messages_consumed, outcome.messages_sent, "{} byte delivery", size);
        assert_eq!(outcome.messages_corrupt, 0, "{} byte corruption", size);
        assert_eq!(outcome.bytes_transferred, outcome.messages_sent * size as u64);
        assert!(outcome.latencies.count() > 0);
        assert!(outcome.latencies.min() >= 0.0);
        assert!(names_removed(&outcome.names), "leaked names for {} byte run", size);
    }
    Ok(())
}

/// A payload larger than the segment is refused before anything is forked.
#[test]
fn oversized_message_is_rejected() {
    let result = run_transfer(2 * SEGMENT_BYTES, Duration::from_millis(50), SEGMENT_BYTES, LATENCY_SLOTS);
    assert!(result.is_err());
}
