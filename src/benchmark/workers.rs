//! Core-pinned worker pool
//!
//! Workers share two padded atomics: a stop flag they poll and an operation
//! counter they add their batch totals to. Nothing else is shared, so the
//! hot loops never contend on a lock or a common cache line.

use crate::affinity;
use anyhow::{Context, Result};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Threads to spawn for a request: `min(requested, hardware threads)`, at least one
pub fn worker_count(requested: usize) -> usize {
    requested.min(affinity::num_cores()).max(1)
}

/// Shared state handed to every worker
pub struct WorkerContext {
    stop: CachePadded<AtomicBool>,
    operations: CachePadded<AtomicU64>,
    pinned: CachePadded<AtomicUsize>,
}

impl WorkerContext {
    fn new() -> Self {
        Self {
            stop: CachePadded::new(AtomicBool::new(false)),
            operations: CachePadded::new(AtomicU64::new(0)),
            pinned: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Add a finished batch to the shared total
    #[inline]
    pub fn add_operations(&self, count: u64) {
        self.operations.fetch_add(count, Ordering::Relaxed);
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Totals from one pool run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerRun {
    pub threads: usize,
    /// Threads that were bound to a core; pinning failures are not fatal
    pub pinned: usize,
    pub total_operations: u64,
    pub elapsed: Duration,
}

impl WorkerRun {
    pub fn operations_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_operations as f64 / secs
        } else {
            0.0
        }
    }
}

/// Run one pinned thread per entry of `states` for `duration`
///
/// Worker `i` receives `states[i]`, pins itself to core `i` and runs
/// `work(i, state, ctx)`, which must return promptly once
/// [`WorkerContext::should_stop`] is true. Returns after every worker is
/// joined.
pub fn run_pinned_workers<S, F>(states: Vec<S>, duration: Duration, work: F) -> Result<WorkerRun>
where
    S: Send,
    F: Fn(usize, S, &WorkerContext) + Sync,
{
    let threads = states.len();
    let ctx = WorkerContext::new();
    let started = Instant::now();

    std::thread::scope(|s| -> Result<()> {
        let mut handles = Vec::with_capacity(threads);
        for (index, state) in states.into_iter().enumerate() {
            let ctx = &ctx;
            let work = &work;
            let spawned = std::thread::Builder::new()
                .name(format!("bench-worker-{}", index))
                .spawn_scoped(s, move || {
                    if affinity::pin_current_thread(index) {
                        ctx.pinned.fetch_add(1, Ordering::Relaxed);
                    } else {
                        debug!("Worker {} running unpinned", index);
                    }
                    work(index, state, ctx);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Already spawned workers are joined when the scope ends.
                    ctx.request_stop();
                    return Err(e).with_context(|| format!("Failed to spawn worker thread {}", index));
                }
            }
        }

        std::thread::sleep(duration);
        ctx.request_stop();

        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            warn!("{} worker thread(s) panicked", panicked);
            anyhow::bail!("{} of {} worker threads panicked", panicked, threads);
        }
        Ok(())
    })?;

    let elapsed = started.elapsed();
    Ok(WorkerRun {
        threads,
        pinned: ctx.pinned.load(Ordering::Relaxed),
        total_operations: ctx.operations.load(Ordering::Relaxed),
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_is_bounded() {
        assert_eq!(worker_count(0), 1);
        assert_eq!(worker_count(1), 1);
        assert_eq!(worker_count(usize::MAX), affinity::num_cores());
    }

    #[test]
    fn test_operations_are_summed_across_workers() {
        let states = vec![1u64, 2, 3];
        let run = run_pinned_workers(states, Duration::from_millis(20), |_, step, ctx| {
            let mut done = 0;
            while !ctx.should_stop() && done < 10 {
                ctx.add_operations(step);
                done += 1;
            }
        })
        .unwrap();
        assert_eq!(run.threads, 3);
        assert_eq!(run.total_operations, 60);
        assert!(run.pinned <= 3);
        assert!(run.elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn test_workers_observe_stop() {
        let run = run_pinned_workers(vec![(); 2], Duration::from_millis(30), |_, _, ctx| {
            while !ctx.should_stop() {
                ctx.add_operations(1);
                std::thread::yield_now();
            }
        })
        .unwrap();
        assert!(run.total_operations > 0);
        assert!(run.operations_per_second() > 0.0);
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let result = run_pinned_workers(vec![0u8], Duration::from_millis(1), |_, _, _| {
            panic!("worker failure");
        });
        assert!(result.is_err());
    }
}
