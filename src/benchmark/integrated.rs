//! Multi-subsystem workflows sharing one locked buffer
//!
//! Each workflow runs its roles on scoped threads for a third of the
//! budget. Roles exchange data only through a `parking_lot::Mutex`
//! guarded buffer, and every sleep happens with the lock released.

use super::network::{bind_udp_socket, is_disconnect, is_idle, run_phase, PhaseControl};
use super::{fraction_of, progress};
use crate::metrics::{LatencyStats, Timer};
use crate::results::BenchmarkResult;
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::hint::black_box;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

pub const NAME: &str = "Integrated System";

const MIB: usize = 1024 * 1024;
const DATAGRAM_BYTES: usize = 1024;
const PAGE_BYTES: usize = 4096;
const PIPELINE_BUFFER_BYTES: usize = MIB;
const STAGING_BUFFER_BYTES: usize = 2 * MIB;
const OUTPUT_CHUNK_BYTES: usize = 1024;
const PIPELINE_STAGES: u32 = 3;

/// What one workflow achieved over its window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkflowMetrics {
    pub operations: u64,
    /// Window time per completed operation; 0 when nothing completed
    pub latency_ms: f64,
    pub throughput_ops_sec: f64,
    pub cpu_utilization_percent: f64,
    pub memory_bandwidth_mbps: f64,
}

impl WorkflowMetrics {
    pub fn from_operations(operations: u64, elapsed: Duration, bytes_moved: u64) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self {
                operations,
                ..Default::default()
            };
        }
        Self {
            operations,
            latency_ms: if operations > 0 {
                secs * 1000.0 / operations as f64
            } else {
                0.0
            },
            throughput_ops_sec: operations as f64 / secs,
            cpu_utilization_percent: 0.0,
            memory_bandwidth_mbps: bytes_moved as f64 / MIB as f64 / secs,
        }
    }

    pub fn completed_any(&self) -> bool {
        self.operations > 0
    }
}

/// Busy time as a percentage of `threads` x `elapsed`, capped at 100
pub fn cpu_utilization(busy_ns: u64, elapsed: Duration, threads: u32) -> f64 {
    let capacity = elapsed.as_nanos() as f64 * threads as f64;
    if capacity <= 0.0 {
        return 0.0;
    }
    (busy_ns as f64 / capacity * 100.0).min(100.0)
}

/// Shared flags for the roles of one workflow
#[derive(Debug, Default)]
struct Workflow {
    stop: AtomicBool,
    operations: AtomicU64,
    bytes: AtomicU64,
    busy_ns: AtomicU64,
}

impl Workflow {
    fn running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn add_busy(&self, timer: &Timer) {
        self.busy_ns.fetch_add(timer.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Sleep in short steps until `window` passes or a role stops the run
    fn wait(&self, window: Duration) {
        let deadline = Instant::now() + window;
        while self.running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
        self.stop();
    }

    /// Run a role, stopping the other roles if it fails
    fn role<T>(&self, work: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
        let result = work();
        if result.is_err() {
            self.stop();
        }
        result
    }
}

fn spawn_role<'scope, 'env, T, F>(
    scope: &'scope thread::Scope<'scope, 'env>,
    workflow: &Workflow,
    name: &str,
    work: F,
) -> Result<ScopedJoinHandle<'scope, io::Result<T>>>
where
    T: Send + 'scope,
    F: FnOnce() -> io::Result<T> + Send + 'scope,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn_scoped(scope, work)
        .map_err(|e| {
            workflow.stop();
            anyhow!(e).context(format!("Failed to spawn {} thread", name))
        })
}

fn join_role<T>(handle: ScopedJoinHandle<'_, io::Result<T>>, role: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("{} thread panicked", role))?
        .with_context(|| format!("{} failed", role))
}

/// UDP datagrams copied into a shared memory buffer as they arrive
pub fn network_to_memory(window: Duration) -> Result<WorkflowMetrics> {
    let buffer = Mutex::new(vec![0u8; MIB]);
    let (stored, _sent, elapsed) = run_phase(
        "net-mem",
        window,
        |control| store_datagrams(control, &buffer),
        send_datagrams,
    )?;
    Ok(WorkflowMetrics::from_operations(
        stored,
        elapsed,
        stored * DATAGRAM_BYTES as u64,
    ))
}

fn store_datagrams(control: &PhaseControl, buffer: &Mutex<Vec<u8>>) -> io::Result<u64> {
    let socket = bind_udp_socket()?;
    control.announce(socket.local_addr()?.port());

    let mut datagram = [0u8; DATAGRAM_BYTES];
    let mut stored = 0u64;
    while !control.should_stop() {
        match socket.recv_from(&mut datagram) {
            Ok((n, _)) => {
                let mut memory = buffer.lock();
                let offset = (stored as usize * DATAGRAM_BYTES) % memory.len();
                memory[offset..offset + n].copy_from_slice(&datagram[..n]);
                stored += 1;
            }
            Err(e) if is_idle(&e) || is_disconnect(&e) => thread::sleep(Duration::from_micros(100)),
            Err(e) => return Err(e),
        }
    }
    Ok(stored)
}

fn send_datagrams(control: &PhaseControl, deadline: Instant) -> u64 {
    let Some(port) = control.wait_ready(deadline) else {
        return 0;
    };
    let Ok(socket) = bind_udp_socket() else {
        return 0;
    };
    let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let message = [b'I'; DATAGRAM_BYTES];
    let mut sent = 0u64;
    while Instant::now() < deadline && !control.should_stop() {
        if socket.send_to(&message, target).is_ok() {
            sent += 1;
        }
        thread::sleep(Duration::from_millis(1));
    }
    sent
}

/// A generator fills a staging buffer while a writer drains it to disk
pub fn memory_to_disk(window: Duration, scratch: &mut File) -> Result<WorkflowMetrics> {
    let buffer = Mutex::new(vec![0u8; STAGING_BUFFER_BYTES]);
    let workflow = Workflow::default();
    let started = Instant::now();

    thread::scope(|s| -> Result<()> {
        let generator = spawn_role(s, &workflow, "mem-disk-generator", || {
            workflow.role(|| generate_pages(&workflow, &buffer))
        })?;
        let writer = spawn_role(s, &workflow, "mem-disk-writer", || {
            workflow.role(|| drain_pages(&workflow, &buffer, scratch))
        })?;

        workflow.wait(window);
        join_role(generator, "Generator")?;
        join_role(writer, "Disk writer")?;
        Ok(())
    })?;

    let bytes = workflow.bytes.load(Ordering::Relaxed);
    Ok(WorkflowMetrics::from_operations(
        bytes / PAGE_BYTES as u64,
        started.elapsed(),
        bytes,
    ))
}

fn generate_pages(workflow: &Workflow, buffer: &Mutex<Vec<u8>>) -> io::Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut page = [0u8; PAGE_BYTES];
    let mut offset = 0usize;
    while workflow.running() {
        rng.fill(&mut page[..]);
        {
            let mut memory = buffer.lock();
            if offset + PAGE_BYTES > memory.len() {
                offset = 0;
            }
            memory[offset..offset + PAGE_BYTES].copy_from_slice(&page);
        }
        offset += PAGE_BYTES;
        thread::sleep(Duration::from_micros(100));
    }
    Ok(())
}

fn drain_pages(workflow: &Workflow, buffer: &Mutex<Vec<u8>>, scratch: &mut File) -> io::Result<()> {
    let mut page = [0u8; PAGE_BYTES];
    while workflow.running() {
        page.copy_from_slice(&buffer.lock()[..PAGE_BYTES]);
        scratch.write_all(&page)?;
        scratch.flush()?;
        workflow.bytes.fetch_add(PAGE_BYTES as u64, Ordering::Relaxed);
        thread::sleep(Duration::from_micros(500));
    }
    Ok(())
}

/// Input, processing and output stages contending for one buffer
///
/// CPU utilisation is the share of the window the stages spent doing
/// work rather than sleeping.
pub fn full_pipeline(window: Duration, scratch: &mut File) -> Result<WorkflowMetrics> {
    let buffer = Mutex::new(vec![0u8; PIPELINE_BUFFER_BYTES]);
    let workflow = Workflow::default();
    let started = Instant::now();

    thread::scope(|s| -> Result<()> {
        let input = spawn_role(s, &workflow, "pipeline-input", || {
            workflow.role(|| fill_input(&workflow, &buffer))
        })?;
        let processing = spawn_role(s, &workflow, "pipeline-process", || {
            workflow.role(|| process_buffer(&workflow, &buffer))
        })?;
        let output = spawn_role(s, &workflow, "pipeline-output", || {
            workflow.role(|| write_output(&workflow, &buffer, scratch))
        })?;

        workflow.wait(window);
        join_role(input, "Input stage")?;
        join_role(processing, "Processing stage")?;
        join_role(output, "Output stage")?;
        Ok(())
    })?;

    let elapsed = started.elapsed();
    let ops = workflow.operations.load(Ordering::Relaxed);
    let mut metrics = WorkflowMetrics::from_operations(ops, elapsed, ops * PIPELINE_BUFFER_BYTES as u64);
    metrics.cpu_utilization_percent = cpu_utilization(
        workflow.busy_ns.load(Ordering::Relaxed),
        elapsed,
        PIPELINE_STAGES,
    );
    Ok(metrics)
}

fn fill_input(workflow: &Workflow, buffer: &Mutex<Vec<u8>>) -> io::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    while workflow.running() {
        let timer = Timer::new();
        {
            let mut memory = buffer.lock();
            for word in memory.chunks_exact_mut(4) {
                word.copy_from_slice(&rng.gen::<u32>().to_ne_bytes());
            }
        }
        workflow.operations.fetch_add(1, Ordering::Relaxed);
        workflow.add_busy(&timer);
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn process_buffer(workflow: &Workflow, buffer: &Mutex<Vec<u8>>) -> io::Result<()> {
    while workflow.running() {
        let timer = Timer::new();
        let mut acc = 0.0f64;
        {
            let memory = buffer.lock();
            for word in memory.chunks_exact(4) {
                let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) as f64;
                acc += value.sin() * value.cos();
            }
        }
        black_box(acc);
        workflow.add_busy(&timer);
        thread::sleep(Duration::from_micros(500));
    }
    Ok(())
}

fn write_output(workflow: &Workflow, buffer: &Mutex<Vec<u8>>, scratch: &mut File) -> io::Result<()> {
    let mut chunk = [0u8; OUTPUT_CHUNK_BYTES];
    while workflow.running() {
        let timer = Timer::new();
        chunk.copy_from_slice(&buffer.lock()[..OUTPUT_CHUNK_BYTES]);
        scratch.write_all(&chunk)?;
        workflow.add_busy(&timer);
        thread::sleep(Duration::from_millis(5));
    }
    scratch.flush()
}

#[derive(Debug, Clone, Default)]
pub struct IntegratedBenchmark {
    dir: Option<PathBuf>,
}

impl IntegratedBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for the workflows' scratch files
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    fn scratch_file(&self, prefix: &str) -> Result<tempfile::NamedTempFile> {
        let dir = self.dir.clone().unwrap_or_else(std::env::temp_dir);
        tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&dir)
            .with_context(|| format!("Failed to create scratch file in {}", dir.display()))
    }

    pub(crate) fn execute(&self, duration_seconds: u32, _iterations: u32, verbose: bool) -> Result<BenchmarkResult> {
        let window = fraction_of(duration_seconds, 3);

        progress!(verbose, "Running network to memory workflow for {:?}", window);
        let net_mem = network_to_memory(window)?;

        progress!(verbose, "Running memory to disk workflow for {:?}", window);
        let mut staging = self.scratch_file("integrated_test_")?;
        let mem_disk = memory_to_disk(window, staging.as_file_mut())?;
        staging.close().context("Failed to remove memory to disk scratch file")?;

        progress!(verbose, "Running full pipeline for {:?}", window);
        let mut output = self.scratch_file("pipeline_out_")?;
        let pipeline = full_pipeline(window, output.as_file_mut())?;
        output.close().context("Failed to remove pipeline scratch file")?;

        let workflows = [
            ("network_memory", net_mem),
            ("memory_disk", mem_disk),
            ("full_pipeline", pipeline),
        ];
        let latencies = LatencyStats::from_samples(workflows.iter().map(|(_, w)| w.latency_ms).collect());
        let throughput = workflows.iter().map(|(_, w)| w.throughput_ops_sec).sum::<f64>() / workflows.len() as f64;

        let mut result = BenchmarkResult::new(NAME)
            .with_throughput(throughput, "ops/sec")
            .with_latency(latencies.summary(), "ms");
        for (name, workflow) in &workflows {
            if !workflow.completed_any() {
                progress!(verbose, "Workflow {} completed no operations", name);
                result = result.with_info(format!("{}.status", name), "no_operations");
            }
        }

        Ok(result
            .with_metric("network_memory_throughput_ops_sec", net_mem.throughput_ops_sec)
            .with_metric("network_memory_latency_ms", net_mem.latency_ms)
            .with_metric("memory_disk_throughput_ops_sec", mem_disk.throughput_ops_sec)
            .with_metric("memory_disk_latency_ms", mem_disk.latency_ms)
            .with_metric("memory_disk_bandwidth_mbps", mem_disk.memory_bandwidth_mbps)
            .with_metric("full_pipeline_throughput_ops_sec", pipeline.throughput_ops_sec)
            .with_metric("full_pipeline_latency_ms", pipeline.latency_ms)
            .with_metric("full_pipeline_cpu_util_percent", pipeline.cpu_utilization_percent)
            .with_metric("full_pipeline_memory_bw_mbps", pipeline.memory_bandwidth_mbps))
    }
}
