//! Cross-process shared memory exchange
//!
//! A [`PingPongChannel`] is one shared memory segment plus two named
//! semaphores. The producer (a thread in the parent) owns the payload slot
//! while it holds the producer semaphore; posting the consumer semaphore
//! hands the slot to the consumer (a forked child), which hands it back by
//! posting the producer semaphore. Every message is stamped with a
//! sequence number and filled with a fixed byte pattern so the consumer can
//! detect torn or stale payloads.
//!
//! Shutdown is ordered: raise the stop flag, post both semaphores, join the
//! producer, mark the producer finished and post the consumer once more,
//! reap the child, then unlink every name. A consumer woken without a new
//! message only exits once the producer is marked finished, so each
//! published message is consumed exactly once.

pub mod segment;
pub mod semaphore;

pub use segment::{ControlBlock, SegmentLayout, SharedSegment};
pub use semaphore::NamedSemaphore;

use crate::metrics::LatencyStats;
use crate::utils::posix_resource_name;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Bytes at the start of each payload holding the little-endian sequence number
pub const SEQUENCE_STAMP_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("invalid IPC resource name {0:?}")]
    InvalidName(String),
    #[error("semaphore {name}: {source}")]
    Semaphore {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("shared memory {name}: {message}")]
    SharedMemory { name: String, message: String },
    #[error("segment of {size} bytes is smaller than the {needed} bytes required")]
    SegmentTooSmall { size: usize, needed: usize },
    #[error("message size must be at least one byte")]
    EmptyMessage,
    #[error("channel already destroyed")]
    Destroyed,
    #[error("failed to fork consumer process: {0}")]
    Fork(#[from] nix::Error),
    #[error("producer failed: {0}")]
    Producer(#[source] io::Error),
}

/// Pattern byte at payload offset `index`
#[inline]
pub fn pattern_byte(index: usize) -> u8 {
    (index.wrapping_mul(31).wrapping_add(7)) as u8
}

/// Build a patterned message buffer of `len` bytes
pub fn patterned_message(len: usize) -> Vec<u8> {
    (0..len).map(pattern_byte).collect()
}

/// Overwrite the sequence stamp at the head of `message`
pub fn stamp_sequence(message: &mut [u8], sequence: u64) {
    let stamp = sequence.to_le_bytes();
    let len = message.len().min(SEQUENCE_STAMP_LEN);
    message[..len].copy_from_slice(&stamp[..len]);
}

/// Check the stamp and the pattern of a received payload; never allocates
pub fn verify_message(message: &[u8], sequence: u64) -> bool {
    let stamp = sequence.to_le_bytes();
    let head = message.len().min(SEQUENCE_STAMP_LEN);
    if message[..head] != stamp[..head] {
        return false;
    }
    message
        .iter()
        .enumerate()
        .skip(head)
        .all(|(i, b)| *b == pattern_byte(i))
}

/// POSIX names of one channel's resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub shared_memory: String,
    pub producer_semaphore: String,
    pub consumer_semaphore: String,
}

/// Segment plus producer/consumer semaphores, created fresh for each run
pub struct PingPongChannel {
    segment: SharedSegment,
    producer: NamedSemaphore,
    consumer: NamedSemaphore,
}

impl PingPongChannel {
    /// Create uniquely named resources; the producer holds the slot first
    pub fn create(segment_size: usize, layout: SegmentLayout) -> Result<Self, IpcError> {
        let segment = SharedSegment::create(&posix_resource_name("shm"), segment_size, layout)?;
        let producer = NamedSemaphore::create(&posix_resource_name("prod"), 1)?;
        let consumer = NamedSemaphore::create(&posix_resource_name("cons"), 0)?;
        Ok(Self {
            segment,
            producer,
            consumer,
        })
    }

    pub fn names(&self) -> ChannelNames {
        ChannelNames {
            shared_memory: self.segment.name().to_string(),
            producer_semaphore: self.producer.name().to_string(),
            consumer_semaphore: self.consumer.name().to_string(),
        }
    }

    pub fn control(&self) -> Result<ControlBlock<'_>, IpcError> {
        self.segment.control().ok_or(IpcError::Destroyed)
    }

    /// Ask the producer to stop and wake both sides
    fn signal_stop(&self) {
        if let Some(control) = self.segment.control() {
            control.request_stop();
        }
        if let Err(e) = self.producer.post() {
            warn!("Failed to wake producer on {}: {}", self.producer.name(), e);
        }
        if let Err(e) = self.consumer.post() {
            warn!("Failed to wake consumer on {}: {}", self.consumer.name(), e);
        }
    }

    /// Tell the consumer no further messages will be published
    fn release_consumer(&self) {
        if let Some(control) = self.segment.control() {
            control.mark_producer_done();
        }
        if let Err(e) = self.consumer.post() {
            warn!("Failed to release consumer on {}: {}", self.consumer.name(), e);
        }
    }

    /// Unlink every name; later calls do nothing
    pub fn destroy(&mut self) {
        self.segment.destroy();
        self.producer.destroy();
        self.consumer.destroy();
    }
}

impl Drop for PingPongChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Forked consumer that is stopped and reaped when dropped
struct ConsumerProcess<'c> {
    channel: &'c PingPongChannel,
    child: Option<Pid>,
}

impl<'c> ConsumerProcess<'c> {
    /// Release the consumer and wait for it to exit
    fn finish(&mut self) -> Option<WaitStatus> {
        self.channel.release_consumer();
        self.reap()
    }

    fn reap(&mut self) -> Option<WaitStatus> {
        let child = self.child.take()?;
        loop {
            match waitpid(child, None) {
                Ok(status) => return Some(status),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Failed to reap consumer process {}: {}", child, e);
                    return None;
                }
            }
        }
    }
}

impl Drop for ConsumerProcess<'_> {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.channel.signal_stop();
            self.channel.release_consumer();
            self.reap();
        }
    }
}

/// Result of one timed producer/consumer exchange
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub message_size: usize,
    pub messages_sent: u64,
    pub messages_consumed: u64,
    pub messages_corrupt: u64,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    /// Consumer-side latency in milliseconds, acquisition to end of copy
    pub latencies: LatencyStats,
    /// Samples the consumer took, including any beyond the stored slots
    pub latency_samples_recorded: u64,
    pub names: ChannelNames,
}

impl TransferOutcome {
    pub fn throughput_mb_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Exchange `message_size`-byte messages with a forked consumer for `duration`
///
/// The channel is created for this call only and its names are unlinked
/// before returning, on success and on failure.
pub fn run_transfer(
    message_size: usize,
    duration: Duration,
    segment_size: usize,
    sample_capacity: usize,
) -> Result<TransferOutcome, IpcError> {
    if message_size == 0 {
        return Err(IpcError::EmptyMessage);
    }

    let layout = SegmentLayout {
        sample_capacity,
        payload_capacity: message_size,
    };
    let mut channel = PingPongChannel::create(segment_size, layout)?;
    let names = channel.names();
    debug!(
        "Starting {} byte transfer on {} for {:?}",
        message_size, names.shared_memory, duration
    );

    let mut message = patterned_message(message_size);
    // Allocated before fork; the child must not touch the allocator.
    let mut receive = vec![0u8; message_size];

    let control = channel.control()?;

    // SAFETY: the child only runs `consume`, which uses the inherited shared
    // mappings and semaphores, performs no allocation or logging, and leaves
    // through `_exit` so no parent-owned destructor runs twice.
    let child = match unsafe { fork() }? {
        ForkResult::Child => {
            let code = consume(control, &channel.producer, &channel.consumer, &mut receive);
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => child,
    };

    let mut consumer = ConsumerProcess {
        channel: &channel,
        child: Some(child),
    };

    let started = Instant::now();
    let produced = std::thread::scope(|s| {
        let producer = std::thread::Builder::new()
            .name("ipc-producer".to_string())
            .spawn_scoped(s, || produce(control, &channel.producer, &channel.consumer, &mut message));
        let producer = match producer {
            Ok(handle) => handle,
            Err(e) => return Err(IpcError::Producer(e)),
        };
        std::thread::sleep(duration);
        channel.signal_stop();
        match producer.join() {
            Ok(result) => result.map_err(IpcError::Producer),
            Err(_) => Err(IpcError::Producer(io::Error::new(
                io::ErrorKind::Other,
                "producer thread panicked",
            ))),
        }
    });
    let elapsed = started.elapsed();

    match consumer.finish() {
        Some(WaitStatus::Exited(_, 0)) => {}
        Some(status) => warn!("Consumer process ended abnormally: {:?}", status),
        None => {}
    }
    drop(consumer);

    let messages_sent = produced?;
    let latencies = LatencyStats::from_samples(control.latency_samples());
    let outcome = TransferOutcome {
        message_size,
        messages_sent,
        messages_consumed: control.consumed(),
        messages_corrupt: control.corrupt(),
        bytes_transferred: control.bytes_transferred(),
        elapsed,
        latencies,
        latency_samples_recorded: control.latency_samples_recorded(),
        names,
    };

    channel.destroy();
    debug!(
        "Transfer of {} byte messages: sent {}, consumed {}, corrupt {}",
        message_size, outcome.messages_sent, outcome.messages_consumed, outcome.messages_corrupt
    );
    Ok(outcome)
}

fn produce(
    control: ControlBlock<'_>,
    producer: &NamedSemaphore,
    consumer: &NamedSemaphore,
    message: &mut [u8],
) -> io::Result<u64> {
    let mut sent = 0u64;
    let result = loop {
        if let Err(e) = producer.wait() {
            break Err(e);
        }
        if control.stop_requested() {
            break Ok(());
        }

        sent += 1;
        stamp_sequence(message, sent);
        // SAFETY: holding the producer semaphore grants the payload slot.
        let written = unsafe { control.write_payload(message) };
        control.publish();
        control.add_bytes_transferred(written as u64);

        if let Err(e) = consumer.post() {
            break Err(e);
        }
    };
    control.mark_producer_done();
    result.map(|_| sent)
}

/// Consumer loop run in the forked child; returns the exit code
fn consume(
    control: ControlBlock<'_>,
    producer: &NamedSemaphore,
    consumer: &NamedSemaphore,
    buffer: &mut [u8],
) -> i32 {
    let mut expected = 1u64;
    loop {
        if consumer.wait().is_err() {
            return 1;
        }
        let acquired = Instant::now();

        if control.published() < expected {
            if control.producer_done() {
                return 0;
            }
            continue;
        }

        // SAFETY: a published, unconsumed message means the producer has
        // handed over the slot and is blocked on its semaphore.
        unsafe { control.read_payload(buffer) };
        control.record_latency(acquired.elapsed().as_secs_f64() * 1000.0);

        if !verify_message(buffer, expected) {
            control.record_corrupt();
        }
        control.record_consumed();
        expected += 1;

        if producer.post().is_err() {
            return 1;
        }
    }
}
