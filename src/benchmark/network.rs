//! Loopback TCP and UDP echo benchmarks
//!
//! Each phase runs a server thread and a client thread. The server binds an
//! ephemeral loopback port, publishes it and raises a ready flag that the
//! client polls before connecting. Server sockets are non-blocking: a
//! would-block result is the idle state and any other socket error ends
//! the phase with an error. Every blocking client call carries a timeout,
//! so stopping a phase never waits on the network indefinitely.

use super::{fraction_of, progress};
use crate::metrics::{LatencyStats, Timer};
use crate::results::BenchmarkResult;
use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub const NAME: &str = "Network";

pub const TCP_MESSAGE_BYTES: usize = 64 * 1024;
pub const UDP_PACKET_BYTES: usize = 1400;
const UDP_SEND_INTERVAL: Duration = Duration::from_millis(1);
const IO_TIMEOUT: Duration = Duration::from_millis(200);
const IDLE_SLEEP: Duration = Duration::from_micros(100);
const RETRY_SLEEP: Duration = Duration::from_millis(10);
const MIB: f64 = 1024.0 * 1024.0;

/// Stop flag plus the server's readiness announcement
#[derive(Debug, Default)]
pub struct PhaseControl {
    stop: AtomicBool,
    ready: AtomicBool,
    port: AtomicU16,
}

impl PhaseControl {
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Publish the bound port; the port is visible before the ready flag
    pub fn announce(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
    }

    /// Poll until the server is ready; `None` if stopped or past `deadline`
    pub fn wait_ready(&self, deadline: Instant) -> Option<u16> {
        loop {
            if self.ready.load(Ordering::Acquire) {
                return Some(self.port.load(Ordering::Relaxed));
            }
            if self.should_stop() || Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

pub(crate) fn is_idle(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted)
}

pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

pub fn bind_tcp_listener() -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(loopback(0)))?;
    socket.listen(16)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

pub fn bind_udp_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(loopback(0)))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Echo fixed-size messages, timing each from first byte to echo sent (ms)
pub fn tcp_server(control: &PhaseControl, message_bytes: usize) -> io::Result<LatencyStats> {
    let listener = bind_tcp_listener()?;
    control.announce(listener.local_addr()?.port());

    let mut stats = LatencyStats::new();
    let mut buffer = vec![0u8; message_bytes];
    while !control.should_stop() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("TCP server accepted {}", peer);
                serve_tcp_connection(stream, control, &mut buffer, &mut stats)?;
            }
            Err(e) if is_idle(&e) => thread::sleep(IDLE_SLEEP),
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}

fn serve_tcp_connection(
    mut stream: TcpStream,
    control: &PhaseControl,
    buffer: &mut [u8],
    stats: &mut LatencyStats,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.set_nodelay(true)?;

    while !control.should_stop() {
        let first = match stream.read(buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if is_idle(&e) => continue,
            Err(e) if is_disconnect(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        let timer = Timer::new();
        let echoed = stream
            .read_exact(&mut buffer[first..])
            .and_then(|_| stream.write_all(buffer));
        match echoed {
            Ok(()) => stats.add_sample(timer.elapsed_ms()),
            // The client went away or stalled mid-message; drop the connection
            Err(e) if is_idle(&e) || is_disconnect(&e) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Send messages and read their echoes until `deadline`; returns bytes moved
///
/// Connection failures are retried; they only lower the measured rate.
pub fn tcp_client(control: &PhaseControl, message_bytes: usize, deadline: Instant) -> u64 {
    let Some(port) = control.wait_ready(deadline) else {
        return 0;
    };
    let addr = loopback(port);
    let message = vec![b'T'; message_bytes];
    let mut echo = vec![0u8; message_bytes];
    let mut bytes = 0u64;

    while Instant::now() < deadline && !control.should_stop() {
        let mut stream = match TcpStream::connect_timeout(&addr, IO_TIMEOUT) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("TCP client connect failed: {}", e);
                thread::sleep(RETRY_SLEEP);
                continue;
            }
        };
        let configured = stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(IO_TIMEOUT)))
            .and_then(|_| stream.set_nodelay(true));
        if let Err(e) = configured {
            debug!("TCP client socket setup failed: {}", e);
            continue;
        }

        while Instant::now() < deadline && !control.should_stop() {
            if let Err(e) = stream.write_all(&message).and_then(|_| stream.read_exact(&mut echo)) {
                debug!("TCP client exchange failed: {}", e);
                thread::sleep(RETRY_SLEEP);
                break;
            }
            bytes += 2 * message_bytes as u64;
        }
    }
    bytes
}

/// Echo datagrams; returns turnaround times (ms) and packets received
pub fn udp_server(control: &PhaseControl) -> io::Result<(LatencyStats, u64)> {
    let socket = bind_udp_socket()?;
    control.announce(socket.local_addr()?.port());

    let mut stats = LatencyStats::new();
    let mut received = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];
    while !control.should_stop() {
        match socket.recv_from(&mut buffer) {
            Ok((n, peer)) => {
                let timer = Timer::new();
                received += 1;
                match socket.send_to(&buffer[..n], peer) {
                    Ok(_) => stats.add_sample(timer.elapsed_ms()),
                    Err(e) if is_idle(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            // Some platforms surface ICMP port-unreachable on the next receive
            Err(e) if is_idle(&e) || is_disconnect(&e) => thread::sleep(IDLE_SLEEP),
            Err(e) => return Err(e),
        }
    }
    Ok((stats, received))
}

/// Send one datagram per millisecond until `deadline`; returns packets sent
pub fn udp_client(control: &PhaseControl, packet_bytes: usize, deadline: Instant) -> u64 {
    let Some(port) = control.wait_ready(deadline) else {
        return 0;
    };
    let socket = match bind_udp_socket() {
        Ok(socket) => socket,
        Err(e) => {
            debug!("UDP client bind failed: {}", e);
            return 0;
        }
    };
    let addr = loopback(port);
    let packet = vec![b'U'; packet_bytes];
    let mut drain = vec![0u8; packet_bytes];
    let mut sent = 0u64;

    while Instant::now() < deadline && !control.should_stop() {
        match socket.send_to(&packet, addr) {
            Ok(_) => sent += 1,
            Err(e) => debug!("UDP client send failed: {}", e),
        }
        while socket.recv_from(&mut drain).is_ok() {}
        thread::sleep(UDP_SEND_INTERVAL);
    }
    sent
}

#[derive(Debug, Clone, Default)]
pub struct TcpOutcome {
    pub throughput_mbps: f64,
    pub latencies: LatencyStats,
}

#[derive(Debug, Clone, Default)]
pub struct UdpOutcome {
    pub throughput_mbps: f64,
    pub packet_loss_percent: f64,
    pub latencies: LatencyStats,
}

/// Loss as a percentage of sent packets; 0 when nothing was sent
pub fn packet_loss_percent(sent: u64, received: u64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    sent.saturating_sub(received) as f64 * 100.0 / sent as f64
}

fn join_or_stop<T>(handle: thread::ScopedJoinHandle<'_, T>, control: &PhaseControl, role: &str) -> Result<T> {
    handle.join().map_err(|_| {
        control.request_stop();
        anyhow!("{} thread panicked", role)
    })
}

/// Run a server/client pair for `window`, stopping both afterwards
pub(crate) fn run_phase<S, C, SR, CR>(label: &str, window: Duration, serve: S, drive: C) -> Result<(SR, CR, Duration)>
where
    S: FnOnce(&PhaseControl) -> io::Result<SR> + Send,
    C: FnOnce(&PhaseControl, Instant) -> CR + Send,
    SR: Send,
    CR: Send,
{
    let control = PhaseControl::default();
    let started = Instant::now();
    let deadline = started + window;

    thread::scope(|s| {
        let control = &control;
        let server = thread::Builder::new()
            .name(format!("{}-server", label))
            .spawn_scoped(s, move || {
                let result = serve(control);
                if result.is_err() {
                    control.request_stop();
                }
                result
            })
            .with_context(|| format!("Failed to spawn {} server thread", label))?;
        let client = match thread::Builder::new()
            .name(format!("{}-client", label))
            .spawn_scoped(s, move || drive(control, deadline))
        {
            Ok(handle) => handle,
            Err(e) => {
                control.request_stop();
                return Err(e).with_context(|| format!("Failed to spawn {} client thread", label));
            }
        };

        let wait = deadline.saturating_duration_since(Instant::now());
        // Wake early if the server failed
        let poll = Duration::from_millis(10);
        let mut remaining = wait;
        while !remaining.is_zero() && !control.should_stop() {
            let step = remaining.min(poll);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        control.request_stop();

        let client_result = join_or_stop(client, control, label)?;
        let elapsed = started.elapsed();
        let server_result = join_or_stop(server, control, label)?
            .with_context(|| format!("{} server failed", label))?;
        Ok((server_result, client_result, elapsed))
    })
}

pub fn run_tcp_phase(window: Duration, message_bytes: usize) -> Result<TcpOutcome> {
    let (latencies, bytes, elapsed) = run_phase(
        "tcp",
        window,
        |control| tcp_server(control, message_bytes),
        |control, deadline| tcp_client(control, message_bytes, deadline),
    )?;
    let secs = elapsed.as_secs_f64();
    Ok(TcpOutcome {
        throughput_mbps: if secs > 0.0 { bytes as f64 / MIB / secs } else { 0.0 },
        latencies,
    })
}

pub fn run_udp_phase(window: Duration, packet_bytes: usize) -> Result<UdpOutcome> {
    let ((latencies, received), sent, elapsed) = run_phase(
        "udp",
        window,
        udp_server,
        |control, deadline| udp_client(control, packet_bytes, deadline),
    )?;
    let secs = elapsed.as_secs_f64();
    Ok(UdpOutcome {
        throughput_mbps: if secs > 0.0 {
            (received * packet_bytes as u64) as f64 / MIB / secs
        } else {
            0.0
        },
        packet_loss_percent: packet_loss_percent(sent, received),
        latencies,
    })
}

#[derive(Debug, Clone)]
pub struct NetworkBenchmark {
    tcp_message_bytes: usize,
    udp_packet_bytes: usize,
}

impl Default for NetworkBenchmark {
    fn default() -> Self {
        Self {
            tcp_message_bytes: TCP_MESSAGE_BYTES,
            udp_packet_bytes: UDP_PACKET_BYTES,
        }
    }
}

impl NetworkBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn execute(&self, duration_seconds: u32, _iterations: u32, verbose: bool) -> Result<BenchmarkResult> {
        let window = fraction_of(duration_seconds, 2);

        progress!(verbose, "Running TCP benchmark for {:?}", window);
        let tcp = run_tcp_phase(window, self.tcp_message_bytes)?;
        progress!(verbose, "TCP throughput: {:.2} MB/s", tcp.throughput_mbps);

        progress!(verbose, "Running UDP benchmark for {:?}", window);
        let udp = run_udp_phase(window, self.udp_packet_bytes)?;
        progress!(
            verbose,
            "UDP throughput: {:.2} MB/s, packet loss {:.2}%",
            udp.throughput_mbps,
            udp.packet_loss_percent
        );

        let mut combined = tcp.latencies.clone();
        combined.merge(&udp.latencies);

        Ok(BenchmarkResult::new(NAME)
            .with_throughput(tcp.throughput_mbps, "MB/s")
            .with_latency(combined.summary(), "ms")
            .with_metric("tcp_throughput_mbps", tcp.throughput_mbps)
            .with_metric("tcp_avg_latency_ms", tcp.latencies.average())
            .with_metric("tcp_p99_latency_ms", tcp.latencies.percentile(99.0))
            .with_metric("udp_throughput_mbps", udp.throughput_mbps)
            .with_metric("udp_avg_latency_ms", udp.latencies.average())
            .with_metric("udp_packet_loss_percent", udp.packet_loss_percent)
            .with_metric("loopback_used", 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_loss() {
        assert_eq!(packet_loss_percent(0, 0), 0.0);
        assert_eq!(packet_loss_percent(100, 100), 0.0);
        assert_eq!(packet_loss_percent(200, 150), 25.0);
        // More echoes than sends never yields negative loss
        assert_eq!(packet_loss_percent(10, 12), 0.0);
    }

    #[test]
    fn test_wait_ready_returns_announced_port() {
        let control = PhaseControl::default();
        control.announce(4242);
        assert_eq!(control.wait_ready(Instant::now()), Some(4242));
    }

    #[test]
    fn test_wait_ready_gives_up() {
        let control = PhaseControl::default();
        assert_eq!(control.wait_ready(Instant::now() + Duration::from_millis(5)), None);
        control.request_stop();
        assert_eq!(control.wait_ready(Instant::now() + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_listeners_bind_ephemeral_ports() {
        let a = bind_tcp_listener().unwrap();
        let b = bind_tcp_listener().unwrap();
        assert_ne!(a.local_addr().unwrap().port(), b.local_addr().unwrap().port());
        assert!(a.local_addr().unwrap().ip().is_loopback());
        let u = bind_udp_socket().unwrap();
        assert!(u.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_tcp_phase_moves_data() {
        let outcome = run_tcp_phase(Duration::from_millis(300), 4096).unwrap();
        assert!(outcome.throughput_mbps > 0.0);
        assert!(outcome.latencies.count() > 0);
    }

    #[test]
    fn test_udp_phase_receives_packets() {
        let outcome = run_udp_phase(Duration::from_millis(300), 512).unwrap();
        assert!(outcome.throughput_mbps > 0.0);
        assert!((0.0..=100.0).contains(&outcome.packet_loss_percent));
    }
}
