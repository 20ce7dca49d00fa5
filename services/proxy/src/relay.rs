//! Bidirectional byte relay between an accepted client and a dialed target.
//!
//! Once a tunnel is established the relay is protocol-agnostic: two tasks
//! copy client -> target and target -> client. Whichever direction ends
//! first (EOF or error) fires the session close signal; both tasks then stop,
//! shut down the write half they own and drop their read half. Each write
//! half has exactly one owner, so every connection is closed exactly once no
//! matter how the two directions race.
//!
//! ```text
//! Active --(one direction ends)--> HalfClosed --(other direction ends)--> Closed
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Copy buffer size per direction.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Lifecycle of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Both directions copying.
    Active,
    /// One direction has ended; the other is being torn down.
    HalfClosed,
    /// Both directions ended and both connections are closed.
    Closed,
}

impl RelayState {
    fn from_finished(finished: u8) -> Self {
        match finished {
            0 => RelayState::Active,
            1 => RelayState::HalfClosed,
            _ => RelayState::Closed,
        }
    }
}

/// Copy direction, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToTarget => "client_to_target",
            Direction::TargetToClient => "target_to_client",
        }
    }
}

/// Outcome of a finished tunnel.
#[derive(Debug)]
pub struct RelayReport {
    /// Bytes copied from client to target.
    pub client_to_target: u64,
    /// Bytes copied from target to client.
    pub target_to_client: u64,
    /// First I/O error observed, if any direction failed.
    pub error: Option<io::Error>,
    /// Final session state (always `Closed` once `run` returns).
    pub state: RelayState,
}

/// Shared close signal and activity clock for one tunnel session.
struct SessionClose {
    finished: AtomicU8,
    signal: watch::Sender<bool>,
    started: Instant,
    /// Milliseconds since `started` at the last copied chunk.
    last_activity_ms: AtomicU64,
}

impl SessionClose {
    fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            finished: AtomicU8::new(0),
            signal,
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since either direction last moved data.
    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Record that one direction ended. The first call fires the close signal;
    /// later calls only advance the state.
    fn direction_finished(&self) -> RelayState {
        let previous = self.finished.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            self.signal.send_replace(true);
        }
        RelayState::from_finished(previous.saturating_add(1))
    }

    fn state(&self) -> RelayState {
        RelayState::from_finished(self.finished.load(Ordering::Acquire))
    }
}

/// A client/target connection pair to be tunneled.
pub struct TunnelRelay<C, T> {
    client: C,
    target: T,
    idle_timeout: Option<Duration>,
}

impl<C, T> TunnelRelay<C, T>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Pair two already-open connections.
    pub fn new(client: C, target: T) -> Self {
        Self {
            client,
            target,
            idle_timeout: None,
        }
    }

    /// End the tunnel once neither direction has moved data for `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Run both copy directions until the session is closed.
    pub async fn run(self) -> RelayReport {
        let (client_read, client_write) = tokio::io::split(self.client);
        let (target_read, target_write) = tokio::io::split(self.target);

        let close = Arc::new(SessionClose::new());
        // Subscribe before spawning so neither task can miss the signal.
        let upstream_closed = close.subscribe();
        let downstream_closed = close.subscribe();

        let upstream = tokio::spawn(pump(
            client_read,
            target_write,
            Arc::clone(&close),
            upstream_closed,
            self.idle_timeout,
            Direction::ClientToTarget,
        ));
        let downstream = tokio::spawn(pump(
            target_read,
            client_write,
            Arc::clone(&close),
            downstream_closed,
            self.idle_timeout,
            Direction::TargetToClient,
        ));

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        let (client_to_target, upstream_err) = flatten_join(upstream);
        let (target_to_client, downstream_err) = flatten_join(downstream);

        let report = RelayReport {
            client_to_target,
            target_to_client,
            error: upstream_err.or(downstream_err),
            state: close.state(),
        };

        debug!(
            client_to_target = report.client_to_target,
            target_to_client = report.target_to_client,
            error = report.error.as_ref().map(tracing::field::display),
            "Tunnel closed"
        );

        report
    }
}

fn flatten_join(
    result: Result<(u64, Option<io::Error>), tokio::task::JoinError>,
) -> (u64, Option<io::Error>) {
    result.unwrap_or_else(|e| (0, Some(io::Error::other(e))))
}

/// Copy one direction until EOF, error, idle timeout or session close.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    close: Arc<SessionClose>,
    mut closed: watch::Receiver<bool>,
    idle_timeout: Option<Duration>,
    direction: Direction,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let result: io::Result<()> = loop {
        let read = tokio::select! {
            biased;
            _ = closed.changed() => break Ok(()),
            read = read_idle(&mut reader, &mut buf, idle_timeout, &close) => read,
        };

        let n = match read {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };

        tokio::select! {
            biased;
            _ = closed.changed() => break Ok(()),
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break Err(e);
                }
            }
        }
        total += n as u64;
        close.touch();
    };

    let state = close.direction_finished();
    trace!(
        direction = direction.as_str(),
        bytes = total,
        state = ?state,
        "Relay direction finished"
    );

    // Peer may already be gone; the close itself is what matters.
    let _ = writer.shutdown().await;
    drop(writer);
    drop(reader);

    (total, result.err())
}

/// Read, failing with `TimedOut` once the whole session has been idle for
/// `idle_timeout`. Activity in the other direction extends the wait.
async fn read_idle<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
    close: &SessionClose,
) -> io::Result<usize> {
    let Some(limit) = idle_timeout else {
        return reader.read(buf).await;
    };

    let mut wait = limit.saturating_sub(close.idle_for());
    loop {
        if let Ok(result) = timeout(wait, reader.read(buf)).await {
            return result;
        }
        let idle = close.idle_for();
        if idle >= limit {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
        }
        wait = limit - idle;
    }
}
