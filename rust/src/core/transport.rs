// Socket transport: the `Connector` seam, the WebSocket implementation and
// reconnect backoff.

use std::time::Duration;

use anyhow::{anyhow, Context};
use flume::Sender;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::updates::{CoreMsg, InternalEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Upper bound of the delay before the `attempt`-th retry (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }
}

/// Exponential backoff with full jitter.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling_ms = self.policy.ceiling(self.attempt).as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Reports socket lifecycle back to the actor, stamped with the connection
/// generation so a replaced socket can't touch state.
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    core_sender: Sender<CoreMsg>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, core_sender: Sender<CoreMsg>) -> Self {
        Self {
            generation,
            core_sender,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.post(InternalEvent::TransportOpened {
            generation: self.generation,
        });
    }

    pub fn frame(&self, text: impl Into<String>) {
        self.post(InternalEvent::TransportFrame {
            generation: self.generation,
            text: text.into(),
        });
    }

    pub fn closed(&self, reason: Option<String>) {
        self.post(InternalEvent::TransportClosed {
            generation: self.generation,
            reason,
        });
    }

    fn post(&self, event: InternalEvent) {
        let _ = self.core_sender.send(CoreMsg::Internal(Box::new(event)));
    }
}

/// Outbound side of one connection. Dropping it tears the connection down.
pub struct ConnectionHandle {
    outbound: Sender<String>,
    task: Option<AbortHandle>,
}

impl ConnectionHandle {
    pub fn new(outbound: Sender<String>, task: Option<AbortHandle>) -> Self {
        Self { outbound, task }
    }

    /// Fire-and-forget. Returns false if the connection is already gone.
    pub fn send(&self, frame: String) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub trait Connector: Send + Sync + 'static {
    /// Starts one connection attempt. Must not block; progress is reported
    /// through `events`, ending with exactly one `closed`.
    fn connect(&self, runtime: &Handle, events: TransportEvents) -> ConnectionHandle;
}

/// Deadlines for one socket: the upgrade handshake, the ping cadence once
/// open, and how long the socket may stay silent before it is presumed dead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketTimeouts {
    pub connect: Duration,
    pub ping_interval: Duration,
    pub idle: Duration,
}

impl Default for SocketTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            idle: Duration::from_secs(45),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
    timeouts: SocketTimeouts,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeouts(url, SocketTimeouts::default())
    }

    pub fn with_timeouts(url: impl Into<String>, timeouts: SocketTimeouts) -> Self {
        Self {
            url: url.into(),
            timeouts,
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self, runtime: &Handle, events: TransportEvents) -> ConnectionHandle {
        let (outbound_tx, outbound_rx) = flume::unbounded::<String>();
        let url = self.url.clone();
        let timeouts = self.timeouts;
        let task = runtime.spawn(async move {
            let reason = match run_socket(&url, timeouts, &events, outbound_rx).await {
                Ok(()) => None,
                Err(e) => Some(format!("{e:#}")),
            };
            events.closed(reason);
        });
        ConnectionHandle::new(outbound_tx, Some(task.abort_handle()))
    }
}

async fn run_socket(
    url: &str,
    timeouts: SocketTimeouts,
    events: &TransportEvents,
    outbound: flume::Receiver<String>,
) -> anyhow::Result<()> {
    let (socket, _response) =
        tokio::time::timeout(timeouts.connect, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| anyhow!("handshake with {url} timed out after {:?}", timeouts.connect))?
            .with_context(|| format!("connect {url}"))?;
    tracing::info!(url, generation = events.generation(), "socket connected");
    events.opened();

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval_at(
        Instant::now() + timeouts.ping_interval,
        timeouts.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Any inbound frame, pongs included, proves the peer is still there.
    let idle = tokio::time::sleep(timeouts.idle);
    tokio::pin!(idle);
    loop {
        tokio::select! {
            () = &mut idle => {
                return Err(anyhow!("no traffic for {:?}", timeouts.idle));
            }
            _ = ping.tick() => sink
                .send(Message::Ping(Default::default()))
                .await
                .context("socket ping")?,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                    return match reason {
                        Some(reason) => Err(anyhow!("closed by server: {reason}")),
                        None => Ok(()),
                    };
                }
                // Pings are answered by tungstenite; binary frames carry nothing for us.
                Some(Ok(msg)) => {
                    idle.as_mut().reset(Instant::now() + timeouts.idle);
                    if let Message::Text(text) = msg {
                        events.frame(text.as_str());
                    }
                }
                Some(Err(e)) => return Err(e).context("socket read"),
                None => return Ok(()),
            },
            frame = outbound.recv_async() => match frame {
                Ok(frame) => sink
                    .send(Message::Text(frame.into()))
                    .await
                    .context("socket write")?,
                Err(_) => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
        }
    }
}
