//! Reconnecting TCP client.
//!
//! Keeps one outbound connection to the server, forwards operator input to
//! it byte-for-byte and echoes whatever the server sends back. Any close or
//! error puts the client back in `Disconnected`, and the next attempt is made
//! after a fixed delay. There is no retry limit and no backoff.

use crate::config::ClientConfig;
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Read buffer size for both directions
const BUFFER_SIZE: usize = 8 * 1024;

/// Idle time before the first keepalive probe
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// State transitions, reported to an optional observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection attempt has started
    Connecting,
    /// The handshake completed
    Connected(SocketAddr),
    /// The attempt failed; a retry is scheduled
    ConnectFailed,
    /// An established connection ended; a retry is scheduled
    Disconnected,
}

/// Why an established connection ended
#[derive(Debug)]
enum Disconnect {
    Closed,
    Error(std::io::Error),
}

/// Client with a single persistent connection
pub struct ReconnectingClient<I, O> {
    config: ClientConfig,
    input: I,
    output: O,
    input_open: bool,
    state: ClientState,
    events: Option<UnboundedSender<ClientEvent>>,
}

impl<I, O> ReconnectingClient<I, O>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    pub fn new(config: ClientConfig, input: I, output: O) -> Self {
        Self {
            config,
            input,
            output,
            input_open: true,
            state: ClientState::Disconnected,
            events: None,
        }
    }

    /// Report state transitions on `events`
    #[cfg(test)]
    pub fn with_events(mut self, events: UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Run forever, reconnecting after every disconnect
    pub async fn run(mut self) {
        loop {
            self.transition(ClientState::Connecting, ClientEvent::Connecting);

            match connect(&self.config.target).await {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "client: connected");
                    self.transition(ClientState::Connected, ClientEvent::Connected(peer));

                    match self.pump(stream).await {
                        Disconnect::Closed => info!(peer = %peer, "client: connection is closed"),
                        Disconnect::Error(e) => {
                            warn!(peer = %peer, error = %e, "client: connection is closed")
                        }
                    }
                    self.transition(ClientState::Disconnected, ClientEvent::Disconnected);
                }
                Err(e) => {
                    warn!(target_addr = %self.config.target, error = %e, "client: made error");
                    self.transition(ClientState::Disconnected, ClientEvent::ConnectFailed);
                }
            }

            info!(
                delay_ms = self.config.retry_delay.as_millis() as u64,
                "client: reconnecting"
            );
            self.wait_for_retry().await;
        }
    }

    fn transition(&mut self, state: ClientState, event: ClientEvent) {
        match &event {
            ClientEvent::Connected(peer) => {
                debug!(from = ?self.state, to = ?state, peer = %peer, "client state change")
            }
            _ => debug!(from = ?self.state, to = ?state, "client state change"),
        }
        self.state = state;
        if let Some(events) = &self.events {
            // The observer going away does not stop the client
            let _ = events.send(event);
        }
    }

    /// Move bytes in both directions until the connection ends
    async fn pump(&mut self, mut stream: TcpStream) -> Disconnect {
        let (mut reader, mut writer) = stream.split();
        let mut inbound = BytesMut::with_capacity(BUFFER_SIZE);
        let mut outbound = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            inbound.clear();
            outbound.clear();

            tokio::select! {
                result = reader.read_buf(&mut inbound) => match result {
                    Ok(0) => return Disconnect::Closed,
                    Ok(_) => {
                        if let Err(e) = self.show(&inbound).await {
                            warn!(error = %e, "Failed to write received data");
                        }
                    }
                    Err(e) => return Disconnect::Error(e),
                },
                result = self.input.read_buf(&mut outbound), if self.input_open => match result {
                    Ok(0) => {
                        debug!("Input closed");
                        self.input_open = false;
                    }
                    Ok(_) => {
                        if let Err(e) = writer.write_all(&outbound).await {
                            return Disconnect::Error(e);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read input");
                        self.input_open = false;
                    }
                },
            }
        }
    }

    /// Sleep out the retry delay, discarding input that arrives meanwhile
    async fn wait_for_retry(&mut self) {
        let retry = tokio::time::sleep(self.config.retry_delay);
        tokio::pin!(retry);
        let mut discard = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            discard.clear();

            tokio::select! {
                _ = &mut retry => return,
                result = self.input.read_buf(&mut discard), if self.input_open => match result {
                    Ok(0) => {
                        debug!("Input closed");
                        self.input_open = false;
                    }
                    Ok(n) => debug!(bytes = n, "Dropping input while disconnected"),
                    Err(e) => {
                        warn!(error = %e, "Failed to read input");
                        self.input_open = false;
                    }
                },
            }
        }
    }

    async fn show(&mut self, data: &[u8]) -> std::io::Result<()> {
        let line = format!("client: {}\n", String::from_utf8_lossy(data));
        self.output.write_all(line.as_bytes()).await?;
        self.output.flush().await
    }
}

async fn connect(target: &str) -> std::io::Result<(TcpStream, SocketAddr)> {
    let stream = TcpStream::connect(target).await?;
    let peer = stream.peer_addr()?;
    enable_keepalive(&stream);
    Ok((stream, peer))
}

fn enable_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Failed to enable keepalive");
    }
}
