//! TCP server measuring received throughput.
//!
//! Accepts connections indefinitely, measures the bytes received on each one
//! over one-second windows and appends every sample to the sample log.

use crate::config::ServerConfig;
use crate::logger::{console_line, log_file_name, SampleLogger};
use crate::window::RateWindow;
use bytes::BytesMut;
use chrono::Local;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Server instance
pub struct Server {
    config: ServerConfig,
    logger: SampleLogger,
}

/// A server whose listener is bound and ready to accept
pub struct BoundServer {
    listener: TcpListener,
    logger: SampleLogger,
}

impl Server {
    /// Create a new server instance, fixing the log path for its lifetime
    pub fn new(config: ServerConfig) -> Self {
        let file_name = log_file_name(
            &config.log_prefix,
            config.log_suffix.as_deref(),
            Local::now(),
        );
        let logger = SampleLogger::new(config.log_dir.join(file_name));

        Server { config, logger }
    }

    /// Get a reference to the logger for testing
    #[cfg(test)]
    pub fn logger(&self) -> &SampleLogger {
        &self.logger
    }

    /// Bind the listening socket.
    ///
    /// Failure here is a startup error and is returned to the caller.
    pub async fn bind(self) -> std::io::Result<BoundServer> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(
            address = %listener.local_addr()?,
            log = %self.logger.path().display(),
            "Server listening"
        );

        Ok(BoundServer {
            listener,
            logger: self.logger,
        })
    }

    /// Bind and begin accepting connections
    pub async fn run(self) -> std::io::Result<()> {
        self.bind().await?.run().await
    }
}

impl BoundServer {
    #[cfg(test)]
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!(peer = %addr, "Client connected");

                    let logger = self.logger.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, logger).await {
                            Ok(total) => {
                                info!(peer = %addr, bytes = total, "Client closed connection")
                            }
                            Err(e) => debug!(peer = %addr, error = %e, "Connection error"),
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Handle a single client connection.
///
/// Returns the total number of bytes received once the peer closes. A window
/// still open at that point is dropped without a sample.
pub async fn handle_connection(
    mut stream: TcpStream,
    logger: SampleLogger,
) -> std::io::Result<u64> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut window = RateWindow::new();
    let mut total: u64 = 0;

    loop {
        buffer.clear();
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!(
                discarded = window.accumulated_bytes(),
                "Connection closed by client"
            );
            return Ok(total);
        }

        total += n as u64;
        window.record(n as u64);

        if let Some(sample) = window.maybe_emit(Instant::now()) {
            info!(
                time = %sample.timestamp.format("%H:%M:%S"),
                kbps = sample.kbps,
                "Sample emitted"
            );
            // Printed regardless of the log filter
            println!("{}", console_line(&sample));
            logger.record(&sample).await;
        }
    }
}
