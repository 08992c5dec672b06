//! TCP transport: one listener for commands and events, one for telemetry.
//! Each carries newline-delimited JSON and serves a single client at a time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SimulatorConfig;
use crate::protocol::{frame_message, MessageBuffer, MAX_MESSAGE_SIZE};
use crate::simulator::{SimulatorError, SimulatorHandle};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Simulator(#[from] SimulatorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    CommandEvent,
    Telemetry,
}

impl Channel {
    fn label(self) -> &'static str {
        match self {
            Channel::CommandEvent => "command/event",
            Channel::Telemetry => "telemetry",
        }
    }
}

pub struct PneumaticsServer {
    simulator: SimulatorHandle,
    cmd_evt_listener: TcpListener,
    telemetry_listener: TcpListener,
}

impl PneumaticsServer {
    /// Bind both listeners. Port 0 picks a free port; see
    /// [`PneumaticsServer::cmd_evt_addr`].
    pub async fn bind(
        config: &SimulatorConfig,
        simulator: SimulatorHandle,
    ) -> Result<Self, ServerError> {
        let cmd_evt_listener = TcpListener::bind(config.cmd_evt_addr()).await?;
        let telemetry_listener = TcpListener::bind(config.telemetry_addr()).await?;

        let server = Self {
            simulator,
            cmd_evt_listener,
            telemetry_listener,
        };
        info!(
            "Listening for commands on {} and telemetry clients on {}",
            server.cmd_evt_addr()?,
            server.telemetry_addr()?
        );
        Ok(server)
    }

    pub fn cmd_evt_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.cmd_evt_listener.local_addr()?)
    }

    pub fn telemetry_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.telemetry_listener.local_addr()?)
    }

    pub fn simulator(&self) -> &SimulatorHandle {
        &self.simulator
    }

    /// Serve both ports until the returned future is dropped.
    pub async fn run(self) {
        let Self {
            simulator,
            cmd_evt_listener,
            telemetry_listener,
        } = self;

        tokio::join!(
            accept_loop(cmd_evt_listener, simulator.clone(), Channel::CommandEvent),
            accept_loop(telemetry_listener, simulator, Channel::Telemetry),
        );
    }

    /// Run the server on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn accept_loop(listener: TcpListener, simulator: SimulatorHandle, channel: Channel) {
    let busy = Arc::new(AtomicBool::new(false));

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if busy.swap(true, Ordering::SeqCst) {
                    warn!(
                        "Refusing {} client {}: a client is already connected",
                        channel.label(),
                        addr
                    );
                    drop(stream);
                    continue;
                }

                info!("New {} client connected: {}", channel.label(), addr);
                let simulator = simulator.clone();
                let busy = Arc::clone(&busy);
                tokio::spawn(async move {
                    let result = match channel {
                        Channel::CommandEvent => serve_command_client(stream, simulator).await,
                        Channel::Telemetry => serve_telemetry_client(stream, simulator).await,
                    };
                    if let Err(e) = result {
                        warn!("{} client {} error: {}", channel.label(), addr, e);
                    }
                    busy.store(false, Ordering::SeqCst);
                    info!("{} client {} disconnected", channel.label(), addr);
                });
            }
            Err(e) => {
                error!("Failed to accept {} connection: {}", channel.label(), e);
            }
        }
    }
}

async fn serve_command_client(
    stream: TcpStream,
    simulator: SimulatorHandle,
) -> Result<(), ServerError> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_messages(writer, rx));

    if let Err(e) = simulator.connect_command_client(tx).await {
        simulator.disconnect_command_client().await;
        writer_task.abort();
        return Err(e.into());
    }

    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::with_capacity(MAX_MESSAGE_SIZE + 1);
    let result = loop {
        match read_frame(&mut reader, &mut buffer).await {
            Ok(Some(Frame::Line(line))) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                debug!("Received {}", trimmed);
                simulator.handle_payload(trimmed).await;
            }
            Ok(Some(Frame::Oversized)) => {
                warn!("Dropping command line longer than {} bytes", MAX_MESSAGE_SIZE);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    // Dropping the sink lets the writer flush what is queued and finish.
    simulator.disconnect_command_client().await;
    if let Err(e) = writer_task.await {
        debug!("Writer task ended abnormally: {}", e);
    }
    result
}

async fn serve_telemetry_client(
    stream: TcpStream,
    simulator: SimulatorHandle,
) -> Result<(), ServerError> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_messages(writer, rx));

    simulator.connect_telemetry_client(tx).await;

    // Nothing is expected from a telemetry client; read until it hangs up.
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    let result = loop {
        match read_frame(&mut reader, &mut buffer).await {
            Ok(Some(Frame::Line(line))) => debug!("Ignoring input on telemetry port: {}", line),
            Ok(Some(Frame::Oversized)) => debug!("Ignoring oversized input on telemetry port"),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    simulator.disconnect_telemetry_client().await;
    writer_task.abort();
    result
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    /// A line longer than [`MAX_MESSAGE_SIZE`]; its bytes were skipped.
    Oversized,
}

/// Read one newline-terminated line, buffering at most
/// `MAX_MESSAGE_SIZE + 1` bytes of it. `None` at end of stream.
async fn read_frame<R>(reader: &mut R, buffer: &mut Vec<u8>) -> std::io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_MESSAGE_SIZE as u64 + 1;

    buffer.clear();
    if (&mut *reader).take(limit).read_until(b'\n', buffer).await? == 0 {
        return Ok(None);
    }
    if buffer.last() == Some(&b'\n') || buffer.len() <= MAX_MESSAGE_SIZE {
        let line = String::from_utf8_lossy(buffer.as_slice()).into_owned();
        return Ok(Some(Frame::Line(line)));
    }

    // Skip the rest of the line, a bounded chunk at a time.
    loop {
        buffer.clear();
        let read = (&mut *reader).take(limit).read_until(b'\n', buffer).await?;
        if read == 0 || buffer.last() == Some(&b'\n') {
            return Ok(Some(Frame::Oversized));
        }
    }
}

/// Drain `rx` onto the socket, one JSON object per line.
async fn write_messages(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Value>) {
    let mut buffer = MessageBuffer::new();

    while let Some(message) = rx.recv().await {
        if let Err(e) = frame_message(&message, &mut buffer) {
            error!("Dropping outbound message {}: {}", message, e);
            continue;
        }
        if let Err(e) = writer.write_all(buffer.as_bytes()).await {
            warn!("Failed to send message: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            warn!("Failed to send message newline: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_skips_oversized_line() {
        let mut input = "x".repeat(MAX_MESSAGE_SIZE * 3);
        input.push('\n');
        input.push_str("{\"id\":\"cmd_start\"}\n");
        input.push_str("tail");

        let mut reader = BufReader::new(input.as_bytes());
        let mut buffer = Vec::new();

        assert_eq!(
            read_frame(&mut reader, &mut buffer).await.unwrap(),
            Some(Frame::Oversized)
        );
        assert!(buffer.len() <= MAX_MESSAGE_SIZE + 1);
        assert_eq!(
            read_frame(&mut reader, &mut buffer).await.unwrap(),
            Some(Frame::Line("{\"id\":\"cmd_start\"}\n".to_owned()))
        );
        assert_eq!(
            read_frame(&mut reader, &mut buffer).await.unwrap(),
            Some(Frame::Line("tail".to_owned()))
        );
        assert_eq!(read_frame(&mut reader, &mut buffer).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_accepts_line_at_size_limit() {
        let mut input = "y".repeat(MAX_MESSAGE_SIZE);
        input.push('\n');

        let mut reader = BufReader::new(input.as_bytes());
        let mut buffer = Vec::new();
        let Some(Frame::Line(line)) = read_frame(&mut reader, &mut buffer).await.unwrap() else {
            panic!("line at the limit must be kept");
        };
        assert_eq!(line.trim_end().len(), MAX_MESSAGE_SIZE);
    }
}
