//! Direct TCP listener speaking newline-delimited JSON.
//!
//! Each line from the client is one protocol frame; each server message is
//! written back as one line.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{flush, Connection, ConnectionConfig, Flow};
use crate::protocol::ServerMessage;
use crate::session::SessionManager;

/// One line read from a direct client.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Text(String),
    /// A line that could not be decoded; it has already been discarded.
    Malformed(&'static str),
}

/// Newline framing with a length cap.
///
/// Oversized and non-UTF-8 lines come out as [`Line::Malformed`] so the
/// stream keeps going after them.
#[derive(Debug)]
struct LineCodec(LinesCodec);

impl LineCodec {
    fn new(max_length: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_length))
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Line>, LinesCodecError> {
        classify(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Line>, LinesCodecError> {
        classify(self.0.decode_eof(src))
    }
}

fn classify(
    result: Result<Option<String>, LinesCodecError>,
) -> Result<Option<Line>, LinesCodecError> {
    match result {
        Ok(line) => Ok(line.map(Line::Text)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Line::Malformed("frame too long"))),
        Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            Ok(Some(Line::Malformed("frame is not valid UTF-8")))
        }
        Err(e) => Err(e),
    }
}

/// Accept clients on `listener` until `cancel` fires.
pub async fn serve_direct(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    config: ConnectionConfig,
    cancel: CancellationToken,
) -> crate::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("direct kernel listener on {}", addr);
    }

    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handle_stream(stream, peer, manager, config, cancel).await;
        });
    }

    info!("direct kernel listener stopped");
    Ok(())
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
    config: ConnectionConfig,
    cancel: CancellationToken,
) {
    let peer = peer.to_string();
    debug!(peer = %peer, "direct client connected");

    let (read, write) = stream.into_split();
    let mut lines = FramedRead::new(read, LineCodec::new(config.max_frame_bytes));
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(write, rx));

    let mut connection = Connection::new(manager, tx, peer.clone(), config);
    let mut first = true;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = lines.next() => next,
            () = tokio::time::sleep(config.handshake_timeout), if first => {
                warn!(peer = %peer, "no handshake within {:?}", config.handshake_timeout);
                break;
            }
        };
        first = false;

        let flow = match next {
            Some(Ok(Line::Text(line))) if line.trim().is_empty() => continue,
            Some(Ok(Line::Text(line))) => connection.handle_frame(&line).await,
            Some(Ok(Line::Malformed(reason))) => {
                debug!(peer = %peer, "malformed frame: {}", reason);
                connection.handle_malformed(reason)
            }
            None => break,
            Some(Err(e)) => {
                debug!(peer = %peer, "read error: {}", e);
                break;
            }
        };
        if flow == Flow::Close {
            break;
        }
    }

    connection.finish().await;
    flush(writer, &peer).await;
    debug!(peer = %peer, "direct client disconnected");
}

async fn write_lines(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(message) = rx.recv().await {
        let mut json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("dropping unserializable message: {}", e);
                continue;
            }
        };
        json.push('\n');
        if write.write_all(json.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}
