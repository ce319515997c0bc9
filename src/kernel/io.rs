//! Async pumps between kernel stdio and channels.
//!
//! Each kernel gets one reader task per output stream and a single writer
//! task for stdin. Callers talk to the process only through channels, so
//! a slow kernel never blocks a client connection and concurrent writers
//! can never interleave partial frames.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Longest line forwarded as a single chunk; longer lines are split.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Which kernel stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of kernel output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelOutput {
    pub stream: OutputStream,
    pub line: Vec<u8>,
}

impl KernelOutput {
    pub fn stdout(line: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            line: line.into(),
        }
    }

    /// Line contents as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.line).into_owned()
    }
}

/// Reads newline-delimited output from a kernel stream into a channel.
pub struct AsyncKernelReader<R> {
    reader: BufReader<R>,
    stream: OutputStream,
    tx: mpsc::Sender<KernelOutput>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin + Send + 'static> AsyncKernelReader<R> {
    /// Create a reader forwarding lines of `stream` to `tx`.
    pub fn new(reader: R, stream: OutputStream, tx: mpsc::Sender<KernelOutput>) -> Self {
        Self {
            reader: BufReader::new(reader),
            stream,
            tx,
            max_line: MAX_LINE_BYTES,
        }
    }

    /// Override the maximum line length.
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    /// Run until EOF, a read error, or the receiver going away.
    pub async fn run(mut self) {
        let mut buf = Vec::with_capacity(256);

        loop {
            buf.clear();
            let limit = self.max_line as u64;
            let result = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut buf)
                .await;
            match result {
                Ok(0) => {
                    debug!(stream = ?self.stream, "kernel reader: EOF");
                    break;
                }
                Ok(n) => {
                    trace!(stream = ?self.stream, "kernel reader: read {} bytes", n);
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    let output = KernelOutput {
                        stream: self.stream,
                        line: buf.clone(),
                    };
                    if self.tx.send(output).await.is_err() {
                        debug!(stream = ?self.stream, "kernel reader: channel closed");
                        break;
                    }
                }
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        debug!(stream = ?self.stream, "kernel reader: broken pipe");
                    } else {
                        error!(stream = ?self.stream, "kernel reader error: {}", e);
                    }
                    break;
                }
            }
        }
    }
}

/// Writes framed requests from a channel to kernel stdin.
pub struct AsyncKernelWriter<W> {
    writer: W,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> AsyncKernelWriter<W> {
    pub fn new(writer: W, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { writer, rx }
    }

    /// Run until every sender is dropped or the pipe breaks.
    ///
    /// Each received frame is written and flushed before the next one is
    /// taken, so frames reach the kernel whole and in channel order.
    pub async fn run(mut self) {
        while let Some(frame) = self.rx.recv().await {
            trace!("kernel writer: writing {} bytes", frame.len());
            if let Err(e) = self.writer.write_all(&frame).await {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    debug!("kernel writer: broken pipe");
                } else {
                    error!("kernel writer error: {}", e);
                }
                break;
            }
            if let Err(e) = self.writer.flush().await {
                error!("kernel writer flush error: {}", e);
                break;
            }
        }
        debug!("kernel writer: channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    async fn collect(mut rx: mpsc::Receiver<KernelOutput>) -> Vec<KernelOutput> {
        let mut lines = Vec::new();
        while let Ok(Some(line)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_reader_splits_lines() {
        let cursor = Cursor::new(b"first\nsecond\r\nthird".to_vec());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(AsyncKernelReader::new(cursor, OutputStream::Stdout, tx).run());

        let lines = collect(rx).await;
        let texts: Vec<_> = lines.iter().map(KernelOutput::text).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert!(lines.iter().all(|l| l.stream == OutputStream::Stdout));
    }

    #[tokio::test]
    async fn test_reader_caps_long_lines() {
        let cursor = Cursor::new(b"abcdefg\n".to_vec());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(
            AsyncKernelReader::new(cursor, OutputStream::Stderr, tx)
                .with_max_line(4)
                .run(),
        );

        let texts: Vec<_> = collect(rx).await.iter().map(KernelOutput::text).collect();
        assert_eq!(texts, vec!["abcd", "efg"]);
    }

    #[tokio::test]
    async fn test_reader_empty_closes_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(
            AsyncKernelReader::new(Cursor::new(Vec::new()), OutputStream::Stdout, tx).run(),
        );

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(matches!(result, Ok(None)));
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_reader_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let cursor = Cursor::new(b"a\nb\nc\n".to_vec());
        let handle = tokio::spawn(AsyncKernelReader::new(cursor, OutputStream::Stdout, tx).run());
        let result = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_writer_preserves_frame_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(AsyncKernelWriter::new(client, rx).run());

        tx.send(b"one\n".to_vec()).await.unwrap();
        tx.send(b"two\n".to_vec()).await.unwrap();
        tx.send(b"three\n".to_vec()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let mut received = String::new();
        server.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "one\ntwo\nthree\n");
    }
}
