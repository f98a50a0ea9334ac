//! Newline-delimited JSON over the worker's stdin and stdout.

use super::{FrameSink, FrameSource, Transport, WorkerChannel, MAX_FRAME_ENV, TRANSPORT_ENV};
use crate::config::{ExecutorConfig, TransportKind};
use crate::error::Error;
use async_trait::async_trait;
use std::io::{BufRead, Write};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{ChildStdin, ChildStdout, Command};

const DELIMITER: u8 = b'\n';

/// Host side of the pipe transport.
#[derive(Debug)]
pub struct PipeTransport {
    max_frame_bytes: usize,
}

impl Transport for PipeTransport {
    type Sink = PipeSink<ChildStdin>;
    type Source = PipeSource<ChildStdout>;

    const KIND: TransportKind = TransportKind::Pipe;

    fn prepare(config: &ExecutorConfig, command: &mut Command) -> Result<Self, Error> {
        command
            .env(TRANSPORT_ENV, TransportKind::Pipe.as_str())
            .env(MAX_FRAME_ENV, config.max_frame_bytes.to_string());
        Ok(Self {
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    fn attach(
        &mut self,
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> Result<(Self::Sink, Self::Source), Error> {
        Ok((
            PipeSink::new(stdin),
            PipeSource::new(stdout, self.max_frame_bytes),
        ))
    }

    fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

pub struct PipeSink<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> PipeSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for PipeSink<W> {
    async fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.writer
            .write_all(frame)
            .await
            .map_err(|source| Error::IO { source })?;
        self.writer
            .write_all(&[DELIMITER])
            .await
            .map_err(|source| Error::IO { source })?;
        self.writer
            .flush()
            .await
            .map_err(|source| Error::IO { source })
    }
}

pub struct PipeSource<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin + Send> PipeSource<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for PipeSource<R> {
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            let mut line = Vec::new();
            let limit = self.max_frame_bytes as u64 + 1;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(DELIMITER, &mut line)
                .await
                .map_err(|source| Error::IO { source })?;
            if read == 0 {
                return Ok(None);
            }
            if line.last() != Some(&DELIMITER) {
                if line.len() > self.max_frame_bytes {
                    return Err(Error::transport(format!(
                        "frame exceeds {} bytes",
                        self.max_frame_bytes
                    )));
                }
                return Err(Error::transport("stream closed inside a frame"));
            }
            line.pop();
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }
}

/// Worker side of the pipe transport.
pub struct WorkerPipe<R, W> {
    reader: R,
    writer: W,
    max_frame_bytes: usize,
}

impl WorkerPipe<std::io::StdinLock<'static>, std::io::BufWriter<std::io::Stdout>> {
    pub fn stdio() -> Self {
        Self::new(
            std::io::stdin().lock(),
            std::io::BufWriter::new(std::io::stdout()),
        )
    }
}

impl<R: BufRead, W: Write> WorkerPipe<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_frame_bytes: usize::MAX,
        }
    }

    /// Caps outgoing frames at the host's receive limit.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

impl<R: BufRead, W: Write> WorkerChannel for WorkerPipe<R, W> {
    fn recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            let mut line = Vec::new();
            let read = self
                .reader
                .read_until(DELIMITER, &mut line)
                .map_err(|source| Error::IO { source })?;
            if read == 0 {
                return Ok(None);
            }
            if line.last() == Some(&DELIMITER) {
                line.pop();
            }
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.writer
            .write_all(frame)
            .and_then(|_| self.writer.write_all(&[DELIMITER]))
            .and_then(|_| self.writer.flush())
            .map_err(|source| Error::IO { source })
    }

    fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut sink = PipeSink::new(client_write);
        let mut source = PipeSource::new(server_read, 1024);

        sink.send(br#"{"id":1}"#).await.unwrap();
        sink.send(br#"{"id":2}"#).await.unwrap();
        assert_eq!(source.receive().await.unwrap().unwrap(), br#"{"id":1}"#);
        assert_eq!(source.receive().await.unwrap().unwrap(), br#"{"id":2}"#);
    }

    #[tokio::test]
    async fn test_eof_and_oversized_frames() {
        let mut source = PipeSource::new(&b""[..], 16);
        assert!(source.receive().await.unwrap().is_none());

        let mut source = PipeSource::new(&b"\n\n{}\n"[..], 16);
        assert_eq!(source.receive().await.unwrap().unwrap(), b"{}");

        let mut source = PipeSource::new(&b"0123456789abcdefXYZ\n"[..], 16);
        assert!(matches!(source.receive().await, Err(Error::Transport { .. })));

        let mut source = PipeSource::new(&b"{\"id\""[..], 16);
        assert!(matches!(source.receive().await, Err(Error::Transport { .. })));
    }

    #[test]
    fn test_worker_pipe() {
        let input = b"{\"id\":0,\"shutdown\":{}}\n".to_vec();
        let mut output = Vec::new();
        {
            let mut pipe = WorkerPipe::new(&input[..], &mut output);
            assert_eq!(pipe.recv().unwrap().unwrap(), br#"{"id":0,"shutdown":{}}"#);
            assert!(pipe.recv().unwrap().is_none());
            pipe.send(br#"{"id":0,"ready":{"pid":1}}"#).unwrap();
        }
        assert_eq!(output, b"{\"id\":0,\"ready\":{\"pid\":1}}\n");

        let pipe = WorkerPipe::new(&b""[..], Vec::new());
        assert_eq!(pipe.max_frame_bytes(), usize::MAX);
        assert_eq!(pipe.with_max_frame_bytes(64).max_frame_bytes(), 64);
    }
}
