//! Stdio bridge protocol client
//!
//! Lets an editor that can only launch a stdio language server talk to a
//! server listening on a socket: stdin is forwarded to the server and the
//! server's output is written to stdout.
//!
//! With newline translation on (for console use), outbound `\n` becomes
//! `\r\n` and inbound `\r\n` becomes `\n`. Without it bytes pass verbatim and
//! inbound `Content-Length` frames are traced.

use crate::connection::DuplexHandle;
use crate::protocol::client::{ClientOptions, ProtocolClient, ProtocolClientFactory};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::join_all;
use lsp_bridge_shared::codec::{CrlfDecoder, CrlfEncoder, FrameDecoder};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const BUF_SIZE: usize = 4096;

/// Creates a `StdioBridge` over the process's own stdin/stdout
pub struct StdioBridgeFactory {
    translate_newlines: bool,
    closed: Arc<Notify>,
}

impl StdioBridgeFactory {
    pub fn new(translate_newlines: bool) -> Self {
        Self {
            translate_newlines,
            closed: Arc::new(Notify::new()),
        }
    }

    /// Notified when a bridge loses its stdin or its server
    pub fn closed(&self) -> Arc<Notify> {
        self.closed.clone()
    }
}

impl ProtocolClientFactory for StdioBridgeFactory {
    fn create(
        &self,
        stream: DuplexHandle,
        options: &ClientOptions,
    ) -> Result<Box<dyn ProtocolClient>> {
        Ok(Box::new(StdioBridge::new(
            stream,
            tokio::io::stdin(),
            tokio::io::stdout(),
            self.translate_newlines,
            options.clone(),
            self.closed.clone(),
        )))
    }
}

struct Endpoints<I, O> {
    stream: DuplexHandle,
    input: I,
    output: O,
}

/// Pumps bytes between a local input/output pair and the server
pub struct StdioBridge<I, O> {
    pending: Option<Endpoints<I, O>>,
    translate_newlines: bool,
    options: ClientOptions,
    closed: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl<I, O> StdioBridge<I, O>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: DuplexHandle,
        input: I,
        output: O,
        translate_newlines: bool,
        options: ClientOptions,
        closed: Arc<Notify>,
    ) -> Self {
        Self {
            pending: Some(Endpoints {
                stream,
                input,
                output,
            }),
            translate_newlines,
            options,
            closed,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl<I, O> ProtocolClient for StdioBridge<I, O>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&mut self) -> Result<()> {
        let Endpoints {
            stream,
            input,
            output,
        } = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("stdio bridge already started or stopped"))?;

        let selectors = self
            .options
            .selectors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            "[BRIDGE] Bridging stdio to {} (generation {}) for [{}], watching {}",
            stream.peer(),
            stream.generation(),
            selectors,
            self.options.watch_pattern
        );

        let translate = self.translate_newlines;
        let (server_rx, server_tx) = tokio::io::split(stream);

        let closed = self.closed.clone();
        self.tasks.push(tokio::spawn(async move {
            match pump_uplink(input, server_tx, translate).await {
                Ok(bytes) => info!("[BRIDGE] Input closed after {} bytes", bytes),
                Err(e) => warn!("[BRIDGE] Uplink failed: {}", e),
            }
            closed.notify_one();
        }));

        let closed = self.closed.clone();
        self.tasks.push(tokio::spawn(async move {
            match pump_downlink(server_rx, output, translate).await {
                Ok(bytes) => info!("[BRIDGE] Server closed the connection after {} bytes", bytes),
                Err(e) => warn!("[BRIDGE] Downlink failed: {}", e),
            }
            closed.notify_one();
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.pending = None;
        for task in &self.tasks {
            task.abort();
        }
        for result in join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("[BRIDGE] Pump task panicked: {}", e);
                }
            }
        }
        debug!("[BRIDGE] Stopped");
        Ok(())
    }
}

/// Copy local input to the server until input ends
async fn pump_uplink<R, W>(mut input: R, mut server: W, translate: bool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut encoder = CrlfEncoder::new();
    let mut translated = BytesMut::with_capacity(BUF_SIZE * 2);
    let mut total = 0u64;

    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            server.shutdown().await?;
            return Ok(total);
        }

        if translate {
            encoder.encode(&buf[..n], &mut translated);
            server.write_all(&translated).await?;
            total += translated.len() as u64;
            translated.clear();
        } else {
            server.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        server.flush().await?;
    }
}

/// Copy server output to the local output until the server closes
async fn pump_downlink<R, W>(mut server: R, mut output: W, translate: bool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut decoder = CrlfDecoder::new();
    let mut translated = BytesMut::with_capacity(BUF_SIZE);
    let mut frames = (!translate).then(FrameDecoder::new);
    let mut total = 0u64;

    loop {
        let n = server.read(&mut buf).await?;
        if n == 0 {
            if translate {
                decoder.finish(&mut translated);
                output.write_all(&translated).await?;
                total += translated.len() as u64;
            }
            output.flush().await?;
            return Ok(total);
        }

        if translate {
            decoder.decode(&buf[..n], &mut translated);
            output.write_all(&translated).await?;
            total += translated.len() as u64;
            translated.clear();
        } else {
            output.write_all(&buf[..n]).await?;
            total += n as u64;
            if let Some(frame_decoder) = frames.as_mut() {
                if !trace_frames(frame_decoder, &buf[..n]) {
                    frames = None;
                }
            }
        }
        output.flush().await?;
    }
}

/// Log each complete frame; returns false once the traffic turns out not to be framed
fn trace_frames(frames: &mut FrameDecoder, data: &[u8]) -> bool {
    frames.extend(data);
    loop {
        match frames.decode_next() {
            Ok(Some(body)) => trace!("[BRIDGE] server frame: {} bytes", body.len()),
            Ok(None) => return true,
            Err(e) => {
                debug!("[BRIDGE] Server output is not framed ({}), frame tracing off", e);
                return false;
            }
        }
    }
}
