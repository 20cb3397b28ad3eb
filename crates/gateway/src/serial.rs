//! USB CDC bridge to the ESP32 co-processor.
//!
//! One read-loop task owns the reader half of the port: it reopens the port
//! with backoff on any I/O error, splits the byte stream on `0x00`
//! terminators, and hands decoded payload maps to the registered handler.
//! Writes go through the writer half behind a mutex so frames never
//! interleave.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use frame::PayloadCodec;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};

/// Callback for decoded inbound frames. The orchestrator implements this;
/// taking a trait object here keeps the bridge free of any dependency on
/// the rest of the gateway.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, payload: Value);
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub device: PathBuf,
    pub baud: u32,
    pub retry: Duration,
    pub codec: PayloadCodec,
}

pub struct SerialBridge {
    config: SerialConfig,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    connected: AtomicBool,
    stop_tx: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialBridge {
    pub fn new(config: SerialConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            stop_tx,
            reader_task: Mutex::new(None),
        })
    }

    /// Spawn the read loop. Idempotent while a loop is already running.
    pub async fn start(self: Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let mut task = self.reader_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let _ = self.stop_tx.send(false);
        info!(
            "starting serial bridge on {} ({} baud, {} codec)",
            self.config.device.display(),
            self.config.baud,
            self.config.codec
        );
        let bridge = Arc::clone(&self);
        *task = Some(tokio::spawn(async move {
            bridge.read_loop(handler).await;
        }));
    }

    /// Signal the read loop to stop and wait for it to drop the port.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.reader_task.lock().await.take() {
            if let Err(err) = task.await {
                warn!("serial reader task join failed: {}", err);
            }
        }
        *self.writer.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
        info!("serial bridge stopped");
    }

    /// Encode and write one frame. Fails with `link_down` when no port is
    /// open; the write mutex keeps concurrent senders from interleaving.
    pub async fn send(&self, payload: &Value) -> Result<()> {
        let frame = frame::encode_frame(self.config.codec, payload)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            GatewayError::link_down(format!("{} not open", self.config.device.display()))
        })?;
        if let Err(err) = write_frame(writer, &frame).await {
            // The read loop owns recovery; surface the failure to the caller.
            warn!("serial write failed: {}", err);
            return Err(GatewayError::link_down(err));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_loop(self: Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let mut stop_rx = self.stop_tx.subscribe();
        while !*stop_rx.borrow() {
            let stream = match self.open_port(&mut stop_rx).await {
                Some(stream) => stream,
                None => break, // stopped while waiting for the device
            };
            let (reader, writer) = tokio::io::split(stream);
            *self.writer.lock().await = Some(writer);
            self.connected.store(true, Ordering::SeqCst);
            info!("serial port {} opened", self.config.device.display());

            self.pump_frames(reader, &handler, &mut stop_rx).await;

            *self.writer.lock().await = None;
            self.connected.store(false, Ordering::SeqCst);
            if *stop_rx.borrow() {
                break;
            }
            sleep_or_stop(self.config.retry, &mut stop_rx).await;
        }
        debug!("serial read loop terminated");
    }

    /// Keep trying to open the port until it appears or we are stopped.
    async fn open_port(&self, stop_rx: &mut watch::Receiver<bool>) -> Option<SerialStream> {
        loop {
            if *stop_rx.borrow() {
                return None;
            }
            let path = self.config.device.to_string_lossy();
            match tokio_serial::new(path.as_ref(), self.config.baud).open_native_async() {
                Ok(stream) => return Some(stream),
                Err(err) => {
                    warn!(
                        "serial port {} unavailable, retrying in {:?}: {}",
                        self.config.device.display(),
                        self.config.retry,
                        err
                    );
                    if !sleep_or_stop(self.config.retry, stop_rx).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Read until error or stop, splitting the stream on frame terminators.
    async fn pump_frames(
        &self,
        mut reader: ReadHalf<SerialStream>,
        handler: &Arc<dyn FrameHandler>,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return;
                    }
                }
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        error!("serial port {} closed by peer", self.config.device.display());
                        return;
                    }
                    Ok(_) => {
                        while let Some(pos) = buf.iter().position(|&b| b == 0) {
                            let raw = buf.split_to(pos + 1);
                            self.dispatch_frame(&raw, handler).await;
                        }
                    }
                    Err(err) => {
                        error!("serial read error: {}", err);
                        return;
                    }
                },
            }
        }
    }

    /// A corrupt frame is logged and dropped; it never tears down the loop.
    async fn dispatch_frame(&self, raw: &[u8], handler: &Arc<dyn FrameHandler>) {
        match frame::decode_frame(self.config.codec, raw) {
            Ok(payload) => handler.on_frame(payload).await,
            Err(err) => warn!("dropping corrupt serial frame: {}", err),
        }
    }
}

async fn write_frame(writer: &mut WriteHalf<SerialStream>, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Sleep, but wake early on the stop signal. Returns false when stopped.
async fn sleep_or_stop(period: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = stop_rx.changed() => !*stop_rx.borrow(),
    }
}
