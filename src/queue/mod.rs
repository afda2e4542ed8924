use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::color::{Palette, Rgb};
use crate::device::{DeviceCommandPort, DeviceError, LampTarget};

#[derive(Debug, Clone, PartialEq)]
pub enum LampCommand {
    SetColor {
        lamp: String,
        color: Rgb,
    },
    RunEffect {
        target: LampTarget,
        palette: Palette,
        duration: Duration,
    },
}

impl LampCommand {
    pub async fn execute(&self, port: &dyn DeviceCommandPort) -> Result<(), DeviceError> {
        match self {
            Self::SetColor { lamp, color } => port.set_color(lamp, *color).await,
            Self::RunEffect {
                target,
                palette,
                duration,
            } => port.run_effect(target, palette, *duration).await,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::SetColor { lamp, color } => format!("set_color {lamp} {color}"),
            Self::RunEffect {
                target, palette, ..
            } => format!("run_effect {target} {}", palette.name),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("command queue is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub command_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            command_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<LampCommand>,
}

impl CommandSender {
    pub async fn enqueue(&self, command: LampCommand) -> Result<(), QueueError> {
        self.tx.send(command).await.map_err(|_| QueueError::Closed)
    }
}

pub struct CommandQueue {
    sender: CommandSender,
    stop_tx: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    pub fn start(port: Arc<dyn DeviceCommandPort>, settings: QueueSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(consume(rx, stop_rx, port, settings.command_timeout));
        Self {
            sender: CommandSender { tx },
            stop_tx,
            worker,
        }
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        drop(self.sender);
        if let Err(err) = self.worker.await {
            tracing::error!(error = %err, "command queue worker ended abnormally");
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<LampCommand>,
    mut stop_rx: oneshot::Receiver<()>,
    port: Arc<dyn DeviceCommandPort>,
    timeout: Duration,
) {
    let mut stopping = false;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx, if !stopping => {
                stopping = true;
                rx.close();
                tracing::debug!("command queue closing, draining remaining commands");
            }
            next = rx.recv() => match next {
                Some(command) => run_one(&command, port.as_ref(), timeout).await,
                None => break,
            },
        }
    }
    tracing::debug!("command queue drained");
}

async fn run_one(command: &LampCommand, port: &dyn DeviceCommandPort, timeout: Duration) {
    let label = command.label();
    let guarded = AssertUnwindSafe(command.execute(port)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(Ok(()))) => tracing::debug!(command = %label, "command executed"),
        Ok(Ok(Err(err))) => tracing::warn!(command = %label, error = %err, "command failed"),
        Ok(Err(_)) => tracing::error!(command = %label, "command panicked"),
        Err(_) => tracing::warn!(
            command = %label,
            timeout_ms = timeout.as_millis() as u64,
            "device timeout"
        ),
    }
}
