//! Interactive PTY shell channel.
//!
//! A background reader drains the channel into a single bounded output
//! buffer (PTYs merge stdout and stderr) which terminal sessions consume
//! incrementally. Input goes through the channel's write half so writes
//! never contend with the reader.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, client};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::error::TransportError;

use super::{MAX_SHELL_BUFFER, ShellChannel, append_bounded};

pub(crate) struct SshShell {
    writer: Mutex<ChannelWriteHalf<client::Msg>>,
    output: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl SshShell {
    /// Split the channel and start the background reader.
    pub(crate) fn spawn(channel: Channel<client::Msg>) -> Self {
        let (read_half, write_half) = channel.split();
        let output = Arc::new(Mutex::new(Vec::with_capacity(4096)));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();

        tokio::spawn(read_shell_output(
            read_half,
            output.clone(),
            closed.clone(),
            cancel_token.clone(),
        ));

        Self {
            writer: Mutex::new(write_half),
            output,
            closed,
            cancel_token,
        }
    }
}

async fn read_shell_output(
    mut read_half: ChannelReadHalf,
    output: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,

            msg = read_half.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    append_bounded(&mut *output.lock().await, &data, MAX_SHELL_BUFFER);
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    append_bounded(&mut *output.lock().await, &data, MAX_SHELL_BUFFER);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("Shell channel closed by remote");
                    break;
                }
                Some(_) => {}
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Io("Shell channel is closed".to_string()));
        }
        self.writer
            .lock()
            .await
            .data(data)
            .await
            .map_err(|e| TransportError::Io(format!("Failed to write to shell: {}", e)))
    }

    async fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.output.lock().await)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.cancel_token.cancel();
        if let Err(e) = self.writer.lock().await.close().await {
            debug!("Failed to close shell channel: {}", e);
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}
