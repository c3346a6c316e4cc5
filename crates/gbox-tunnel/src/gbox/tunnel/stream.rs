use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::{Mutex, watch},
};

use crate::gbox::tunnel::{
    multiplexer::{FrameSender, MuxError},
    protocol::Frame,
};

/// How long a freshly opened stream waits for the remote `Ack`.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUF_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// `Open` sent, waiting for `Ack`. Nothing is read from the local socket yet.
    Pending,
    Ready,
    Closed,
}

/// One local TCP connection carried over the tunnel socket.
///
/// The stream owns the local connection: the write half lives here (used by
/// [`Stream::deliver`]), the read half is owned by the pump task.
pub struct Stream {
    id: u32,
    tx: FrameSender,
    state: watch::Sender<StreamState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    ack_timeout: Duration,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        writer: OwnedWriteHalf,
        tx: FrameSender,
        ack_timeout: Duration,
    ) -> Self {
        let (state, _rx) = watch::channel(StreamState::Pending);
        Self {
            id,
            tx,
            state,
            writer: Mutex::new(Some(writer)),
            ack_timeout,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Sends the `Open` frame for `target` (`"<ip>:<port>"`). Does not wait for the `Ack`.
    pub async fn open(&self, target: &str) -> Result<(), MuxError> {
        tracing::debug!(stream = self.id, target = %target, "tunnel: opening stream");
        self.tx.send(Frame::open(self.id, target)).await
    }

    /// Pending -> Ready. Returns false if the stream was not pending.
    pub(crate) fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == StreamState::Pending {
                *s = StreamState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Writes an inbound `Data` payload to the local connection. A failed write closes the
    /// stream and tells the remote end.
    ///
    /// A write blocked on a local reader that has stopped reading is abandoned as soon as the
    /// stream is closed, so [`Stream::close`] never waits behind it.
    pub async fn deliver(&self, payload: &[u8]) -> io::Result<()> {
        let mut state = self.state.subscribe();
        let res = {
            let mut w = self.writer.lock().await;
            match w.as_mut() {
                Some(w) => tokio::select! {
                    res = w.write_all(payload) => res,
                    _ = wait_closed(&mut state) => Err(closed_err()),
                },
                None => Err(closed_err()),
            }
        };

        if let Err(err) = &res {
            tracing::debug!(stream = self.id, err = %err, "tunnel: local write failed");
            if self.close().await {
                let _ = self.tx.send(Frame::close(self.id)).await;
            }
        }
        res
    }

    /// Idempotent. Returns true only for the call that actually closed the stream.
    ///
    /// Moving to `Closed` also releases a pump still waiting for its `Ack`.
    pub async fn close(&self) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if *s == StreamState::Closed {
                false
            } else {
                *s = StreamState::Closed;
                true
            }
        });
        if changed {
            if let Some(mut w) = self.writer.lock().await.take() {
                let _ = w.shutdown().await;
            }
        }
        changed
    }

    /// Copies the local connection into `Data` frames until EOF, a read error, a send
    /// failure, or a close from the other direction.
    ///
    /// Nothing is read before the `Ack` arrives. If the ack timeout fires first the stream
    /// sends a single `Close` and exits without copying.
    pub(crate) async fn pump(self: Arc<Self>, mut rd: OwnedReadHalf) {
        let mut state = self.state.subscribe();

        let gate = tokio::time::timeout(
            self.ack_timeout,
            state.wait_for(|s| *s != StreamState::Pending),
        )
        .await
        .map(|r| r.map(|s| *s));

        match gate {
            Err(_) => {
                tracing::warn!(
                    stream = self.id,
                    timeout = %humantime::format_duration(self.ack_timeout),
                    "tunnel: no ack from remote; closing stream"
                );
                if self.close().await {
                    let _ = self.tx.send(Frame::close(self.id)).await;
                }
                return;
            }
            Ok(Err(_)) | Ok(Ok(StreamState::Closed)) => return,
            Ok(Ok(_)) => {}
        }

        let mut buf = vec![0u8; READ_BUF_BYTES];
        loop {
            tokio::select! {
                res = rd.read(&mut buf) => {
                    let n = match res {
                        Ok(0) => 0,
                        Ok(n) => n,
                        Err(err) => {
                            tracing::debug!(stream = self.id, err = %err, "tunnel: local read failed");
                            0
                        }
                    };
                    if n == 0 {
                        if self.close().await {
                            let _ = self.tx.send(Frame::close(self.id)).await;
                        }
                        break;
                    }
                    let frame = Frame::data(self.id, Bytes::copy_from_slice(&buf[..n]));
                    if let Err(err) = self.tx.send(frame).await {
                        tracing::debug!(stream = self.id, err = %err, "tunnel: data send failed");
                        self.close().await;
                        break;
                    }
                }
                _ = wait_closed(&mut state) => break,
            }
        }
        tracing::debug!(stream = self.id, "tunnel: stream finished");
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

async fn wait_closed(rx: &mut watch::Receiver<StreamState>) {
    let _ = rx.wait_for(|s| *s == StreamState::Closed).await;
}
