use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{Mutex, RwLock, watch},
};

use crate::gbox::tunnel::{
    protocol::{Frame, FrameType},
    stream::{DEFAULT_ACK_TIMEOUT, Stream},
    transport::{BoxedSink, BoxedSource, Message, WsError, WsTransport},
};

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("multiplexer closed")]
    Closed,
    #[error("websocket send: {0}")]
    Send(#[source] WsError),
    #[error("websocket read: {0}")]
    Recv(#[source] WsError),
    #[error("remote closed the websocket (code {code}): {reason}")]
    RemoteClosed { code: u16, reason: String },
    #[error("websocket ended without a close frame")]
    Eof,
    #[error("reader loop already started")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct MuxOptions {
    pub ack_timeout: Duration,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// The only path to the socket's write half. Every frame goes through one lock, so frames
/// from concurrent streams never interleave.
#[derive(Clone)]
pub struct FrameSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    sink: Mutex<BoxedSink>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FrameSender {
    fn new(sink: BoxedSink) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                sink: Mutex::new(sink),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn send(&self, frame: Frame) -> Result<(), MuxError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::Binary(frame.encode()))
            .await
            .map_err(MuxError::Send)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // A writer stuck on a dead socket may hold the lock; do not wait on it forever.
        let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, async {
            let mut sink = self.inner.sink.lock().await;
            let _ = sink.close().await;
        })
        .await;
    }
}

/// One tunnel socket plus the streams it carries.
///
/// Exactly one task reads the socket ([`Multiplexer::run`]); any number of stream pumps write
/// through [`FrameSender`]. The multiplexer lives as long as its socket and is not reused
/// across reconnects.
pub struct Multiplexer {
    tx: FrameSender,
    source: Mutex<Option<BoxedSource>>,
    streams: RwLock<HashMap<u32, Arc<Stream>>>,
    id_seq: AtomicU32,
    closed: watch::Sender<bool>,
    opts: MuxOptions,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").finish_non_exhaustive()
    }
}

impl Multiplexer {
    pub fn new(transport: WsTransport, opts: MuxOptions) -> Arc<Self> {
        let (closed, _rx) = watch::channel(false);
        Arc::new(Self {
            tx: FrameSender::new(transport.sink),
            source: Mutex::new(Some(transport.source)),
            streams: RwLock::new(HashMap::new()),
            id_seq: AtomicU32::new(0),
            closed,
            opts,
        })
    }

    /// Next client-side stream id: 2, 4, 6, ... Odd ids belong to the remote peer.
    ///
    /// Ids are never reused on one multiplexer; `None` once the even ids are used up.
    pub fn new_stream_id(&self) -> Option<u32> {
        self.id_seq
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| cur.checked_add(2))
            .ok()
            .map(|prev| prev + 2)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Registers `conn` as stream `id` and starts its pump. The caller sends `Open` via the
    /// returned handle.
    pub async fn add_stream(self: &Arc<Self>, id: u32, conn: TcpStream) -> Arc<Stream> {
        let (rd, wr) = conn.into_split();
        let st = Arc::new(Stream::new(id, wr, self.tx.clone(), self.opts.ack_timeout));

        let closed = {
            let mut streams = self.streams.write().await;
            let closed = self.is_closed();
            if !closed {
                streams.insert(id, st.clone());
            }
            closed
        };
        if closed {
            st.close().await;
        }

        let mux = Arc::clone(self);
        let pumped = st.clone();
        tokio::spawn(async move {
            pumped.pump(rd).await;
            mux.remove_stream(id).await;
        });

        st
    }

    pub async fn send_frame(
        &self,
        kind: FrameType,
        stream_id: u32,
        payload: impl Into<Bytes>,
    ) -> Result<(), MuxError> {
        self.tx.send(Frame::new(kind, stream_id, payload)).await
    }

    pub async fn stream(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.read().await.get(&id).cloned()
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    async fn remove_stream(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.write().await.remove(&id)
    }

    /// The session's single reader loop. Returns `Ok(())` after a local [`Multiplexer::close`],
    /// otherwise the error that ended the socket.
    pub async fn run(&self) -> Result<(), MuxError> {
        let mut source = self
            .source
            .lock()
            .await
            .take()
            .ok_or(MuxError::AlreadyRunning)?;
        let mut closed = self.closed.subscribe();

        loop {
            let next = tokio::select! {
                _ = wait_closed(&mut closed) => return Ok(()),
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(b))) => self.dispatch(&b).await,
                Some(Ok(Message::Close(cf))) => {
                    let (code, reason) = cf
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Err(MuxError::RemoteClosed { code, reason });
                }
                Some(Ok(Message::Text(t))) => {
                    tracing::debug!(len = t.len(), "tunnel: ignoring text message");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(MuxError::Recv(err)),
                None => return Err(MuxError::Eof),
            }
        }
    }

    async fn dispatch(&self, raw: &[u8]) {
        let frame = match Frame::decode(raw) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(err = %err, "tunnel: dropping malformed frame");
                return;
            }
        };
        let id = frame.stream_id;

        match frame.kind {
            FrameType::Data => {
                // The remote may still be sending for a stream we already closed.
                let Some(st) = self.stream(id).await else {
                    tracing::debug!(stream = id, len = frame.payload.len(), "tunnel: data for unknown stream; dropped");
                    return;
                };
                if st.deliver(&frame.payload).await.is_err() {
                    self.remove_stream(id).await;
                }
            }
            FrameType::Close => {
                if let Some(st) = self.remove_stream(id).await {
                    tracing::debug!(stream = id, "tunnel: remote closed stream");
                    st.close().await;
                }
            }
            FrameType::Error => {
                tracing::warn!(
                    stream = id,
                    msg = %String::from_utf8_lossy(&frame.payload),
                    "tunnel: remote reported stream error"
                );
                if let Some(st) = self.remove_stream(id).await {
                    st.close().await;
                }
            }
            FrameType::Ack => match self.stream(id).await {
                Some(st) => {
                    if !st.mark_ready() {
                        tracing::debug!(stream = id, state = ?st.state(), "tunnel: ack for stream that is not pending");
                    }
                }
                None => tracing::debug!(stream = id, "tunnel: ack for unknown stream"),
            },
            FrameType::Open | FrameType::Unknown(_) => {
                tracing::debug!(stream = id, kind = %frame.kind, "tunnel: ignoring frame");
            }
        }
    }

    /// Idempotent. Force-closes every stream, empties the table and closes the socket.
    pub async fn close(&self) {
        let first = self.closed.send_if_modified(|c| {
            if *c {
                false
            } else {
                *c = true;
                true
            }
        });
        if !first {
            return;
        }

        let streams: Vec<Arc<Stream>> = {
            let mut table = self.streams.write().await;
            table.drain().map(|(_, st)| st).collect()
        };
        let n = streams.len();
        for st in streams {
            st.close().await;
        }
        self.tx.close().await;
        self.source.lock().await.take();
        tracing::debug!(streams = n, "tunnel: multiplexer closed");
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        net::TcpListener,
        task::JoinHandle,
    };
    use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};

    use super::*;
    use crate::gbox::tunnel::{stream::StreamState, transport};

    type Peer = WebSocketStream<DuplexStream>;

    async fn ws_pair() -> (WsTransport, Peer) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (client, server) = tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Client, None),
            WebSocketStream::from_raw_socket(b, Role::Server, None),
        );
        (transport::from_stream(client), server)
    }

    async fn start(ack_timeout: Duration) -> (Arc<Multiplexer>, Peer, JoinHandle<Result<(), MuxError>>) {
        let (t, peer) = ws_pair().await;
        let mux = Multiplexer::new(t, MuxOptions { ack_timeout });
        let reader = mux.clone();
        let run = tokio::spawn(async move { reader.run().await });
        (mux, peer, run)
    }

    /// Returns (application side, accepted side) of a loopback connection.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (app, accepted) = tokio::join!(TcpStream::connect(addr), ln.accept());
        (app.unwrap(), accepted.unwrap().0)
    }

    async fn next_frame(peer: &mut Peer) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), peer.next())
                .await
                .expect("frame within 5s")
                .expect("socket open")
                .expect("read ok");
            if let Message::Binary(b) = msg {
                return Frame::decode(&b).expect("whole frame");
            }
        }
    }

    async fn expect_silence(peer: &mut Peer, dur: Duration) {
        if let Ok(Some(Ok(Message::Binary(b)))) = tokio::time::timeout(dur, peer.next()).await {
            panic!("unexpected frame: {:?}", Frame::decode(&b));
        }
    }

    async fn peer_send(peer: &mut Peer, frame: Frame) {
        peer.send(Message::Binary(frame.encode())).await.unwrap();
    }

    async fn wait_for_count(mux: &Multiplexer, want: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while mux.stream_count().await != want {
            assert!(tokio::time::Instant::now() < deadline, "stream table never reached {want}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Registers a stream, sends its Open and acks it from the peer side.
    async fn open_acked(mux: &Arc<Multiplexer>, peer: &mut Peer) -> (u32, TcpStream) {
        let (app, accepted) = tcp_pair().await;
        let id = mux.new_stream_id().unwrap();
        let st = mux.add_stream(id, accepted).await;
        st.open("127.0.0.1:5555").await.unwrap();
        let open = next_frame(peer).await;
        assert_eq!(open.kind, FrameType::Open);
        assert_eq!(open.stream_id, id);
        peer_send(peer, Frame::new(FrameType::Ack, id, Bytes::new())).await;
        (id, app)
    }

    #[tokio::test]
    async fn stream_ids_are_even_and_strictly_increasing() {
        let (mux, _peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        let ids: Vec<u32> = (0..5).map(|_| mux.new_stream_id().unwrap()).collect();
        assert_eq!(ids, vec![2, 4, 6, 8, 10]);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let m = mux.clone();
            tasks.push(tokio::spawn(async move {
                (0..100).map(|_| m.new_stream_id().unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for t in tasks {
            for id in t.await.unwrap() {
                assert_eq!(id % 2, 0);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[tokio::test]
    async fn stream_ids_run_out_instead_of_wrapping() {
        let (mux, _peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        mux.id_seq.store(u32::MAX - 3, Ordering::Relaxed);
        assert_eq!(mux.new_stream_id(), Some(u32::MAX - 1));
        assert_eq!(mux.new_stream_id(), None);
        assert_eq!(mux.new_stream_id(), None);
    }

    #[tokio::test]
    async fn open_ack_then_bytes_flow_both_ways() {
        let (mux, mut peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (app, accepted) = tcp_pair().await;
        let mut app = app;

        let st = mux.add_stream(2, accepted).await;
        st.open("127.0.0.1:5555").await.unwrap();

        let open = next_frame(&mut peer).await;
        assert_eq!(open, Frame::open(2, "127.0.0.1:5555"));
        assert_eq!(st.state(), StreamState::Pending);

        peer_send(&mut peer, Frame::new(FrameType::Ack, 2, Bytes::new())).await;
        app.write_all(b"host:version").await.unwrap();

        let data = next_frame(&mut peer).await;
        assert_eq!(data.kind, FrameType::Data);
        assert_eq!(data.stream_id, 2);
        assert_eq!(&data.payload[..], b"host:version");
        assert_eq!(st.state(), StreamState::Ready);

        peer_send(&mut peer, Frame::data(2, &b"OKAY"[..])).await;
        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OKAY");
    }

    #[tokio::test]
    async fn pump_does_not_read_before_ack() {
        let (mux, mut peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (mut app, accepted) = tcp_pair().await;

        let st = mux.add_stream(mux.new_stream_id().unwrap(), accepted).await;
        app.write_all(b"early").await.unwrap();
        st.open("127.0.0.1:8080").await.unwrap();

        assert_eq!(next_frame(&mut peer).await.kind, FrameType::Open);
        expect_silence(&mut peer, Duration::from_millis(200)).await;

        peer_send(&mut peer, Frame::new(FrameType::Ack, st.id(), Bytes::new())).await;
        let data = next_frame(&mut peer).await;
        assert_eq!(data.kind, FrameType::Data);
        assert_eq!(&data.payload[..], b"early");
    }

    #[tokio::test]
    async fn ack_timeout_sends_one_close_and_no_data() {
        let (mux, mut peer, _run) = start(Duration::from_millis(200)).await;
        let (mut app, accepted) = tcp_pair().await;

        let id = mux.new_stream_id().unwrap();
        assert_eq!(id, 2);
        let st = mux.add_stream(id, accepted).await;
        st.open("127.0.0.1:5555").await.unwrap();
        app.write_all(b"never forwarded").await.unwrap();

        assert_eq!(next_frame(&mut peer).await.kind, FrameType::Open);
        let close = next_frame(&mut peer).await;
        assert_eq!(close, Frame::close(2));
        expect_silence(&mut peer, Duration::from_millis(300)).await;

        wait_for_count(&mux, 0).await;
        assert!(mux.stream(2).await.is_none());
        assert!(st.is_closed());

        let mut buf = [0u8; 16];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_stream_ids_do_not_disturb_live_streams() {
        let (mux, mut peer, run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (id, mut app) = open_acked(&mux, &mut peer).await;

        peer_send(&mut peer, Frame::data(99, &b"stray"[..])).await;
        peer_send(&mut peer, Frame::close(77)).await;
        peer_send(&mut peer, Frame::new(FrameType::Ack, 55, Bytes::new())).await;
        peer_send(&mut peer, Frame::new(FrameType::Unknown(9), id, &b"future"[..])).await;
        peer.send(Message::Binary(vec![2, 0])).await.unwrap();

        peer_send(&mut peer, Frame::data(id, &b"still here"[..])).await;
        let mut buf = [0u8; 10];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        assert!(!run.is_finished());
        assert_eq!(mux.stream_count().await, 1);
    }

    #[tokio::test]
    async fn remote_close_closes_local_connection_without_echo() {
        let (mux, mut peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (id, mut app) = open_acked(&mux, &mut peer).await;

        peer_send(&mut peer, Frame::close(id)).await;
        let mut buf = [0u8; 8];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
        expect_silence(&mut peer, Duration::from_millis(200)).await;
        wait_for_count(&mux, 0).await;
    }

    #[tokio::test]
    async fn error_frame_is_treated_as_close() {
        let (mux, mut peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (id, mut app) = open_acked(&mux, &mut peer).await;

        peer_send(&mut peer, Frame::new(FrameType::Error, id, &b"connection refused"[..])).await;
        let mut buf = [0u8; 8];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
        wait_for_count(&mux, 0).await;
    }

    #[tokio::test]
    async fn local_eof_sends_close() {
        let (mux, mut peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (id, app) = open_acked(&mux, &mut peer).await;

        drop(app);
        assert_eq!(next_frame(&mut peer).await, Frame::close(id));
        wait_for_count(&mux, 0).await;
    }

    #[tokio::test]
    async fn concurrent_pumps_write_whole_frames() {
        const STREAMS: usize = 8;
        const CHUNKS: usize = 32;
        const CHUNK: usize = 1024;

        let (mux, mut peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;

        let mut apps = Vec::new();
        for _ in 0..STREAMS {
            apps.push(open_acked(&mux, &mut peer).await);
        }

        let mut fills = HashMap::new();
        let mut writers = Vec::new();
        for (i, (id, mut app)) in apps.into_iter().enumerate() {
            let fill = b'a' + i as u8;
            fills.insert(id, fill);
            writers.push(tokio::spawn(async move {
                for _ in 0..CHUNKS {
                    app.write_all(&[fill; CHUNK]).await.unwrap();
                }
                app.shutdown().await.unwrap();
                // Keep the read side open until the close frame is out.
                let mut sink = Vec::new();
                let _ = app.read_to_end(&mut sink).await;
            }));
        }

        let mut received: HashMap<u32, usize> = HashMap::new();
        let mut closed = HashSet::new();
        while closed.len() < STREAMS {
            let f = next_frame(&mut peer).await;
            let fill = fills[&f.stream_id];
            match f.kind {
                FrameType::Data => {
                    assert!(f.payload.iter().all(|b| *b == fill), "interleaved payload");
                    *received.entry(f.stream_id).or_default() += f.payload.len();
                }
                FrameType::Close => {
                    closed.insert(f.stream_id);
                }
                other => panic!("unexpected {other}"),
            }
        }

        for id in fills.keys() {
            assert_eq!(received.get(id).copied().unwrap_or(0), CHUNKS * CHUNK);
        }
        for w in writers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_ends_run_and_every_stream() {
        let (mux, mut peer, run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (_id, mut app) = open_acked(&mux, &mut peer).await;
        let (app2, accepted) = tcp_pair().await;
        let pending = mux.add_stream(mux.new_stream_id().unwrap(), accepted).await;

        mux.close().await;
        mux.close().await;

        assert!(run.await.unwrap().is_ok());
        assert_eq!(mux.stream_count().await, 0);
        assert!(pending.is_closed());

        let mut buf = [0u8; 8];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
        drop(app2);

        assert!(matches!(
            mux.send_frame(FrameType::Data, 2, Bytes::new()).await,
            Err(MuxError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_does_not_wait_for_a_local_app_that_stopped_reading() {
        let (mux, mut peer, run) = start(DEFAULT_ACK_TIMEOUT).await;
        let (id, _app) = open_acked(&mux, &mut peer).await;

        // The app never reads, so deliveries eventually block on a full socket buffer.
        let flood = tokio::spawn(async move {
            let chunk = Bytes::from(vec![0u8; 256 * 1024]);
            for _ in 0..256 {
                if peer.send(Message::Binary(Frame::data(id, chunk.clone()).encode())).await.is_err() {
                    break;
                }
            }
            peer
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        tokio::time::timeout(Duration::from_secs(5), mux.close())
            .await
            .expect("close returns while a delivery is blocked");
        let res = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("reader exits after close")
            .unwrap();
        assert!(res.is_ok(), "{res:?}");
        assert_eq!(mux.stream_count().await, 0);
        flood.abort();
    }

    #[tokio::test]
    async fn add_stream_after_close_is_closed_immediately() {
        let (mux, _peer, _run) = start(DEFAULT_ACK_TIMEOUT).await;
        mux.close().await;

        let (mut app, accepted) = tcp_pair().await;
        let st = mux.add_stream(mux.new_stream_id().unwrap(), accepted).await;
        assert!(st.is_closed());
        assert_eq!(mux.stream_count().await, 0);
        let mut buf = [0u8; 8];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_reports_remote_disconnect() {
        let (mux, peer, run) = start(DEFAULT_ACK_TIMEOUT).await;
        drop(peer);
        let res = run.await.unwrap();
        assert!(res.is_err(), "expected error, got {res:?}");

        assert!(matches!(mux.run().await, Err(MuxError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn run_reports_remote_close_frame() {
        let (_mux, mut peer, run) = start(DEFAULT_ACK_TIMEOUT).await;
        peer.close(None).await.unwrap();
        match run.await.unwrap() {
            Err(MuxError::RemoteClosed { code, .. }) => assert_eq!(code, 1005),
            other => panic!("unexpected {other:?}"),
        }
    }
}
