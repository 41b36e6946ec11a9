use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::frame::{read_frame, write_frame, Frame, WireError};

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;
type StreamSenders = Arc<Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>>;

/// Chunks (and end markers) for a stream ID that arrived before the
/// receiving side called [`Connection::register_inbound_stream`].
/// Nothing serializes "the `Request` naming a `stream_id`" ahead of
/// "the `StreamData` frames for it" on the wire — the producer opens
/// the outbound stream and starts feeding it concurrently with
/// building and sending the RPC call that carries the ID — so early
/// arrivals are buffered here instead of silently dropped.
#[derive(Default)]
struct EarlyStream {
    chunks: Vec<Vec<u8>>,
    ended: bool,
}

type EarlyStreams = Arc<Mutex<HashMap<u64, EarlyStream>>>;

/// One end of the RPC channel, symmetric: both the host (talking to a
/// plugin) and the plugin (talking to the host) use the same type. A
/// background task demultiplexes incoming frames: `Response`s resolve
/// pending calls, `StreamData`/`StreamEnd` feed registered stream
/// readers, `Ping` is answered automatically, and `Request`s are handed
/// to the caller via `incoming`.
pub struct Connection {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: PendingCalls,
    streams: StreamSenders,
    early_streams: EarlyStreams,
    next_id: AtomicU64,
    incoming: Mutex<mpsc::Receiver<(u64, String, serde_json::Value)>>,
}

impl Connection {
    /// Wrap a duplex byte stream (a TLS stream in production, an
    /// in-memory pipe in tests) and spawn the background reader.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = split(stream);
        let writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>> = Arc::new(Mutex::new(Box::new(write_half)));
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let streams: StreamSenders = Arc::new(Mutex::new(HashMap::new()));
        let early_streams: EarlyStreams = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = mpsc::channel(32);

        tokio::spawn(reader_loop(
            read_half,
            writer.clone(),
            pending.clone(),
            streams.clone(),
            early_streams.clone(),
            incoming_tx,
        ));

        Self { writer, pending, streams, early_streams, next_id: AtomicU64::new(1), incoming: Mutex::new(incoming_rx) }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Call a remote method and wait for its response.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, TransportError> {
        let id = self.alloc_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = Frame::Request { id, method: method.to_string(), params };
        if let Err(e) = write_frame(&mut *self.writer.lock().await, &frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| TransportError::Closed)?;
        match response {
            Frame::Response { result, error, .. } => match error {
                Some(e) => Err(TransportError::Handshake(e.message)),
                None => Ok(result.unwrap_or(serde_json::Value::Null)),
            },
            other => Err(TransportError::Handshake(format!("unexpected frame in response slot: {other:?}"))),
        }
    }

    /// Same as [`Connection::call`] but decodes the `WireError` sentinel
    /// into a typed [`ingest_api::PluginError`] instead of collapsing
    /// everything into a transport error, and races the round-trip
    /// against `cancel` — a fired token abandons the pending call and
    /// returns a `Cancelled`-kind error instead of waiting for a reply
    /// that may never come (`spec.md` §4.3/§5's context deadline).
    pub async fn call_typed(
        &self,
        method: &str,
        params: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ingest_api::PluginError> {
        let id = self.alloc_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = Frame::Request { id, method: method.to_string(), params };
        if let Err(e) = write_frame(&mut *self.writer.lock().await, &frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        let response = tokio::select! {
            response = rx => response.map_err(|_| ingest_api::PluginError::cancelled())?,
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                return Err(ingest_api::PluginError::cancelled());
            }
        };
        match response {
            Frame::Response { error: Some(e), .. } => Err(e.into_plugin_error()),
            Frame::Response { result, error: None, .. } => Ok(result.unwrap_or(serde_json::Value::Null)),
            other => Err(ingest_api::PluginError::io(format!("unexpected frame: {other:?}"))),
        }
    }

    /// Reply to a `Request` previously received via [`Connection::recv_request`].
    pub async fn respond(&self, id: u64, result: Result<serde_json::Value, WireError>) -> Result<(), TransportError> {
        let frame = match result {
            Ok(v) => Frame::Response { id, result: Some(v), error: None },
            Err(e) => Frame::Response { id, result: None, error: Some(e) },
        };
        write_frame(&mut *self.writer.lock().await, &frame).await
    }

    /// Receive the next inbound method call (used by the plugin side to
    /// serve requests).
    pub async fn recv_request(&self) -> Option<(u64, String, serde_json::Value)> {
        self.incoming.lock().await.recv().await
    }

    /// Send a liveness ping and wait for the matching pong. Used by the
    /// plugin manager's watchdog.
    pub async fn ping(&self) -> Result<(), TransportError> {
        let id = self.alloc_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        write_frame(&mut *self.writer.lock().await, &Frame::Ping { id }).await?;
        match rx.await.map_err(|_| TransportError::Closed)? {
            Frame::Pong { .. } => Ok(()),
            other => Err(TransportError::Handshake(format!("expected pong, got {other:?}"))),
        }
    }

    /// Open a new outbound stream ID and register a channel the caller
    /// writes chunks into; a background task drains it onto the wire as
    /// `StreamData` frames, sending `StreamEnd` when the sender drops.
    pub fn open_outbound_stream(self: &Arc<Self>) -> (u64, mpsc::Sender<Vec<u8>>) {
        let stream_id = self.alloc_id();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
        let conn = self.clone();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_frame(&mut *conn.writer.lock().await, &Frame::StreamData { stream_id, data: chunk }).await.is_err() {
                    return;
                }
            }
            let _ = write_frame(&mut *conn.writer.lock().await, &Frame::StreamEnd { stream_id }).await;
        });
        (stream_id, tx)
    }

    /// Register `stream_id` as an inbound stream, returning the reader
    /// half. Safe to call even after `StreamData`/`StreamEnd` frames
    /// for this ID have already arrived (see [`EarlyStream`]) — any
    /// buffered chunks are replayed into the channel before it is
    /// handed back.
    pub async fn register_inbound_stream(&self, stream_id: u64) -> StreamReader {
        let (tx, rx) = mpsc::channel(8);

        if let Some(early) = self.early_streams.lock().await.remove(&stream_id) {
            for chunk in early.chunks {
                let _ = tx.send(chunk).await;
            }
            if early.ended {
                return StreamReader::new(rx);
            }
        }

        self.streams.lock().await.insert(stream_id, tx);
        StreamReader::new(rx)
    }
}

async fn reader_loop<R: AsyncRead + Send + Unpin + 'static>(
    mut reader: R,
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: PendingCalls,
    streams: StreamSenders,
    early_streams: EarlyStreams,
    incoming: mpsc::Sender<(u64, String, serde_json::Value)>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(f) => f,
            Err(_) => {
                pending.lock().await.clear();
                streams.lock().await.clear();
                return;
            }
        };
        match frame {
            Frame::Request { id, method, params } => {
                if incoming.send((id, method, params)).await.is_err() {
                    return;
                }
            }
            resp @ Frame::Response { id, .. } => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(resp);
                }
            }
            Frame::StreamData { stream_id, data } => {
                let sender = streams.lock().await.get(&stream_id).cloned();
                match sender {
                    Some(sender) => {
                        let _ = sender.send(data).await;
                    }
                    None => {
                        early_streams.lock().await.entry(stream_id).or_default().chunks.push(data);
                    }
                }
            }
            Frame::StreamEnd { stream_id } => {
                let had_receiver = streams.lock().await.remove(&stream_id).is_some();
                if !had_receiver {
                    early_streams.lock().await.entry(stream_id).or_default().ended = true;
                }
            }
            Frame::Ping { id } => {
                let _ = write_frame(&mut *writer.lock().await, &Frame::Pong { id }).await;
            }
            pong @ Frame::Pong { id } => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(pong);
                }
            }
        }
    }
}

/// An [`AsyncRead`] adapter over an inbound stream's chunk channel, used
/// as the backing of a downloaded [`ingest_api::Object`]'s byte stream.
pub struct StreamReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: std::collections::VecDeque<u8>,
}

impl StreamReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx, buf: std::collections::VecDeque::new() }
    }
}

impl AsyncRead for StreamReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;

        if self.buf.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.buf.extend(chunk),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = std::cmp::min(buf.remaining(), self.buf.len());
        let drained: Vec<u8> = self.buf.drain(..n).collect();
        buf.put_slice(&drained);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn call_and_respond_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let client = Arc::new(Connection::new(client_io));
        let server = Arc::new(Connection::new(server_io));

        let server_task = tokio::spawn({
            let server = server.clone();
            async move {
                let (id, method, _params) = server.recv_request().await.unwrap();
                assert_eq!(method, "Ping");
                server.respond(id, Ok(serde_json::json!({"ok": true}))).await.unwrap();
            }
        });

        let result = client.call("Ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn typed_error_round_trips_sentinel() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let client = Arc::new(Connection::new(client_io));
        let server = Arc::new(Connection::new(server_io));

        tokio::spawn({
            let server = server.clone();
            async move {
                let (id, _method, _params) = server.recv_request().await.unwrap();
                server.respond(id, Err(WireError { sentinel: Some("not_exist".into()), message: "not exist".into() })).await.unwrap();
            }
        });

        let err = client.call_typed("Stat", serde_json::json!({}), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn call_typed_returns_cancelled_without_waiting_for_a_reply() {
        let (client_io, _server_io) = tokio::io::duplex(8192);
        let client = Arc::new(Connection::new(client_io));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.call_typed("Next", serde_json::json!({}), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ingest_api::ErrorKind::Cancelled);
        assert!(client.pending.lock().await.is_empty(), "cancelled call must not leak its pending entry");
    }

    #[tokio::test]
    async fn stream_data_reaches_registered_reader() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let client = Arc::new(Connection::new(client_io));
        let server = Arc::new(Connection::new(server_io));

        // Real callers register the reader under the stream_id carried in
        // the method response *before* the producer can send on it; here
        // both sides' id allocators start at 1, so the server's first
        // `open_outbound_stream` call is known to use id 1.
        let mut reader = client.register_inbound_stream(1).await;
        let (stream_id, tx) = server.open_outbound_stream();
        assert_eq!(stream_id, 1);
        tx.send(b"hello ".to_vec()).await.unwrap();
        tx.send(b"world".to_vec()).await.unwrap();
        drop(tx);

        let mut received = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if received.len() >= b"hello world".len() {
                break;
            }
        }
        assert_eq!(received, b"hello world");
    }
}
