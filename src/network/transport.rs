//! TCP transport: router and dealer sockets
//!
//! One router socket accepts all inbound connections and multiplexes
//! their messages into a single receive queue; one dealer socket per
//! peer carries outbound traffic. A dealer prepends its identity frame
//! (the local node address) to everything it sends so the remote router
//! can route replies back over the same connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x43, 0x53, 0x57, 0x4D]; // "CSWM"

/// Maximum allowed size of one multipart message
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Operation timed out")]
    Timeout,
    #[error("Connection closed by remote")]
    Closed,
}

/// Codec for multipart messages: magic, body length, frame count,
/// then length-prefixed frames
pub struct FrameCodec;

impl Encoder<Vec<Bytes>> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frames: Vec<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
        if body_len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message exceeds maximum size",
            ));
        }

        dst.reserve(8 + body_len);
        dst.put_slice(&MAGIC);
        dst.put_u32(body_len as u32);
        dst.put_u32(frames.len() as u32);
        for frame in frames {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(&frame);
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<Bytes>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least magic + body length
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid magic bytes",
            ));
        }

        let body_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if body_len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message exceeds maximum size",
            ));
        }

        if src.len() < 8 + body_len {
            src.reserve(8 + body_len - src.len());
            return Ok(None);
        }

        src.advance(8);
        let mut body = src.split_to(body_len);

        if body.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated frame count",
            ));
        }
        let count = body.get_u32() as usize;

        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            if body.len() < 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated frame header",
                ));
            }
            let len = body.get_u32() as usize;
            if body.len() < len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated frame body",
                ));
            }
            frames.push(body.split_to(len).freeze());
        }

        if !body.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after last frame",
            ));
        }
        Ok(Some(frames))
    }
}

type RouteMap = Arc<RwLock<HashMap<Bytes, mpsc::Sender<Vec<Bytes>>>>>;

/// The inbound socket: accepts connections, multiplexes their messages
/// into one queue, and routes replies back by identity frame
pub struct RouterSocket {
    local_addr: SocketAddr,
    inbound_tx: mpsc::Sender<Vec<Bytes>>,
    inbound_rx: Mutex<mpsc::Receiver<Vec<Bytes>>>,
    routes: RouteMap,
    accept_task: JoinHandle<()>,
}

impl RouterSocket {
    /// Bind to a port (0 picks any free port) and start accepting
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Router listening on {}", local_addr);

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let routes: RouteMap = Arc::new(RwLock::new(HashMap::new()));

        let accept_inbound = inbound_tx.clone();
        let accept_routes = routes.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log::debug!("Incoming connection from {}", addr);
                        tokio::spawn(serve_connection(
                            stream,
                            addr,
                            accept_inbound.clone(),
                            accept_routes.clone(),
                        ));
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            routes,
            accept_task,
        })
    }

    /// The locally bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The locally bound port
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Receive the next inbound multipart message, or `None` on timeout
    pub async fn recv(&self, timeout: Duration) -> Option<Vec<Bytes>> {
        let mut rx = self.inbound_rx.lock().await;
        time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Route a reply to the connection that introduced `identity`;
    /// returns false when no such connection remains
    pub async fn route(&self, identity: &Bytes, frames: Vec<Bytes>) -> bool {
        let tx = match self.routes.read().await.get(identity) {
            Some(tx) => tx.clone(),
            None => return false,
        };
        tx.send(frames).await.is_ok()
    }

    /// Serve a stream obtained outside the accept loop, e.g. one
    /// relayed through a NAT traversal server
    pub fn adopt(&self, stream: TcpStream, addr: SocketAddr) {
        tokio::spawn(serve_connection(
            stream,
            addr,
            self.inbound_tx.clone(),
            self.routes.clone(),
        ));
    }

    /// Stop accepting; existing connections drop with their pumps
    pub fn dispose(&self) {
        self.accept_task.abort();
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Pump one inbound connection: forward its messages to the shared
/// queue and register its identity for reply routing
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: mpsc::Sender<Vec<Bytes>>,
    routes: RouteMap,
) {
    let framed = Framed::new(stream, FrameCodec);
    let (writer, mut reader) = framed.split();

    let (tx, rx) = mpsc::channel::<Vec<Bytes>>(64);
    let write_task = tokio::spawn(write_pump(writer, rx));

    let mut identity: Option<Bytes> = None;
    while let Some(item) = reader.next().await {
        match item {
            Ok(frames) => {
                if frames.is_empty() {
                    continue;
                }
                if identity.is_none() {
                    // The first frame of everything a dealer sends is
                    // its identity; later connections with the same
                    // identity take over the route.
                    identity = Some(frames[0].clone());
                    routes.write().await.insert(frames[0].clone(), tx.clone());
                }
                if inbound.send(frames).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("Error reading from {}: {}", addr, e);
                break;
            }
        }
    }

    if let Some(identity) = identity {
        let mut routes = routes.write().await;
        if let Some(current) = routes.get(&identity) {
            if current.same_channel(&tx) {
                routes.remove(&identity);
            }
        }
    }
    write_task.abort();
    log::debug!("Connection from {} closed", addr);
}

async fn write_pump(
    mut writer: SplitSink<Framed<TcpStream, FrameCodec>, Vec<Bytes>>,
    mut rx: mpsc::Receiver<Vec<Bytes>>,
) {
    while let Some(frames) = rx.recv().await {
        if writer.send(frames).await.is_err() {
            break;
        }
    }
}

/// One outbound connection to a peer
///
/// Sends prepend the identity frame; the remote router uses it to route
/// replies back over this connection. Dropping the socket disposes it.
pub struct DealerSocket {
    endpoint: String,
    identity: Bytes,
    io: Mutex<Framed<TcpStream, FrameCodec>>,
}

impl DealerSocket {
    /// Connect to `host:port` within `timeout`
    pub async fn connect(
        host: &str,
        port: u16,
        identity: Bytes,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let endpoint = format!("{}:{}", host, port);
        let stream = time::timeout(timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| TransportError::Timeout)??;
        log::debug!("Dealer connected to {}", endpoint);

        Ok(Self {
            endpoint,
            identity,
            io: Mutex::new(Framed::new(stream, FrameCodec)),
        })
    }

    /// The remote endpoint this dealer talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one message within `timeout`
    pub async fn send(&self, frames: Vec<Bytes>, timeout: Duration) -> Result<(), TransportError> {
        time::timeout(timeout, async {
            let mut io = self.io.lock().await;
            io.send(self.with_identity(frames)).await
        })
        .await
        .map_err(|_| TransportError::Timeout)??;
        Ok(())
    }

    /// Receive one message within `timeout`
    pub async fn recv(&self, timeout: Duration) -> Result<Vec<Bytes>, TransportError> {
        let mut io = self.io.lock().await;
        time::timeout(timeout, io.next())
            .await
            .map_err(|_| TransportError::Timeout)?
            .ok_or(TransportError::Closed)?
            .map_err(TransportError::Io)
    }

    /// Send a request and collect `replies` answers, holding the socket
    /// for the whole exchange so interleaved sends cannot split it
    pub async fn exchange(
        &self,
        frames: Vec<Bytes>,
        replies: usize,
        timeout: Duration,
    ) -> Result<Vec<Vec<Bytes>>, TransportError> {
        let mut io = self.io.lock().await;
        time::timeout(timeout, io.send(self.with_identity(frames)))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let mut out = Vec::with_capacity(replies);
        for _ in 0..replies {
            let reply = time::timeout(timeout, io.next())
                .await
                .map_err(|_| TransportError::Timeout)?
                .ok_or(TransportError::Closed)?
                .map_err(TransportError::Io)?;
            out.push(reply);
        }
        Ok(out)
    }

    fn with_identity(&self, frames: Vec<Bytes>) -> Vec<Bytes> {
        let mut all = Vec::with_capacity(frames.len() + 1);
        all.push(self.identity.clone());
        all.extend(frames);
        all
    }
}

/// Queue of replies awaiting the single writer task
///
/// Handlers enqueue from any task; only the reply-writer loop drains,
/// keeping the router's write side single-threaded.
pub struct ReplyQueue {
    tx: mpsc::UnboundedSender<(Bytes, Vec<Bytes>)>,
    rx: Mutex<mpsc::UnboundedReceiver<(Bytes, Vec<Bytes>)>>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue a reply for the originating identity
    pub fn enqueue(&self, identity: Bytes, frames: Vec<Bytes>) {
        // The receiver lives as long as the queue, so this cannot fail
        let _ = self.tx.send((identity, frames));
    }

    /// Dequeue the next reply, or `None` on timeout
    pub async fn next(&self, timeout: Duration) -> Option<(Bytes, Vec<Bytes>)> {
        let mut rx = self.rx.lock().await;
        time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let mut codec = FrameCodec;
        let frames = vec![
            Bytes::from_static(b"identity"),
            Bytes::new(),
            Bytes::from_static(b"payload"),
        ];

        let mut buf = BytesMut::new();
        codec.encode(frames.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frames);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial_input() {
        let mut codec = FrameCodec;
        let frames = vec![Bytes::from_static(b"hello")];

        let mut full = BytesMut::new();
        codec.encode(frames.clone(), &mut full).unwrap();

        // Feed all but the last byte: no message yet
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.put_u8(full[full.len() - 1]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_codec_rejects_bad_magic() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x04\x00\x00\x00\x00"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_router_dealer_round_trip() {
        let router = RouterSocket::bind(0).await.unwrap();
        let port = router.local_port();

        let identity = Bytes::from_static(b"dealer-1");
        let dealer = DealerSocket::connect(
            "127.0.0.1",
            port,
            identity.clone(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        dealer
            .send(vec![Bytes::from_static(b"hello")], Duration::from_secs(5))
            .await
            .unwrap();

        let received = router.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(received[0], identity);
        assert_eq!(received[1], Bytes::from_static(b"hello"));

        // Route a reply back by identity
        assert!(
            router
                .route(&identity, vec![Bytes::from_static(b"world")])
                .await
        );
        let reply = dealer.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply[0], Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn test_route_to_unknown_identity_fails() {
        let router = RouterSocket::bind(0).await.unwrap();
        assert!(
            !router
                .route(&Bytes::from_static(b"nobody"), vec![Bytes::new()])
                .await
        );
    }

    #[tokio::test]
    async fn test_reply_queue_order() {
        let queue = ReplyQueue::new();
        queue.enqueue(Bytes::from_static(b"a"), vec![Bytes::from_static(b"1")]);
        queue.enqueue(Bytes::from_static(b"b"), vec![Bytes::from_static(b"2")]);

        let (first, _) = queue.next(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first, Bytes::from_static(b"a"));
        let (second, _) = queue.next(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second, Bytes::from_static(b"b"));
        assert!(queue.next(Duration::from_millis(50)).await.is_none());
    }
}
