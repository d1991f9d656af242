//! Transport abstraction: a `Connection` sends/receives length-framed wire
//! messages, a `Server` accepts inbound connections. Three implementations
//! are provided: `websocket` (tokio-tungstenite), `multiplexed` (raw
//! length-prefixed TCP, one stream per `Connection` — stream multiplexing
//! itself is out of scope), and `local` (in-memory, for tests).

use crate::net::error::{NetworkError, NetworkResult};
use crate::net::message::NetworkMessage;
use async_trait::async_trait;
use std::fmt;

/// Connection lifecycle state (§3). Transport implementations report this;
/// `NetworkPeer` drives it alongside its own handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A bidirectional message channel to a single remote peer.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&mut self, msg: &NetworkMessage) -> NetworkResult<()>;
    async fn recv(&mut self) -> NetworkResult<NetworkMessage>;
    fn state(&self) -> ConnectionState;
    async fn close(&mut self);
    fn peer_description(&self) -> String;
}

/// Accepts inbound connections, yielding one `Connection` per accepted peer.
#[async_trait]
pub trait Server: Send + Sync {
    async fn accept(&mut self) -> NetworkResult<Box<dyn Connection>>;
    fn local_description(&self) -> String;
}

/// Length-prefixed framing shared by the multiplexed and local transports:
/// `u32 BE length || frame bytes`.
pub mod framing {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

    pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
        w: &mut W,
        bytes: &[u8],
    ) -> NetworkResult<()> {
        if bytes.len() as u64 > MAX_FRAME_LEN as u64 {
            return Err(NetworkError::ProtocolViolation(
                None,
                "frame too large".to_string(),
            ));
        }
        w.write_all(&(bytes.len() as u32).to_be_bytes())
            .await
            .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
        w.write_all(bytes)
            .await
            .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
        Ok(())
    }

    pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> NetworkResult<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)
            .await
            .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(NetworkError::ProtocolViolation(
                None,
                "frame too large".to_string(),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)
            .await
            .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
        Ok(buf)
    }
}

pub mod multiplexed {
    use super::framing::{read_frame, write_frame};
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    pub struct TcpConnection {
        stream: TcpStream,
        state: ConnectionState,
        peer_desc: String,
    }

    impl TcpConnection {
        pub fn new(stream: TcpStream) -> Self {
            let peer_desc = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            Self {
                stream,
                state: ConnectionState::Open,
                peer_desc,
            }
        }
    }

    #[async_trait]
    impl Connection for TcpConnection {
        async fn send(&mut self, msg: &NetworkMessage) -> NetworkResult<()> {
            write_frame(&mut self.stream, &msg.encode()).await
        }

        async fn recv(&mut self) -> NetworkResult<NetworkMessage> {
            let bytes = read_frame(&mut self.stream).await?;
            NetworkMessage::decode(&bytes)
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        async fn close(&mut self) {
            self.state = ConnectionState::Closed;
        }

        fn peer_description(&self) -> String {
            self.peer_desc.clone()
        }
    }

    pub struct TcpServer {
        listener: TcpListener,
        local_desc: String,
    }

    impl TcpServer {
        pub async fn bind(addr: &str) -> NetworkResult<Self> {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
            let local_desc = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| addr.to_string());
            Ok(Self {
                listener,
                local_desc,
            })
        }
    }

    #[async_trait]
    impl Server for TcpServer {
        async fn accept(&mut self) -> NetworkResult<Box<dyn Connection>> {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
            Ok(Box::new(TcpConnection::new(stream)))
        }

        fn local_description(&self) -> String {
            self.local_desc.clone()
        }
    }
}

pub mod websocket {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    pub struct WsConnection {
        inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
        state: ConnectionState,
        peer_desc: String,
    }

    impl WsConnection {
        pub fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>, peer_desc: String) -> Self {
            Self {
                inner,
                state: ConnectionState::Open,
                peer_desc,
            }
        }

        pub async fn connect(url: &str) -> NetworkResult<Self> {
            let (inner, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
            Ok(Self::new(inner, url.to_string()))
        }
    }

    #[async_trait]
    impl Connection for WsConnection {
        async fn send(&mut self, msg: &NetworkMessage) -> NetworkResult<()> {
            self.inner
                .send(WsMessage::Binary(msg.encode()))
                .await
                .map_err(|e| NetworkError::Transport(None, e.to_string()))
        }

        async fn recv(&mut self) -> NetworkResult<NetworkMessage> {
            loop {
                match self.inner.next().await {
                    Some(Ok(WsMessage::Binary(bytes))) => return NetworkMessage::decode(&bytes),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Err(NetworkError::Transport(
                            None,
                            "connection closed".to_string(),
                        ));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(NetworkError::Transport(None, e.to_string())),
                }
            }
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        async fn close(&mut self) {
            let _ = self.inner.close(None).await;
            self.state = ConnectionState::Closed;
        }

        fn peer_description(&self) -> String {
            self.peer_desc.clone()
        }
    }

    pub struct WsServer {
        listener: TcpListener,
        local_desc: String,
    }

    impl WsServer {
        pub async fn bind(addr: &str) -> NetworkResult<Self> {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
            let local_desc = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| addr.to_string());
            Ok(Self {
                listener,
                local_desc,
            })
        }
    }

    #[async_trait]
    impl Server for WsServer {
        async fn accept(&mut self) -> NetworkResult<Box<dyn Connection>> {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
            let ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
                .await
                .map_err(|e| NetworkError::Transport(None, e.to_string()))?;
            Ok(Box::new(WsConnection::new(ws, peer_addr.to_string())))
        }

        fn local_description(&self) -> String {
            self.local_desc.clone()
        }
    }
}

/// In-memory transport for tests: a pair of connections backed by unbounded
/// mpsc channels, with no actual I/O.
pub mod local {
    use super::*;
    use tokio::sync::mpsc;

    pub struct LocalConnection {
        tx: mpsc::UnboundedSender<NetworkMessage>,
        rx: mpsc::UnboundedReceiver<NetworkMessage>,
        state: ConnectionState,
        desc: String,
    }

    impl fmt::Debug for LocalConnection {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("LocalConnection")
                .field("desc", &self.desc)
                .finish()
        }
    }

    /// Create a connected pair, as if two peers dialed each other directly.
    pub fn pair(desc_a: &str, desc_b: &str) -> (LocalConnection, LocalConnection) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (
            LocalConnection {
                tx: tx_a,
                rx: rx_a,
                state: ConnectionState::Open,
                desc: desc_a.to_string(),
            },
            LocalConnection {
                tx: tx_b,
                rx: rx_b,
                state: ConnectionState::Open,
                desc: desc_b.to_string(),
            },
        )
    }

    #[async_trait]
    impl Connection for LocalConnection {
        async fn send(&mut self, msg: &NetworkMessage) -> NetworkResult<()> {
            self.tx
                .send(msg.clone())
                .map_err(|_| NetworkError::Transport(None, "peer gone".to_string()))
        }

        async fn recv(&mut self) -> NetworkResult<NetworkMessage> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| NetworkError::Transport(None, "peer gone".to_string()))
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        async fn close(&mut self) {
            self.state = ConnectionState::Closed;
        }

        fn peer_description(&self) -> String {
            self.desc.clone()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::net::message::NetworkMessage as M;

        #[tokio::test]
        async fn local_pair_delivers_messages_both_ways() {
            let (mut a, mut b) = pair("a", "b");
            a.send(&M::PeerRequest).await.unwrap();
            let got = b.recv().await.unwrap();
            assert_eq!(got, M::PeerRequest);
        }
    }
}
