//! Socket driver
//!
//! Tasks spawned here only move bytes. Every accepted or dialled socket
//! gets one session task that frames inbound traffic with [`FrameCodec`]
//! and writes whatever the block queues on the connection's sender. All
//! results come back to the block as [`NetEvent`]s on one channel, so the
//! block stays the only place where state changes.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use observa_protocol::{Frame, FrameCodec};
use observa_utils::{ObservaError, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use crate::connection::ConnId;

/// Something happened on the network
#[derive(Debug)]
pub enum NetEvent {
    /// A peer connected to our listening socket
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// An outbound dial finished
    Connected { conn: ConnId, stream: TcpStream },
    ConnectFailed { conn: ConnId, error: String },
    Frame { conn: ConnId, frame: Frame },
    /// The session ended; `error` is set when it did not end by EOF
    Closed { conn: ConnId, error: Option<String> },
}

/// Channel between the socket tasks and the block
#[derive(Debug)]
pub struct NetLink {
    tx: mpsc::UnboundedSender<NetEvent>,
    rx: mpsc::UnboundedReceiver<NetEvent>,
}

impl Default for NetLink {
    fn default() -> Self {
        Self::new()
    }
}

impl NetLink {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<NetEvent> {
        self.tx.clone()
    }

    /// Wait for the next event. Never yields `None` while the link lives,
    /// as it keeps a sender itself.
    pub async fn recv(&mut self) -> Option<NetEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NetEvent> {
        self.rx.try_recv().ok()
    }

    /// Run the accept loop on `listener` until the block goes away.
    pub fn spawn_listener(&self, listener: TcpListener) {
        let tx = self.sender();
        tokio::spawn(run_accept_loop(listener, tx));
    }

    /// Dial `addr` (`host:port`) for connection `conn`.
    pub fn dial(&self, conn: ConnId, addr: String, timeout: Duration) {
        let tx = self.sender();
        tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    debug!(%conn, %addr, "connected");
                    NetEvent::Connected { conn, stream }
                }
                Ok(Err(e)) => NetEvent::ConnectFailed {
                    conn,
                    error: format!("{}: {}", addr, e),
                },
                Err(_) => NetEvent::ConnectFailed {
                    conn,
                    error: format!("{}: connect timed out after {:?}", addr, timeout),
                },
            };
            let _ = tx.send(event);
        });
    }

    /// Start the session task for an open socket. Returns the sender the
    /// connection writes through; dropping it closes the socket.
    pub fn spawn_session(&self, conn: ConnId, stream: TcpStream) -> mpsc::UnboundedSender<Frame> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let framed = Framed::new(stream, FrameCodec::new());
        tokio::spawn(session_task(conn, framed, out_rx, self.sender()));
        out_tx
    }
}

/// Bind the listening socket on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| ObservaError::connection(format!("cannot listen on {}: {}", addr, e)))
}

async fn run_accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<NetEvent>) {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("new connection from {}", peer);
                if tx.send(NetEvent::Accepted { stream, peer }).is_err() {
                    debug!("block gone, stopping accept loop");
                    break;
                }
            }
            Err(e) => {
                error!("accept error: {}", e);
            }
        }
    }
}

async fn session_task(
    conn: ConnId,
    mut framed: Framed<TcpStream, FrameCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let error = loop {
        tokio::select! {
            out = outgoing.recv() => {
                match out {
                    Some(frame) => {
                        if let Err(e) = framed.send(frame).await {
                            break Some(e.to_string());
                        }
                    }
                    // the connection dropped its sender
                    None => {
                        debug!(%conn, "session closed locally");
                        return;
                    }
                }
            }

            result = framed.next() => {
                match result {
                    Some(Ok(frame)) => {
                        if events.send(NetEvent::Frame { conn, frame }).is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            }
        }
    };
    match &error {
        Some(e) => debug!(%conn, "session failed: {}", e),
        None => debug!(%conn, "peer closed connection"),
    }
    let _ = events.send(NetEvent::Closed { conn, error });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_accept_and_exchange_lines() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = NetLink::new();
        link.spawn_listener(listener);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let stream = match link.recv().await.unwrap() {
            NetEvent::Accepted { stream, .. } => stream,
            other => panic!("unexpected {:?}", other),
        };
        let conn = ConnId::new(3);
        let tx = link.spawn_session(conn, stream);

        client.write_all(b"T ready\n").await.unwrap();
        match link.recv().await.unwrap() {
            NetEvent::Frame { conn: c, frame } => {
                assert_eq!(c, conn);
                assert_eq!(frame, Frame::line("T ready"));
            }
            other => panic!("unexpected {:?}", other),
        }

        tx.send(Frame::line("T OK")).unwrap();
        let mut reader = BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "T OK\n");

        drop(reader);
        drop(client);
        match link.recv().await.unwrap() {
            NetEvent::Closed { conn: c, .. } => assert_eq!(c, conn),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut link = NetLink::new();
        link.dial(ConnId::new(1), format!("127.0.0.1:{}", port), Duration::from_secs(5));
        match link.recv().await.unwrap() {
            NetEvent::ConnectFailed { conn, .. } => assert_eq!(conn, ConnId::new(1)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
