// Copyright 2020 Joyent, Inc.

//! An in-process transport.
//!
//! [`memory_pair`] returns an adapter for a client and a listener that
//! hands out one [`MemoryPeer`] per connection the client opens. The peer
//! plays the server: it reads what the client sent and injects streams
//! back. Everything happens synchronously on the caller's thread, which
//! makes engine behavior fully deterministic under test.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::RpcError;
use crate::stream::{Stream, HEADER_SIZE};
use crate::transport::{AdapterEvent, ClientAdapter, EventSender, StreamConn};

struct Link {
    closed: AtomicBool,
    events: EventSender,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // Only the first close reports.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(AdapterEvent::Closed);
        }
    }
}

pub fn memory_pair() -> (MemoryAdapter, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryAdapter {
            peers: tx,
            current: None,
        },
        MemoryListener { peers: rx },
    )
}

pub struct MemoryAdapter {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    current: Option<Arc<Link>>,
}

impl ClientAdapter for MemoryAdapter {
    fn open(&mut self, events: EventSender) {
        let link = Arc::new(Link {
            closed: AtomicBool::new(false),
            events: events.clone(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            link: link.clone(),
            from_client: rx,
        };
        if self.peers.send(peer).is_err() {
            let _ = events.send(AdapterEvent::Error(RpcError::transport(
                "connection refused",
            )));
            link.close();
            return;
        }
        self.current = Some(link.clone());
        let _ = events.send(AdapterEvent::Opened(Box::new(MemoryConn {
            link,
            to_peer: tx,
        })));
    }

    fn close(&mut self) {
        if let Some(link) = self.current.take() {
            link.close();
        }
    }
}

struct MemoryConn {
    link: Arc<Link>,
    to_peer: mpsc::UnboundedSender<Stream>,
}

impl StreamConn for MemoryConn {
    fn send_stream(&mut self, stream: &Stream) -> Result<(), RpcError> {
        if self.link.is_closed() {
            return Err(RpcError::transport("connection is closed"));
        }
        self.to_peer
            .send(stream.clone())
            .map_err(|_| RpcError::transport("connection is closed"))
    }

    fn close(&mut self) -> Result<(), RpcError> {
        self.link.close();
        Ok(())
    }
}

/// Accepts the connections a [`MemoryAdapter`] opens. Dropping the
/// listener makes further opens fail.
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

/// The server end of one in-memory connection.
pub struct MemoryPeer {
    link: Arc<Link>,
    from_client: mpsc::UnboundedReceiver<Stream>,
}

impl MemoryPeer {
    /// Next stream sent by the client. Returns `None` once the client has
    /// dropped its end and everything it sent has been read.
    pub async fn recv(&mut self) -> Option<Stream> {
        self.from_client.recv().await.map(rewind)
    }

    pub fn try_recv(&mut self) -> Option<Stream> {
        self.from_client.try_recv().ok().map(rewind)
    }

    pub fn send(&self, stream: &Stream) -> Result<(), RpcError> {
        if self.link.is_closed() {
            return Err(RpcError::transport("connection is closed"));
        }
        let copy = Stream::from_bytes(stream.as_bytes())
            .ok_or_else(|| RpcError::protocol("stream is broken"))?;
        self.link
            .events
            .send(AdapterEvent::Received(copy))
            .map_err(|_| RpcError::transport("connection is closed"))
    }

    /// Drop the connection as a server or network failure would.
    pub fn close(&self) {
        self.link.close();
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

// Hand the peer a stream positioned at the start of the body, as if it
// had just come off the wire.
fn rewind(stream: Stream) -> Stream {
    let mut stream = stream;
    stream.set_read_pos(HEADER_SIZE);
    stream
}
