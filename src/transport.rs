// Copyright 2020 Joyent, Inc.

//! The boundary between the session engine and a concrete connection.
//!
//! An adapter opens connections on request and reports what happens to
//! them as [`AdapterEvent`]s on a channel the engine drains from its own
//! loop. Every call to [`ClientAdapter::open`] ends with exactly one
//! [`AdapterEvent::Closed`], whether or not the connection ever opened.
//!
//! [`TcpAdapter`] carries streams over TCP, each one framed by
//! [`StreamCodec`] as a 4-byte big-endian length followed by the stream
//! buffer.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use slog::{debug, o, Drain, Logger};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::RpcError;
use crate::stream::Stream;

const FRAME_LEN_SZ: usize = 4;

pub enum AdapterEvent {
    Opened(Box<dyn StreamConn>),
    Received(Stream),
    Closed,
    Error(RpcError),
}

pub type EventSender = mpsc::UnboundedSender<AdapterEvent>;

/// One live connection.
pub trait StreamConn: Send {
    fn send_stream(&mut self, stream: &Stream) -> Result<(), RpcError>;

    /// Begin closing. Completion is reported by the adapter's `Closed`
    /// event.
    fn close(&mut self) -> Result<(), RpcError>;
}

/// A source of connections to one server.
pub trait ClientAdapter: Send {
    fn open(&mut self, events: EventSender);

    /// Abort the connection most recently opened, if it is still alive.
    fn close(&mut self);
}

pub struct StreamCodec {
    max_frame_len: usize,
}

impl StreamCodec {
    pub fn new(max_frame_len: usize) -> StreamCodec {
        StreamCodec { max_frame_len }
    }

    fn check_len(&self, len: usize) -> Result<(), RpcError> {
        if len > self.max_frame_len {
            Err(RpcError::security_limit("frame is too large")
                .add_debug(format!("{} bytes", len)))
        } else {
            Ok(())
        }
    }
}

impl Decoder for StreamCodec {
    type Item = Stream;
    type Error = RpcError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Stream>, RpcError> {
        if buf.len() < FRAME_LEN_SZ {
            return Ok(None);
        }
        let frame_len = BigEndian::read_u32(&buf[..FRAME_LEN_SZ]) as usize;
        self.check_len(frame_len)?;

        if buf.len() < FRAME_LEN_SZ + frame_len {
            buf.reserve(FRAME_LEN_SZ + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_LEN_SZ);
        let frame = buf.split_to(frame_len);
        Stream::from_buf(frame).map(Some).ok_or_else(|| {
            RpcError::protocol("stream is broken")
                .add_debug("frame does not start with a valid header")
        })
    }
}

impl Encoder<Stream> for StreamCodec {
    type Error = RpcError;

    fn encode(
        &mut self,
        item: Stream,
        buf: &mut BytesMut,
    ) -> Result<(), RpcError> {
        let data = item.as_bytes();
        self.check_len(data.len())?;
        buf.reserve(FRAME_LEN_SZ + data.len());
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
        Ok(())
    }
}

enum Outbound {
    Stream(Stream),
    Close,
}

struct TcpConn {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl StreamConn for TcpConn {
    fn send_stream(&mut self, stream: &Stream) -> Result<(), RpcError> {
        self.tx
            .send(Outbound::Stream(stream.clone()))
            .map_err(|_| RpcError::transport("connection is closed"))
    }

    fn close(&mut self) -> Result<(), RpcError> {
        self.tx
            .send(Outbound::Close)
            .map_err(|_| RpcError::transport("connection is closed"))
    }
}

/// Connects to `addr` over TCP. Must be used from within a tokio runtime.
pub struct TcpAdapter {
    addr: String,
    max_frame_len: usize,
    shutdown: Option<oneshot::Sender<()>>,
    log: Logger,
}

impl TcpAdapter {
    pub fn new<S: Into<String>>(
        addr: S,
        max_frame_len: usize,
        log: Option<&Logger>,
    ) -> TcpAdapter {
        let addr = addr.into();
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("addr" => addr.clone()));
        TcpAdapter {
            addr,
            max_frame_len,
            shutdown: None,
            log,
        }
    }
}

impl ClientAdapter for TcpAdapter {
    fn open(&mut self, events: EventSender) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);
        let addr = self.addr.clone();
        let codec = StreamCodec::new(self.max_frame_len);
        let log = self.log.clone();
        tokio::spawn(async move {
            debug!(log, "connecting");
            if let Err(err) =
                serve_connection(&addr, codec, &events, shutdown_rx).await
            {
                debug!(log, "connection failed"; "error" => %err);
                let _ = events.send(AdapterEvent::Error(err));
            }
            debug!(log, "connection closed");
            let _ = events.send(AdapterEvent::Closed);
        });
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn serve_connection(
    addr: &str,
    codec: StreamCodec,
    events: &EventSender,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), RpcError> {
    let socket = tokio::select! {
        socket = TcpStream::connect(addr) => socket?,
        _ = &mut shutdown => return Ok(()),
    };
    socket.set_nodelay(true)?;

    let (mut sink, mut source) = Framed::new(socket, codec).split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    if events
        .send(AdapterEvent::Opened(Box::new(TcpConn { tx })))
        .is_err()
    {
        return Ok(());
    }

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(stream)) => {
                    if events.send(AdapterEvent::Received(stream)).is_err() {
                        return Ok(());
                    }
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            },
            outbound = rx.recv() => match outbound {
                Some(Outbound::Stream(stream)) => sink.send(stream).await?,
                Some(Outbound::Close) | None => {
                    sink.close().await?;
                    return Ok(());
                }
            },
            _ = &mut shutdown => return Ok(()),
        }
    }
}
