// Copyright 2020 Joyent, Inc.

//! stream-rpc: a client for a binary, session-oriented RPC protocol
//!
//! Every message is one *stream*: a self-describing buffer made of a fixed
//! header followed by a body of tagged values.
//!
//! Header layout
//!
//! * VERSION       1-byte integer. The only supported value is "1".
//!
//! * CALLBACK_ID   4-byte little-endian unsigned integer. Correlates a
//!                 response with its request. 0 marks a control message.
//!
//! * SEQUENCE      8-byte little-endian unsigned integer identifying a
//!                 control message. A control message with sequence 0 is a
//!                 server broadcast.
//!
//! * RESERVED      4 bytes, zero.
//!
//! Body values start with a one-byte tag. Small integers, short strings,
//! short blobs and small containers are packed into the tag itself; larger
//! ones are followed by a little-endian length or payload of 1, 2, 4 or 8
//! bytes. See [`stream`] for the full table.
//!
//! Sessions
//!
//! A client opens a connection, sends Init carrying the session string it
//! was last granted (empty the first time) and waits for InitBack, which
//! grants a session string, the server's timeouts and a callback pool
//! size. The server bounds how many calls may be outstanding through an
//! admission window: the client numbers calls sequentially and never
//! assigns a callback ID above the window's upper bound. The client asks
//! for more room with RequestIds, which also lists the calls it still
//! waits on, and the server answers with RequestIdsBack.
//!
//! Calls survive a dropped connection. Queued calls are admitted once the
//! next handshake succeeds, and admitted calls complete when their
//! response arrives on any later connection or when their deadline
//! passes.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod json;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;
pub mod value;

pub use client::{Call, Client};
pub use config::ClientConfig;
pub use error::{ErrorKind, RpcError};
pub use stream::Stream;
pub use value::{Int64, Uint64, Value};
