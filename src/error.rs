// Copyright 2020 Joyent, Inc.

//! The error model shared by the stream codec and the session engine.

use std::error::Error as StdError;
use std::fmt;

use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};

/// The closed set of error kinds. The discriminants are the values carried
/// in the `errorKind` field of a response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u64)]
pub enum ErrorKind {
    None = 0,
    Protocol = 1,
    Transport = 2,
    Reply = 3,
    ReplyPanic = 4,
    RuntimePanic = 5,
    KernelPanic = 6,
    SecurityLimit = 7,
}

impl ErrorKind {
    pub fn from_wire(kind: u64) -> Option<ErrorKind> {
        FromPrimitive::from_u64(kind)
    }

    pub fn to_wire(self) -> u64 {
        // Every variant has a small non-negative discriminant.
        ToPrimitive::to_u64(&self).unwrap_or(0)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::None => "none",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Transport => "transport",
            ErrorKind::Reply => "reply",
            ErrorKind::ReplyPanic => "reply panic",
            ErrorKind::RuntimePanic => "runtime panic",
            ErrorKind::KernelPanic => "kernel panic",
            ErrorKind::SecurityLimit => "security limit",
        };
        f.write_str(name)
    }
}

/// An error with a kind, a message and an accumulated debug trail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
    debug: String,
}

impl RpcError {
    pub fn new<M, D>(kind: ErrorKind, message: M, debug: D) -> RpcError
    where
        M: Into<String>,
        D: Into<String>,
    {
        RpcError {
            kind,
            message: message.into(),
            debug: debug.into(),
        }
    }

    pub fn protocol<M: Into<String>>(message: M) -> RpcError {
        RpcError::new(ErrorKind::Protocol, message, "")
    }

    pub fn transport<M: Into<String>>(message: M) -> RpcError {
        RpcError::new(ErrorKind::Transport, message, "")
    }

    pub fn reply<M: Into<String>>(message: M) -> RpcError {
        RpcError::new(ErrorKind::Reply, message, "")
    }

    pub fn reply_panic<M: Into<String>>(message: M) -> RpcError {
        RpcError::new(ErrorKind::ReplyPanic, message, "")
    }

    pub fn runtime_panic<M: Into<String>>(message: M) -> RpcError {
        RpcError::new(ErrorKind::RuntimePanic, message, "")
    }

    pub fn kernel_panic<M: Into<String>>(message: M) -> RpcError {
        RpcError::new(ErrorKind::KernelPanic, message, "")
    }

    pub fn security_limit<M: Into<String>>(message: M) -> RpcError {
        RpcError::new(ErrorKind::SecurityLimit, message, "")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn debug(&self) -> &str {
        &self.debug
    }

    /// Append a line to the debug trail. Empty annotations are ignored.
    pub fn add_debug<D: AsRef<str>>(mut self, debug: D) -> RpcError {
        let debug = debug.as_ref();
        if !debug.is_empty() {
            if !self.debug.is_empty() {
                self.debug.push('\n');
            }
            self.debug.push_str(debug);
        }
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        if !self.debug.is_empty() {
            write!(f, "\n{}", self.debug)?;
        }
        Ok(())
    }
}

impl StdError for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> RpcError {
        RpcError::transport(err.to_string())
    }
}
