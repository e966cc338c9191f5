// Copyright 2020 Joyent, Inc.

//! Message bodies exchanged between client and server.
//!
//! Control messages carry callback ID 0 and a non-zero sequence number:
//!
//! * Init           `int64 1, string session`
//! * InitBack       `int64 2, string session, int64 readTimeoutMS,
//!                   int64 writeTimeoutMS, int64 readLimit,
//!                   int64 callbackPoolSize`
//! * RequestIds     `int64 3, uint64 currCallbackID, uint64 id...`
//! * RequestIdsBack `int64 4, uint64 maxCallbackID`
//!
//! Data messages carry the callback ID of the call they belong to:
//!
//! * request  `string target, uint64 depth, string origin, value...`
//! * response `uint64 errorKind` followed by one value when the kind is
//!   `None`, or by `string message, string debug` otherwise.
//!
//! Callback ID 0 with sequence 0 is reserved for server broadcasts.

use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};

use crate::error::{ErrorKind, RpcError};
use crate::stream::Stream;
use crate::value::{Int64, Uint64, Value};

/// Shortest session string a server may hand out, in characters.
pub const MIN_SESSION_LEN: usize = 34;

/// Origin marker for calls issued directly by a client.
pub const CLIENT_ORIGIN: &str = "@";

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ControlKind {
    Init = 1,
    InitBack = 2,
    RequestIds = 3,
    RequestIdsBack = 4,
}

/// The parameters a server grants on a successful handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitBack {
    pub session: String,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_limit: u64,
    pub callback_pool_size: u64,
}

/// A control message arriving on an established session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    RequestIdsBack { max_callback_id: u64 },
}

/// A decoded request, as a server sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub target: String,
    pub depth: u64,
    pub origin: String,
    pub args: Vec<Value>,
}

fn control_stream(sequence: u64, kind: ControlKind) -> Stream {
    let mut stream = Stream::new();
    stream.set_callback_id(0);
    stream.set_sequence(sequence);
    // Discriminants are small positive integers.
    let kind = ToPrimitive::to_i64(&kind).unwrap_or(0);
    stream.write_int64(Int64::new(kind));
    stream
}

fn read_kind(stream: &mut Stream) -> Option<ControlKind> {
    stream
        .read_int64()
        .and_then(|kind| kind.to_i64())
        .and_then(FromPrimitive::from_i64)
}

fn read_positive(stream: &mut Stream) -> Option<u64> {
    match stream.read_int64().and_then(|v| v.to_i64()) {
        Some(v) if v > 0 => Some(v as u64),
        _ => None,
    }
}

fn positive_i64(v: u64) -> Int64 {
    Int64::new(v.min(i64::max_value() as u64) as i64)
}

pub fn init_message(sequence: u64, session: &str) -> Result<Stream, RpcError> {
    let mut stream = control_stream(sequence, ControlKind::Init);
    stream.write_string(session)?;
    Ok(stream)
}

/// Read the session string out of an Init message.
pub fn parse_init(stream: &mut Stream) -> Option<String> {
    if stream.callback_id() != 0 || read_kind(stream)? != ControlKind::Init {
        return None;
    }
    let session = stream.read_string()?;
    if stream.can_read() {
        None
    } else {
        Some(session)
    }
}

pub fn init_back_message(
    sequence: u64,
    init: &InitBack,
) -> Result<Stream, RpcError> {
    let mut stream = control_stream(sequence, ControlKind::InitBack);
    stream.write_string(&init.session)?;
    stream.write_int64(positive_i64(init.read_timeout_ms));
    stream.write_int64(positive_i64(init.write_timeout_ms));
    stream.write_int64(positive_i64(init.read_limit));
    stream.write_int64(positive_i64(init.callback_pool_size));
    Ok(stream)
}

/// Validate the server's answer to the Init sent with `sequence`.
pub fn parse_init_back(
    stream: &mut Stream,
    sequence: u64,
) -> Result<InitBack, RpcError> {
    let bad = |what: &str| {
        RpcError::protocol("stream is broken").add_debug(format!(
            "invalid InitBack: {}",
            what
        ))
    };

    if stream.callback_id() != 0 {
        return Err(bad("callback id is not zero"));
    }
    if stream.sequence() != sequence {
        return Err(bad("sequence does not match Init"));
    }
    if read_kind(stream) != Some(ControlKind::InitBack) {
        return Err(bad("wrong control kind"));
    }
    let session = match stream.read_string() {
        Some(s) if s.chars().count() >= MIN_SESSION_LEN => s,
        _ => return Err(bad("session string")),
    };
    let read_timeout_ms =
        read_positive(stream).ok_or_else(|| bad("read timeout"))?;
    let write_timeout_ms =
        read_positive(stream).ok_or_else(|| bad("write timeout"))?;
    let read_limit = read_positive(stream).ok_or_else(|| bad("read limit"))?;
    let callback_pool_size =
        read_positive(stream).ok_or_else(|| bad("callback pool size"))?;
    if stream.can_read() {
        return Err(bad("trailing bytes"));
    }

    Ok(InitBack {
        session,
        read_timeout_ms,
        write_timeout_ms,
        read_limit,
        callback_pool_size,
    })
}

pub fn request_ids_message<I>(
    sequence: u64,
    curr_callback_id: u64,
    in_flight: I,
) -> Stream
where
    I: IntoIterator<Item = u64>,
{
    let mut stream = control_stream(sequence, ControlKind::RequestIds);
    stream.write_uint64(Uint64::new(curr_callback_id));
    for id in in_flight {
        stream.write_uint64(Uint64::new(id));
    }
    stream
}

/// Read a RequestIds message: the client's current callback ID and the
/// IDs it still waits on.
pub fn parse_request_ids(stream: &mut Stream) -> Option<(u64, Vec<u64>)> {
    if read_kind(stream)? != ControlKind::RequestIds {
        return None;
    }
    let curr = stream.read_uint64()?.to_u64()?;
    let mut ids = Vec::new();
    while stream.can_read() {
        ids.push(stream.read_uint64()?.to_u64()?);
    }
    Some((curr, ids))
}

pub fn request_ids_back_message(sequence: u64, max_callback_id: u64) -> Stream {
    let mut stream = control_stream(sequence, ControlKind::RequestIdsBack);
    stream.write_uint64(Uint64::new(max_callback_id));
    stream
}

/// Decode a control message received on an established session.
pub fn parse_control(stream: &mut Stream) -> Result<Control, RpcError> {
    match read_kind(stream) {
        Some(ControlKind::RequestIdsBack) => {
            let max_callback_id = stream
                .read_uint64()
                .and_then(|v| v.to_u64())
                .filter(|_| !stream.can_read())
                .ok_or_else(|| {
                    RpcError::protocol("stream is broken")
                        .add_debug("invalid RequestIdsBack")
                })?;
            Ok(Control::RequestIdsBack { max_callback_id })
        }
        Some(kind) => Err(RpcError::protocol("unexpected control message")
            .add_debug(format!("{:?}", kind))),
        None => Err(RpcError::protocol("stream is broken")
            .add_debug("unknown control kind")),
    }
}

pub fn request_message(
    target: &str,
    args: &[Value],
) -> Result<Stream, RpcError> {
    let mut stream = Stream::new();
    stream.write_string(target)?;
    stream.write_uint64(Uint64::new(0));
    stream.write_string(CLIENT_ORIGIN)?;
    for (i, arg) in args.iter().enumerate() {
        stream
            .write_value(arg)
            .map_err(|e| e.add_debug(format!("argument {} of {}", i, target)))?;
    }
    Ok(stream)
}

pub fn parse_request(stream: &mut Stream) -> Option<Request> {
    let target = stream.read_string()?;
    let depth = stream.read_uint64()?.to_u64()?;
    let origin = stream.read_string()?;
    let mut args = Vec::new();
    while stream.can_read() {
        args.push(stream.read_value()?);
    }
    Some(Request {
        target,
        depth,
        origin,
        args,
    })
}

/// Build the response to the call identified by `callback_id`.
pub fn response_message(
    callback_id: u32,
    result: &Result<Value, RpcError>,
) -> Result<Stream, RpcError> {
    let mut stream = Stream::new();
    stream.set_callback_id(callback_id);
    match result {
        Ok(value) => {
            stream.write_uint64(Uint64::new(ErrorKind::None.to_wire()));
            stream.write_value(value)?;
        }
        Err(err) => {
            stream.write_uint64(Uint64::new(err.kind().to_wire()));
            stream.write_string(err.message())?;
            stream.write_string(err.debug())?;
        }
    }
    Ok(stream)
}

/// Decode a response body. A malformed body becomes a protocol error.
pub fn parse_response(stream: &mut Stream) -> Result<Value, RpcError> {
    let broken = || {
        RpcError::protocol("stream is broken").add_debug("invalid response")
    };

    let kind = stream
        .read_uint64()
        .and_then(|v| v.to_u64())
        .and_then(ErrorKind::from_wire)
        .ok_or_else(broken)?;

    let result = match kind {
        ErrorKind::None => stream.read_value().map(Ok),
        kind => stream.read_string().and_then(|message| {
            stream
                .read_string()
                .map(|debug| Err(RpcError::new(kind, message, debug)))
        }),
    };

    match result {
        Some(result) if !stream.can_read() => result,
        _ => Err(broken()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> String {
        "s".repeat(MIN_SESSION_LEN)
    }

    fn grant() -> InitBack {
        InitBack {
            session: session(),
            read_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            read_limit: 1 << 20,
            callback_pool_size: 32,
        }
    }

    fn reread(stream: &Stream) -> Stream {
        Stream::from_bytes(stream.as_bytes()).expect("valid stream")
    }

    #[test]
    fn init_round_trip() {
        let sent = init_message(7, "").expect("init");
        let mut recv = reread(&sent);
        assert_eq!(recv.callback_id(), 0);
        assert_eq!(recv.sequence(), 7);
        assert_eq!(parse_init(&mut recv), Some(String::new()));
    }

    #[test]
    fn init_back_accepts_valid() {
        let sent = init_back_message(3, &grant()).expect("init back");
        assert_eq!(parse_init_back(&mut reread(&sent), 3), Ok(grant()));
    }

    #[test]
    fn init_back_rejects_invalid() {
        let sent = init_back_message(3, &grant()).expect("init back");
        // wrong sequence
        assert!(parse_init_back(&mut reread(&sent), 4).is_err());

        // non-zero callback id
        let mut stream = reread(&sent);
        stream.set_callback_id(1);
        assert!(parse_init_back(&mut stream, 3).is_err());

        // session string too short
        let mut short = grant();
        short.session = "s".repeat(MIN_SESSION_LEN - 1);
        let sent_short = init_back_message(3, &short).expect("init back");
        assert!(parse_init_back(&mut reread(&sent_short), 3).is_err());

        // length counts characters, not UTF-8 bytes
        let mut wide = grant();
        wide.session = "é".repeat(MIN_SESSION_LEN - 1);
        assert!(wide.session.len() >= MIN_SESSION_LEN);
        let sent_wide = init_back_message(3, &wide).expect("init back");
        assert!(parse_init_back(&mut reread(&sent_wide), 3).is_err());
        wide.session.push('é');
        let sent_wide = init_back_message(3, &wide).expect("init back");
        let parsed = parse_init_back(&mut reread(&sent_wide), 3).expect("ok");
        assert_eq!(parsed.session, wide.session);

        // trailing bytes
        let mut trailing = reread(&sent);
        trailing.write_null();
        let err = parse_init_back(&mut trailing, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.debug().contains("trailing"));

        // non-positive pool size
        let mut stream = control_stream(3, ControlKind::InitBack);
        stream.write_string(&session()).expect("write");
        for v in &[1i64, 1, 1, 0] {
            stream.write_int64(Int64::new(*v));
        }
        assert!(parse_init_back(&mut reread(&stream), 3).is_err());

        // wrong kind
        let sent = init_message(3, &session()).expect("init");
        assert!(parse_init_back(&mut reread(&sent), 3).is_err());
    }

    #[test]
    fn request_ids_round_trip() {
        let sent = request_ids_message(9, 12, vec![10, 11, 12]);
        let mut recv = reread(&sent);
        assert_eq!(recv.sequence(), 9);
        assert_eq!(parse_request_ids(&mut recv), Some((12, vec![10, 11, 12])));

        let sent = request_ids_back_message(10, 44);
        assert_eq!(
            parse_control(&mut reread(&sent)),
            Ok(Control::RequestIdsBack { max_callback_id: 44 })
        );
    }

    #[test]
    fn control_rejects_unexpected() {
        let sent = request_ids_message(9, 12, vec![]);
        let err = parse_control(&mut reread(&sent)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let mut sent = request_ids_back_message(10, 44);
        sent.write_null();
        assert!(parse_control(&mut reread(&sent)).is_err());

        let mut stream = Stream::new();
        stream.write_int64(Int64::new(99));
        assert!(parse_control(&mut stream).is_err());
    }

    #[test]
    fn request_layout() {
        let args = vec![Value::from("world"), Value::from(3u64)];
        let sent = request_message("user.sayHello", &args).expect("request");
        let mut recv = reread(&sent);
        assert_eq!(recv.read_string(), Some("user.sayHello".to_string()));
        assert_eq!(recv.read_uint64(), Some(Uint64::new(0)));
        assert_eq!(recv.read_string(), Some("@".to_string()));

        let request = parse_request(&mut reread(&sent)).expect("request");
        assert_eq!(request.target, "user.sayHello");
        assert_eq!(request.depth, 0);
        assert_eq!(request.origin, CLIENT_ORIGIN);
        assert_eq!(request.args, args);

        let bad = vec![Value::Float64(std::f64::NAN)];
        let err = request_message("t", &bad).unwrap_err();
        assert!(err.debug().contains("argument 0"));
    }

    #[test]
    fn response_round_trip() {
        let ok = response_message(5, &Ok(Value::from("hi"))).expect("ok");
        let mut recv = reread(&ok);
        assert_eq!(recv.callback_id(), 5);
        assert_eq!(parse_response(&mut recv), Ok(Value::from("hi")));

        let failure = RpcError::new(ErrorKind::ReplyPanic, "boom", "trace");
        let sent = response_message(6, &Err(failure.clone())).expect("err");
        assert_eq!(parse_response(&mut reread(&sent)), Err(failure));
    }

    #[test]
    fn response_rejects_malformed() {
        // unknown error kind
        let mut stream = Stream::new();
        stream.write_uint64(Uint64::new(8));
        stream.write_string("m").expect("write");
        stream.write_string("d").expect("write");
        let err = parse_response(&mut stream).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        // missing debug string
        let mut stream = Stream::new();
        stream.write_uint64(Uint64::new(3));
        stream.write_string("m").expect("write");
        assert_eq!(
            parse_response(&mut stream).unwrap_err().kind(),
            ErrorKind::Protocol
        );

        // trailing value
        let mut stream = Stream::new();
        stream.write_uint64(Uint64::new(0));
        stream.write_null();
        stream.write_null();
        assert_eq!(
            parse_response(&mut stream).unwrap_err().kind(),
            ErrorKind::Protocol
        );

        // empty body
        assert!(parse_response(&mut Stream::new()).is_err());
    }
}
