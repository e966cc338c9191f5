// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::block_on;
use tokio_util::codec::Framed;

use stream_rpc::protocol::{self, InitBack};
use stream_rpc::transport::{StreamCodec, TcpAdapter};
use stream_rpc::{Client, ClientConfig, ErrorKind, RpcError, Stream, Value};

const SESSION: &str = "tcp-test-session-0123456789abcdefghijkl";
const POOL_SIZE: u64 = 16;

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn handle_request(mut msg: Stream, log: &Logger) -> Result<Stream, RpcError> {
    let request = protocol::parse_request(&mut msg)
        .ok_or_else(|| RpcError::protocol("stream is broken"))?;
    debug!(log, "handling request"; "target" => &request.target);
    let result = match request.target.as_str() {
        "echo" => Ok(request.args.into_iter().next().unwrap_or(Value::Null)),
        "fail" => Err(RpcError::reply("requested failure")),
        other => {
            Err(RpcError::reply(format!("Unsupported function: {}", other)))
        }
    };
    protocol::response_message(msg.callback_id(), &result)
}

fn handle_control(mut msg: Stream) -> Result<Stream, RpcError> {
    let sequence = msg.sequence();
    if let Some(session) = protocol::parse_init(&mut msg) {
        assert!(session.is_empty() || session == SESSION);
        let grant = InitBack {
            session: SESSION.to_string(),
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            read_limit: 1 << 24,
            callback_pool_size: POOL_SIZE,
        };
        return protocol::init_back_message(sequence, &grant);
    }
    msg.set_read_pos(stream_rpc::stream::HEADER_SIZE);
    let (curr, _) = protocol::parse_request_ids(&mut msg)
        .ok_or_else(|| RpcError::protocol("unexpected control message"))?;
    Ok(protocol::request_ids_back_message(sequence, curr + POOL_SIZE))
}

async fn serve(socket: TcpStream, log: Logger) -> Result<(), RpcError> {
    let mut framed = Framed::new(socket, StreamCodec::new(1 << 24));
    while let Some(msg) = framed.next().await {
        let msg = msg?;
        let response = if msg.callback_id() == 0 {
            handle_control(msg)?
        } else {
            handle_request(msg, &log)?
        };
        framed.send(response).await?;
    }
    Ok(())
}

#[tokio::main]
async fn run_server(addr_tx: mpsc::Sender<SocketAddr>) {
    let root_log = test_log();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("local address");
    info!(root_log, "listening for requests"; "address" => addr);
    addr_tx.send(addr).expect("report address");

    while let Ok((socket, _)) = listener.accept().await {
        let process_log = root_log.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(socket, process_log.clone()).await {
                debug!(process_log, "connection ended"; "error" => %e);
            }
        });
    }
}

async fn run_client(addr: SocketAddr) -> Result<(), Box<dyn StdError>> {
    let log = test_log();
    let adapter = TcpAdapter::new(addr.to_string(), 1 << 24, Some(&log));
    let client = Client::new(adapter, ClientConfig::default(), Some(&log))?;

    for i in 1..20 {
        let data_size = i * 1000;
        let arg = "a".repeat(data_size);
        let result = client
            .send(Duration::from_secs(10), "echo", vec![Value::from(arg)])
            .await?;
        assert_eq!(result.as_str().map(str::len), Some(data_size));
    }

    let calls: Vec<_> = (0..2 * POOL_SIZE)
        .map(|i| {
            client.send(Duration::from_secs(10), "echo", vec![Value::from(i)])
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await?, Value::from(i as u64));
    }

    let err = client
        .send(Duration::from_secs(10), "fail", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reply);
    assert_eq!(err.message(), "requested failure");

    client.close().await?;
    Ok(())
}

#[test]
fn client_server_comms() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let _h_server = thread::spawn(move || run_server(addr_tx));

    let addr = addr_rx.recv().expect("server address");
    assert!(block_on(run_client(addr)).is_ok());
}
