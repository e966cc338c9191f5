// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};

use stream_rpc::json;
use stream_rpc::transport::TcpAdapter;
use stream_rpc::{Client, ClientConfig, Value};

static APP: &'static str = "rpccall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a single RPC call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("target")
                .help("Name of the remote function to call")
                .long("target")
                .short("t")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON array of arguments for the call")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Call timeout in milliseconds (Default: 10000)")
                .long("timeout")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON client configuration")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn fail<D: std::fmt::Display>(what: &str, e: D) -> ! {
    eprintln!("{}: {}", what, e);
    process::exit(1)
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()].concat();
    let timeout =
        value_t!(matches, "timeout", u64).unwrap_or(DEFAULT_TIMEOUT_MS);
    let target = matches.value_of("target").unwrap_or_else(|| {
        eprintln!("Failed to parse target argument as String");
        process::exit(1)
    });

    let args: Vec<Value> = match value_t!(matches, "args", serde_json::Value)
        .unwrap_or_else(|e| e.exit())
    {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(json::from_json)
            .collect::<Option<Vec<Value>>>()
            .unwrap_or_else(|| fail("Unsupported argument", "bad number")),
        other => fail("Arguments must be a JSON array", other),
    };

    let config = match matches.value_of("config") {
        Some(s) => ClientConfig::from_json(s)
            .unwrap_or_else(|e| fail("Invalid configuration", e)),
        None => ClientConfig::default(),
    };

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let adapter = TcpAdapter::new(addr, config.max_frame_len, Some(&log));
    let client = Client::new(adapter, config, Some(&log))
        .unwrap_or_else(|e| fail("Failed to start client", e));

    let result = client
        .send(Duration::from_millis(timeout), target, args)
        .await;
    let _ = client.close().await;

    match result {
        Ok(value) => println!("{}", json::to_json(&value)),
        Err(e) => fail("Error", e),
    }
}
