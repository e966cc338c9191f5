// Copyright 2020 Joyent, Inc.

//! The asynchronous client.
//!
//! A [`Client`] runs one [`Session`] on a dedicated tokio task. The task
//! owns every piece of session state and is the only thing that touches
//! it: calls, adapter events and the two periodic timers are all handled
//! one at a time from a single `select!` loop. `Client` handles are cheap
//! to clone and only talk to that task over a channel.

use std::convert::TryFrom;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use slog::Logger;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::ClientConfig;
use crate::error::RpcError;
use crate::registry::CallResult;
use crate::session::Session;
use crate::transport::{AdapterEvent, ClientAdapter};
use crate::value::Value;

enum Command {
    Send {
        target: String,
        args: Vec<Value>,
        timeout: Duration,
        done: oneshot::Sender<CallResult>,
    },
    Close {
        done: oneshot::Sender<Result<(), RpcError>>,
    },
}

fn not_running() -> RpcError {
    RpcError::kernel_panic("client is not running")
}

/// The outcome of one call.
pub struct Call {
    rx: oneshot::Receiver<CallResult>,
}

impl Future for Call {
    type Output = CallResult;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<CallResult> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| Err(RpcError::kernel_panic("client closed")))
        })
    }
}

#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Start a client connecting through `adapter`. Must be called from
    /// within a tokio runtime.
    pub fn new<A>(
        adapter: A,
        config: ClientConfig,
        log: Option<&Logger>,
    ) -> Result<Client, RpcError>
    where
        A: ClientAdapter + 'static,
    {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(Box::new(adapter), config.clone(), log);
        tokio::spawn(run(session, config, rx));
        Ok(Client { commands: tx })
    }

    /// Call `target` with `args`. The returned future fails with a Reply
    /// error if no response arrives within `timeout`.
    pub fn send(
        &self,
        timeout: Duration,
        target: &str,
        args: Vec<Value>,
    ) -> Call {
        let (tx, rx) = oneshot::channel();
        let cmd = Command::Send {
            target: target.to_string(),
            args,
            timeout,
            done: tx,
        };
        if let Err(mpsc::error::SendError(Command::Send { done, .. })) =
            self.commands.send(cmd)
        {
            let _ = done.send(Err(not_running()));
        }
        Call { rx }
    }

    /// Stop the client. Resolves once the connection has closed. Calls
    /// still outstanding fail with a KernelPanic error, as does closing a
    /// client a second time.
    pub async fn close(&self) -> Result<(), RpcError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Close { done: tx })
            .map_err(|_| not_running())?;
        rx.await.map_err(|_| not_running())?
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn elapsed_ms(start: Instant) -> u64 {
    duration_ms(start.elapsed())
}

async fn run(
    mut session: Session,
    config: ClientConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let start = Instant::now();
    let (events_tx, mut events) = mpsc::unbounded_channel::<AdapterEvent>();
    let mut tick =
        time::interval(Duration::from_millis(config.tick_interval_ms));
    let mut reconnect =
        time::interval(Duration::from_millis(config.reconnect_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let close_ack = loop {
        tokio::select! {
            _ = reconnect.tick() => session.reconnect_tick(&events_tx),
            _ = tick.tick() => session.tick(elapsed_ms(start)),
            Some(event) = events.recv() => {
                session.handle_event(event, elapsed_ms(start))
            }
            command = commands.recv() => match command {
                Some(Command::Send { target, args, timeout, done }) => {
                    let now = elapsed_ms(start);
                    let timeout_ms = duration_ms(timeout);
                    session.send(&target, &args, timeout_ms, done, now);
                    session.reconnect_now(&events_tx);
                    session.tick(now);
                }
                Some(Command::Close { done }) => {
                    break Some((done, session.close()));
                }
                None => {
                    let _ = session.close();
                    break None;
                }
            },
        }
    };

    // Wait for the adapter to report the connection gone before letting
    // go of the session. Once our sender is dropped the channel ends when
    // the adapter drops its own.
    drop(events_tx);
    while session.adapter_active() {
        match events.recv().await {
            Some(event) => session.handle_event(event, elapsed_ms(start)),
            None => break,
        }
    }
    if let Some((done, result)) = close_ack {
        let _ = done.send(result);
    }
}
