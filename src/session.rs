// Copyright 2020 Joyent, Inc.

//! The client session engine.
//!
//! [`Session`] is a plain state machine. It owns the adapter, the live
//! connection (if any) and the [`Registry`], and never blocks or reads a
//! clock: every entry point that cares about time takes the current
//! time in milliseconds. [`Client`](crate::client::Client) drives it from
//! a single task; tests can drive it directly.
//!
//! A connection goes through a handshake before it carries calls. The
//! engine sends Init with the session string it holds (empty on the very
//! first connection) and waits for a matching InitBack, which grants the
//! session string to present next time, the server's timeouts and the
//! size of the callback pool. Anything else received while waiting aborts
//! the attempt.

use slog::{debug, info, o, trace, warn, Drain, Logger};
use tokio::sync::oneshot;

use crate::config::ClientConfig;
use crate::error::RpcError;
use crate::protocol::{self, Control, InitBack};
use crate::registry::{CallResult, PendingCall, Registry};
use crate::stream::Stream;
use crate::transport::{AdapterEvent, ClientAdapter, EventSender, StreamConn};
use crate::value::Value;

/// Outage ticks on which a reconnection is attempted, before settling on
/// one attempt every `RECONNECT_PERIOD` ticks.
const RECONNECT_SCHEDULE: [u64; 6] = [0, 2, 5, 8, 15, 30];
const RECONNECT_PERIOD: u64 = 30;

fn should_reconnect(outage_tick: u64) -> bool {
    if outage_tick <= RECONNECT_PERIOD {
        RECONNECT_SCHEDULE.contains(&outage_tick)
    } else {
        outage_tick % RECONNECT_PERIOD == 0
    }
}

enum Link {
    Down,
    Handshaking {
        conn: Box<dyn StreamConn>,
        sequence: u64,
    },
    Up {
        conn: Box<dyn StreamConn>,
    },
}

pub struct Session {
    adapter: Box<dyn ClientAdapter>,
    // Set by open(), cleared by the adapter's Closed event.
    adapter_active: bool,
    link: Link,
    running: bool,
    session: String,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    read_limit: u64,
    callback_pool_size: u64,
    registry: Registry,
    control_sequence: u64,
    last_control_ms: u64,
    outage_ticks: u64,
    config: ClientConfig,
    log: Logger,
}

impl Session {
    pub fn new(
        adapter: Box<dyn ClientAdapter>,
        config: ClientConfig,
        log: Option<&Logger>,
    ) -> Session {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Session {
            adapter,
            adapter_active: false,
            link: Link::Down,
            running: true,
            session: String::new(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            read_limit: 0,
            callback_pool_size: 0,
            registry: Registry::new(config.sweep_interval_ms),
            control_sequence: 0,
            last_control_ms: 0,
            outage_ticks: 0,
            config,
            log,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether a handshake has completed on the current connection.
    pub fn is_connected(&self) -> bool {
        match self.link {
            Link::Up { .. } => true,
            _ => false,
        }
    }

    /// Whether a connection opened by the adapter has yet to report
    /// `Closed`.
    pub fn adapter_active(&self) -> bool {
        self.adapter_active
    }

    /// The session string granted by the server, empty before the first
    /// handshake.
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms
    }

    pub fn write_timeout_ms(&self) -> u64 {
        self.write_timeout_ms
    }

    pub fn read_limit(&self) -> u64 {
        self.read_limit
    }

    pub fn callback_pool_size(&self) -> u64 {
        self.callback_pool_size
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Queue a call to `target`. `done` receives the outcome. The call is
    /// admitted by the next tick that finds room in the window.
    pub fn send(
        &mut self,
        target: &str,
        args: &[Value],
        timeout_ms: u64,
        done: oneshot::Sender<CallResult>,
        now_ms: u64,
    ) {
        if !self.running {
            let err = RpcError::kernel_panic("client is not running");
            let _ = done.send(Err(err));
            return;
        }
        match protocol::request_message(target, args) {
            Ok(stream) => {
                trace!(self.log, "queueing call"; "target" => target);
                let call = PendingCall::new(stream, timeout_ms, now_ms, done);
                self.registry.enqueue(call);
            }
            Err(err) => {
                let _ = done.send(Err(err));
            }
        }
    }

    /// The periodic reconnection check. While no connection is open,
    /// attempts follow a backoff schedule counted in ticks of this call.
    pub fn reconnect_tick(&mut self, events: &EventSender) {
        if !self.running {
            return;
        }
        if self.adapter_active {
            if self.is_connected() {
                self.outage_ticks = 0;
            }
            return;
        }
        let tick = self.outage_ticks;
        self.outage_ticks += 1;
        if should_reconnect(tick) {
            self.open(events);
        } else {
            trace!(self.log, "reconnect deferred"; "outage_tick" => tick);
        }
    }

    /// Open a connection now unless one is already open or opening.
    pub fn reconnect_now(&mut self, events: &EventSender) {
        if self.running && !self.adapter_active {
            self.open(events);
        }
    }

    fn open(&mut self, events: &EventSender) {
        debug!(self.log, "opening connection");
        self.adapter_active = true;
        self.adapter.open(events.clone());
    }

    /// The steady-state tick: expire overdue calls, keep the server
    /// informed of what is in flight and admit queued calls.
    pub fn tick(&mut self, now_ms: u64) {
        if !self.running {
            return;
        }
        let expired = self.registry.sweep_timeouts(now_ms);
        if expired > 0 {
            debug!(self.log, "calls timed out"; "count" => expired);
        }
        if self.is_connected() {
            self.maybe_request_ids(now_ms);
            self.admit(now_ms);
        }
    }

    fn maybe_request_ids(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_control_ms);
        if elapsed < self.config.control_interval_ms {
            return;
        }
        let heartbeat_due = elapsed as f64
            >= self.read_timeout_ms as f64 * self.config.heartbeat_ratio;
        let busy =
            self.registry.in_flight_len() as u64 > self.callback_pool_size / 2;
        if busy && !heartbeat_due {
            return;
        }

        self.control_sequence += 1;
        let stream = protocol::request_ids_message(
            self.control_sequence,
            self.registry.curr_callback_id(),
            self.registry.in_flight_ids(),
        );
        self.last_control_ms = now_ms;
        if let Err(err) = self.send_on_link(&stream) {
            self.abort_connection(err);
        }
    }

    fn admit(&mut self, now_ms: u64) {
        let result = match &mut self.link {
            Link::Up { conn } => self.registry.try_admit(conn.as_mut(), now_ms),
            _ => return,
        };
        match result {
            Ok(0) => (),
            Ok(count) => trace!(self.log, "admitted calls"; "count" => count),
            Err(err) => self.abort_connection(err),
        }
    }

    fn send_on_link(&mut self, stream: &Stream) -> Result<(), RpcError> {
        match &mut self.link {
            Link::Up { conn } | Link::Handshaking { conn, .. } => {
                conn.send_stream(stream)
            }
            Link::Down => Err(RpcError::transport("not connected")),
        }
    }

    pub fn handle_event(&mut self, event: AdapterEvent, now_ms: u64) {
        match event {
            AdapterEvent::Opened(conn) => self.on_opened(conn),
            AdapterEvent::Received(stream) => self.on_received(stream, now_ms),
            AdapterEvent::Closed => self.on_closed(),
            AdapterEvent::Error(err) => {
                warn!(self.log, "transport error"; "error" => %err)
            }
        }
    }

    fn on_opened(&mut self, mut conn: Box<dyn StreamConn>) {
        if !self.running {
            let _ = conn.close();
            return;
        }
        self.control_sequence += 1;
        let sequence = self.control_sequence;
        let sent = protocol::init_message(sequence, &self.session)
            .and_then(|init| conn.send_stream(&init));
        match sent {
            Ok(()) => {
                debug!(self.log, "connection opened, sent init";
                    "sequence" => sequence);
                self.link = Link::Handshaking { conn, sequence };
            }
            Err(err) => {
                warn!(self.log, "failed to start handshake"; "error" => %err);
                let _ = conn.close();
            }
        }
    }

    fn on_received(&mut self, mut stream: Stream, now_ms: u64) {
        let handshake = match &self.link {
            Link::Down => {
                debug!(self.log, "dropping message, not connected");
                return;
            }
            Link::Handshaking { sequence, .. } => Some(*sequence),
            Link::Up { .. } => None,
        };

        if let Some(sequence) = handshake {
            match protocol::parse_init_back(&mut stream, sequence) {
                Ok(grant) => self.on_handshake(grant, now_ms),
                Err(err) => self.abort_connection(err),
            }
            return;
        }

        let callback_id = stream.callback_id();
        if callback_id > 0 {
            let result = protocol::parse_response(&mut stream);
            if !self.registry.resolve(u64::from(callback_id), result) {
                debug!(self.log, "ignoring response to unknown call";
                    "callback_id" => callback_id);
            }
        } else if stream.sequence() > 0 {
            match protocol::parse_control(&mut stream) {
                Ok(Control::RequestIdsBack { max_callback_id }) => {
                    if self.registry.grant(max_callback_id) {
                        debug!(self.log, "window raised";
                            "max_callback_id" => max_callback_id);
                        self.admit(now_ms);
                    }
                }
                Err(err) => self.abort_connection(err),
            }
        } else {
            debug!(self.log, "ignoring broadcast message");
        }
    }

    fn on_handshake(&mut self, grant: InitBack, now_ms: u64) {
        let conn = match std::mem::replace(&mut self.link, Link::Down) {
            Link::Handshaking { conn, .. } => conn,
            other => {
                self.link = other;
                return;
            }
        };

        if !self.session.is_empty() && self.session != grant.session {
            info!(self.log, "server started a new session");
        }
        self.session = grant.session;
        self.read_timeout_ms = grant.read_timeout_ms;
        self.write_timeout_ms = grant.write_timeout_ms;
        self.read_limit = grant.read_limit;
        self.callback_pool_size = grant.callback_pool_size;

        let in_flight = self.registry.in_flight_len() as u64;
        let max = self.registry.curr_callback_id().saturating_add(
            grant.callback_pool_size.saturating_sub(in_flight),
        );
        self.registry.grant(max);

        self.link = Link::Up { conn };
        self.outage_ticks = 0;
        self.last_control_ms = now_ms;
        info!(self.log, "session established";
            "read_timeout_ms" => self.read_timeout_ms,
            "callback_pool_size" => self.callback_pool_size,
            "max_callback_id" => self.registry.max_callback_id());
        self.admit(now_ms);
    }

    fn on_closed(&mut self) {
        self.adapter_active = false;
        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Down => debug!(self.log, "connection attempt ended"),
            _ => info!(self.log, "connection closed";
                "queued" => self.registry.unsent_len(),
                "in_flight" => self.registry.in_flight_len()),
        }
    }

    // The registry is left alone: its calls resume on the next connection.
    fn abort_connection(&mut self, err: RpcError) {
        warn!(self.log, "closing connection"; "error" => %err);
        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Handshaking { mut conn, .. } | Link::Up { mut conn } => {
                let _ = conn.close();
            }
            Link::Down => (),
        }
    }

    /// Stop the engine. Every outstanding call fails with a KernelPanic
    /// error. The connection is closed; the caller should keep feeding
    /// events until [`adapter_active`](Session::adapter_active) turns
    /// false.
    pub fn close(&mut self) -> Result<(), RpcError> {
        if !self.running {
            return Err(RpcError::kernel_panic("client is not running"));
        }
        self.running = false;

        let failed = self
            .registry
            .fail_all(&RpcError::kernel_panic("client closed"));
        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Handshaking { mut conn, .. } | Link::Up { mut conn } => {
                let _ = conn.close();
            }
            Link::Down => (),
        }
        if self.adapter_active {
            self.adapter.close();
        }
        info!(self.log, "client closed"; "abandoned_calls" => failed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use crate::error::ErrorKind;
    use crate::memory::{memory_pair, MemoryListener, MemoryPeer};
    use crate::registry::TIMEOUT_MESSAGE;
    use crate::stream::HEADER_SIZE;

    const SESSION: &str = "0123456789abcdef0123456789abcdef-session";

    struct Harness {
        session: Session,
        listener: MemoryListener,
        events_tx: EventSender,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
        now_ms: u64,
    }

    impl Harness {
        fn new() -> Harness {
            let (adapter, listener) = memory_pair();
            let (events_tx, events) = mpsc::unbounded_channel();
            Harness {
                session: Session::new(
                    Box::new(adapter),
                    ClientConfig::default(),
                    None,
                ),
                listener,
                events_tx,
                events,
                now_ms: 0,
            }
        }

        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.session.handle_event(event, self.now_ms);
            }
        }

        fn advance(&mut self, ms: u64) {
            self.now_ms += ms;
            self.session.tick(self.now_ms);
            self.pump();
        }

        /// Open a connection and return the peer after the client's Init.
        fn connect(&mut self) -> (MemoryPeer, u64, String) {
            self.session.reconnect_now(&self.events_tx);
            self.pump();
            let mut peer = self.listener.try_accept().expect("peer");
            let mut init = peer.try_recv().expect("init");
            assert_eq!(init.callback_id(), 0);
            let sequence = init.sequence();
            let session = protocol::parse_init(&mut init).expect("parse init");
            (peer, sequence, session)
        }

        fn handshake(&mut self, pool: u64) -> MemoryPeer {
            self.handshake_with(pool, 30_000)
        }

        fn handshake_with(
            &mut self,
            pool: u64,
            read_timeout_ms: u64,
        ) -> MemoryPeer {
            let (peer, sequence, _) = self.connect();
            let grant = InitBack {
                session: SESSION.to_string(),
                read_timeout_ms,
                write_timeout_ms: 30_000,
                read_limit: 1 << 20,
                callback_pool_size: pool,
            };
            let back = protocol::init_back_message(sequence, &grant)
                .expect("init back");
            peer.send(&back).expect("send");
            self.pump();
            assert!(self.session.is_connected());
            peer
        }

        fn call(
            &mut self,
            target: &str,
            timeout_ms: u64,
        ) -> oneshot::Receiver<CallResult> {
            let (tx, rx) = oneshot::channel();
            self.session.send(
                target,
                &[Value::from(target)],
                timeout_ms,
                tx,
                self.now_ms,
            );
            self.session.tick(self.now_ms);
            self.pump();
            rx
        }
    }

    fn reply(peer: &MemoryPeer, request: &mut Stream) {
        let parsed = protocol::parse_request(request).expect("request");
        let response = protocol::response_message(
            request.callback_id(),
            &Ok(parsed.args[0].clone()),
        )
        .expect("response");
        peer.send(&response).expect("send");
    }

    #[test]
    fn reconnect_schedule() {
        let attempts: Vec<u64> =
            (0..100).filter(|t| should_reconnect(*t)).collect();
        assert_eq!(attempts, vec![0, 2, 5, 8, 15, 30, 60, 90]);
    }

    #[test]
    fn handshake_and_echo() {
        let mut h = Harness::new();
        let (peer, _, session) = h.connect();
        assert_eq!(session, "");
        assert!(!h.session.is_connected());
        drop(peer);

        let mut h = Harness::new();
        let mut peer = h.handshake(4);
        assert_eq!(h.session.session(), SESSION);
        assert_eq!(h.session.registry().max_callback_id(), 4);

        let mut rx = h.call("echo", 1_000);
        let mut request = peer.try_recv().expect("request");
        assert_eq!(request.callback_id(), 1);
        let parsed = protocol::parse_request(&mut request).expect("parse");
        assert_eq!(parsed.target, "echo");
        assert_eq!(parsed.depth, 0);
        assert_eq!(parsed.origin, protocol::CLIENT_ORIGIN);

        request.set_read_pos(HEADER_SIZE);
        reply(&peer, &mut request);
        h.pump();
        assert_eq!(rx.try_recv(), Ok(Ok(Value::from("echo"))));
    }

    #[test]
    fn bad_init_back_aborts_attempt() {
        let mut h = Harness::new();
        let (peer, sequence, _) = h.connect();
        let grant = InitBack {
            session: "short".to_string(),
            read_timeout_ms: 1,
            write_timeout_ms: 1,
            read_limit: 1,
            callback_pool_size: 1,
        };
        let back = protocol::init_back_message(sequence, &grant).expect("msg");
        peer.send(&back).expect("send");
        h.pump();
        assert!(peer.is_closed());
        assert!(!h.session.is_connected());
        assert!(!h.session.adapter_active());

        // the next attempt presents no session either
        let (_peer, _, session) = h.connect();
        assert_eq!(session, "");
    }

    #[test]
    fn responses_match_by_callback_id() {
        let mut h = Harness::new();
        let mut peer = h.handshake(8);
        let mut first = h.call("first", 1_000);
        let mut second = h.call("second", 1_000);
        let mut a = peer.try_recv().expect("a");
        let mut b = peer.try_recv().expect("b");

        reply(&peer, &mut b);
        reply(&peer, &mut a);
        // late duplicate is ignored
        b.set_read_pos(HEADER_SIZE);
        reply(&peer, &mut b);
        h.pump();

        assert_eq!(first.try_recv(), Ok(Ok(Value::from("first"))));
        assert_eq!(second.try_recv(), Ok(Ok(Value::from("second"))));
        assert!(h.session.is_connected());
    }

    #[test]
    fn window_limits_admission() {
        let mut h = Harness::new();
        let mut peer = h.handshake(2);
        let _calls: Vec<_> = (0..5).map(|_| h.call("x", 60_000)).collect();
        assert_eq!(h.session.registry().in_flight_len(), 2);
        assert_eq!(h.session.registry().unsent_len(), 3);

        // the RequestIds heartbeat reports what is in flight
        while peer.try_recv().is_some() {}
        h.advance(1_000);
        h.advance(30_000);
        let mut ids = peer.try_recv().expect("request ids");
        assert_eq!(ids.callback_id(), 0);
        let (curr, in_flight) =
            protocol::parse_request_ids(&mut ids).expect("parse");
        assert_eq!(curr, 2);
        assert_eq!(in_flight, vec![1, 2]);

        let back = protocol::request_ids_back_message(ids.sequence(), 4);
        peer.send(&back).expect("send");
        h.pump();
        assert_eq!(h.session.registry().curr_callback_id(), 4);
        assert_eq!(h.session.registry().unsent_len(), 1);

        // never lowered
        let back = protocol::request_ids_back_message(ids.sequence(), 1);
        peer.send(&back).expect("send");
        h.pump();
        assert_eq!(h.session.registry().max_callback_id(), 4);
    }

    fn control_messages(peer: &mut MemoryPeer) -> usize {
        let mut count = 0;
        while let Some(msg) = peer.try_recv() {
            if msg.callback_id() == 0 {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn request_ids_paced_when_idle() {
        let mut h = Harness::new();
        let mut peer = h.handshake(4);
        assert_eq!(control_messages(&mut peer), 0);

        h.advance(500);
        assert_eq!(control_messages(&mut peer), 0);
        h.advance(500);
        assert_eq!(control_messages(&mut peer), 1);
        // at most one per control interval
        h.advance(200);
        h.advance(200);
        assert_eq!(control_messages(&mut peer), 0);
        h.advance(600);
        assert_eq!(control_messages(&mut peer), 1);
    }

    #[test]
    fn request_ids_held_back_while_busy() {
        let mut h = Harness::new();
        let mut peer = h.handshake_with(2, 10_000);
        let _calls: Vec<_> = (0..2).map(|_| h.call("x", 60_000)).collect();
        assert_eq!(h.session.registry().in_flight_len(), 2);
        while peer.try_recv().is_some() {}

        for _ in 0..5 {
            h.advance(500);
        }
        assert_eq!(h.now_ms, 2_500);
        assert_eq!(control_messages(&mut peer), 0);

        h.advance(5_400);
        assert_eq!(control_messages(&mut peer), 0);
        // 80% of the read timeout has passed
        h.advance(1_100);
        assert_eq!(h.now_ms, 9_000);
        assert_eq!(control_messages(&mut peer), 1);

        // the heartbeat clock restarts
        h.advance(1_000);
        assert_eq!(control_messages(&mut peer), 0);
    }

    #[test]
    fn call_times_out() {
        let mut h = Harness::new();
        let _peer = h.handshake(4);
        let mut rx = h.call("slow", 50);
        h.advance(40);
        assert!(rx.try_recv().is_err());
        h.advance(800);
        let err = rx.try_recv().expect("done").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reply);
        assert_eq!(err.message(), TIMEOUT_MESSAGE);
    }

    #[test]
    fn calls_survive_reconnect() {
        let mut h = Harness::new();
        let mut peer = h.handshake(1);
        let mut sent = h.call("sent", 60_000);
        let mut queued = h.call("queued", 60_000);
        let mut first = peer.try_recv().expect("first");
        assert_eq!(first.callback_id(), 1);

        peer.close();
        h.pump();
        assert!(!h.session.is_connected());
        assert_eq!(h.session.registry().in_flight_len(), 1);
        assert_eq!(h.session.registry().unsent_len(), 1);

        let (peer, sequence, session) = h.connect();
        assert_eq!(session, SESSION);
        let grant = InitBack {
            session: SESSION.to_string(),
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            read_limit: 1 << 20,
            callback_pool_size: 2,
        };
        peer.send(&protocol::init_back_message(sequence, &grant).expect("msg"))
            .expect("send");
        h.pump();

        let mut peer = peer;
        let mut second = peer.try_recv().expect("queued call admitted");
        assert_eq!(second.callback_id(), 2);

        reply(&peer, &mut second);
        reply(&peer, &mut first);
        h.pump();
        assert_eq!(queued.try_recv(), Ok(Ok(Value::from("queued"))));
        assert_eq!(sent.try_recv(), Ok(Ok(Value::from("sent"))));
    }

    #[test]
    fn unexpected_control_closes_connection() {
        let mut h = Harness::new();
        let peer = h.handshake(1);
        let mut bogus = Stream::new();
        bogus.set_sequence(99);
        bogus.write_int64(crate::value::Int64::new(42));
        peer.send(&bogus).expect("send");
        h.pump();
        assert!(peer.is_closed());
        assert!(!h.session.is_connected());
    }

    #[test]
    fn broadcast_is_ignored() {
        let mut h = Harness::new();
        let peer = h.handshake(1);
        let mut broadcast = Stream::new();
        broadcast.write_string("hello").expect("write");
        peer.send(&broadcast).expect("send");
        h.pump();
        assert!(h.session.is_connected());
    }

    #[test]
    fn close_rejects_outstanding() {
        let mut h = Harness::new();
        let peer = h.handshake(1);
        let mut sent = h.call("a", 60_000);
        let mut queued = h.call("b", 60_000);

        h.session.close().expect("close");
        h.pump();
        assert!(peer.is_closed());
        assert!(!h.session.adapter_active());
        for rx in &mut [&mut sent, &mut queued] {
            let err = rx.try_recv().expect("done").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::KernelPanic);
        }

        let err = h.session.close().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KernelPanic);
        let mut late = h.call("c", 60_000);
        let err = late.try_recv().expect("done").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KernelPanic);
    }
}
