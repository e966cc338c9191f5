// Copyright 2020 Joyent, Inc.

//! Bookkeeping for calls that have not completed yet.
//!
//! A call waits in a FIFO until the server's admission window has room for
//! it. Admission assigns the next callback ID, stamps it into the call's
//! header and hands the stream to the connection; from then on the call is
//! looked up by that ID when its response arrives.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::stream::Stream;
use crate::transport::StreamConn;
use crate::value::Value;

pub type CallResult = Result<Value, RpcError>;

/// Message of the error a call is failed with when its deadline passes.
pub const TIMEOUT_MESSAGE: &str = "timeout";

/// Callback IDs travel in a 32-bit header field.
const MAX_CALLBACK_ID: u64 = u32::max_value() as u64;

pub struct PendingCall {
    id: u64,
    start_ms: u64,
    timeout_ms: u64,
    sent_ms: Option<u64>,
    stream: Stream,
    done: oneshot::Sender<CallResult>,
}

impl PendingCall {
    pub fn new(
        stream: Stream,
        timeout_ms: u64,
        start_ms: u64,
        done: oneshot::Sender<CallResult>,
    ) -> PendingCall {
        PendingCall {
            id: 0,
            start_ms,
            timeout_ms,
            sent_ms: None,
            stream,
            done,
        }
    }

    /// The callback ID, or 0 while the call has not been admitted.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.start_ms) > self.timeout_ms
    }

    fn timeout_error(&self, now_ms: u64) -> RpcError {
        let err = RpcError::reply(TIMEOUT_MESSAGE).add_debug(format!(
            "waited {} ms of {} ms",
            now_ms.saturating_sub(self.start_ms),
            self.timeout_ms
        ));
        match self.sent_ms {
            Some(sent_ms) => err.add_debug(format!(
                "callback {} sent {} ms ago",
                self.id,
                now_ms.saturating_sub(sent_ms)
            )),
            None => err.add_debug("never sent"),
        }
    }

    // Consuming the call is what makes completion happen at most once.
    // The caller may have dropped its handle; that is not an error.
    fn complete(self, result: CallResult) {
        let _ = self.done.send(result);
    }
}

pub struct Registry {
    unsent: VecDeque<PendingCall>,
    sent: HashMap<u64, PendingCall>,
    curr_callback_id: u64,
    max_callback_id: u64,
    sweep_interval_ms: u64,
    last_sweep_ms: Option<u64>,
}

impl Registry {
    pub fn new(sweep_interval_ms: u64) -> Registry {
        Registry {
            unsent: VecDeque::new(),
            sent: HashMap::new(),
            curr_callback_id: 0,
            max_callback_id: 0,
            sweep_interval_ms,
            last_sweep_ms: None,
        }
    }

    pub fn curr_callback_id(&self) -> u64 {
        self.curr_callback_id
    }

    pub fn max_callback_id(&self) -> u64 {
        self.max_callback_id
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.sent.len()
    }

    pub fn in_flight_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sent.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Raise the admission window. A lower bound than the current one is
    /// ignored. Returns whether the window grew.
    pub fn grant(&mut self, max_callback_id: u64) -> bool {
        let max_callback_id = max_callback_id.min(MAX_CALLBACK_ID);
        if max_callback_id > self.max_callback_id {
            self.max_callback_id = max_callback_id;
            true
        } else {
            false
        }
    }

    pub fn enqueue(&mut self, call: PendingCall) {
        self.unsent.push_back(call);
    }

    /// Admit queued calls while the window allows, sending each over
    /// `conn`. Returns how many were sent. A failed send stops admission;
    /// the call it failed on keeps its ID and waits for a response or its
    /// deadline like any other admitted call.
    pub fn try_admit(
        &mut self,
        conn: &mut dyn StreamConn,
        now_ms: u64,
    ) -> Result<usize, RpcError> {
        let mut admitted = 0;
        while self.curr_callback_id < self.max_callback_id {
            let mut call = match self.unsent.pop_front() {
                Some(call) => call,
                None => break,
            };
            self.curr_callback_id += 1;
            call.id = self.curr_callback_id;
            call.stream.set_callback_id(call.id as u32);
            call.sent_ms = Some(now_ms);
            let sent = conn.send_stream(&call.stream);
            self.sent.insert(call.id, call);
            sent?;
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Complete the admitted call `id`. Returns false when no such call is
    /// waiting, e.g. for a late or duplicate response.
    pub fn resolve(&mut self, id: u64, result: CallResult) -> bool {
        match self.sent.remove(&id) {
            Some(call) => {
                call.complete(result);
                true
            }
            None => false,
        }
    }

    /// Fail every call whose deadline has passed. Runs at most once per
    /// sweep interval; returns how many calls were failed.
    pub fn sweep_timeouts(&mut self, now_ms: u64) -> usize {
        if let Some(last) = self.last_sweep_ms {
            if now_ms.saturating_sub(last) < self.sweep_interval_ms {
                return 0;
            }
        }
        self.last_sweep_ms = Some(now_ms);

        let mut expired = Vec::new();
        let queued = std::mem::replace(&mut self.unsent, VecDeque::new());
        for call in queued {
            if call.is_expired(now_ms) {
                expired.push(call);
            } else {
                self.unsent.push_back(call);
            }
        }

        let ids: Vec<u64> = self
            .sent
            .values()
            .filter(|call| call.is_expired(now_ms))
            .map(|call| call.id)
            .collect();
        for id in ids {
            if let Some(call) = self.sent.remove(&id) {
                expired.push(call);
            }
        }

        let count = expired.len();
        for call in expired {
            let err = call.timeout_error(now_ms);
            call.complete(Err(err));
        }
        count
    }

    /// Fail every outstanding call, queued or admitted, with `err`.
    pub fn fail_all(&mut self, err: &RpcError) -> usize {
        let mut count = 0;
        for call in self.unsent.drain(..) {
            call.complete(Err(err.clone()));
            count += 1;
        }
        for (_, call) in self.sent.drain() {
            call.complete(Err(err.clone()));
            count += 1;
        }
        count
    }
}
