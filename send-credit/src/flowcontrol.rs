// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Send-side flow control limits imposed by the peer.

use std::cmp;

use std::collections::hash_map;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::stream_id;
use crate::stream_id::StreamIdHashMap;

use crate::Error;
use crate::Result;
use crate::Role;
use crate::TransportParams;

/// Send credit state for a single stream.
#[derive(Debug, Default)]
struct StreamCredit {
    /// The peer-imposed ceiling on the stream's send offset.
    allowed: u64,

    /// The highest send offset handed out to the stream's sender.
    assigned: u64,
}

/// The mutable credit ledger, guarded by a single mutex.
///
/// The connection budget couples all streams, so per-stream locks would
/// still need a global acquisition for `max_data_assigned`; every critical
/// section here is a map lookup plus O(1) arithmetic.
#[derive(Default)]
struct Ledger {
    /// The highest connection-level limit the peer has granted.
    max_data_allowed: u64,

    /// The total bytes committed across all streams.
    max_data_assigned: u64,

    /// Per-stream credit state, created lazily on first touch.
    streams: StreamIdHashMap<StreamCredit>,

    /// Set on teardown. Waiters observe this and fail with `Cancelled`.
    closed: bool,
}

impl Ledger {
    fn conn_available(&self) -> u64 {
        self.max_data_allowed - self.max_data_assigned
    }

    /// Raises the `allowed` ceiling of every stream matched by `matches` to
    /// at least `new_limit`. Returns true if any ceiling moved.
    fn raise_allowed<F: Fn(u64) -> bool>(
        &mut self, new_limit: u64, matches: F,
    ) -> bool {
        let mut raised = false;

        for (id, stream) in self.streams.iter_mut() {
            if matches(*id) && new_limit > stream.allowed {
                stream.allowed = new_limit;
                raised = true;
            }
        }

        raised
    }
}

struct Shared {
    ledger: Mutex<Ledger>,

    /// Signalled whenever any limit increases, and on teardown.
    credit_raised: Condvar,
}

/// Keeps track of the connection and stream flow control limits imposed by
/// the peer, and hands out send credit against them.
///
/// A single `FlowControl` is shared by all of a connection's stream senders
/// and by its receive path. Senders call [`reserve()`] to commit send
/// offsets and [`wait_for_credit()`] to park when a stream has no credit;
/// the receive path feeds peer updates in through [`on_max_data()`],
/// [`on_max_stream_data()`] and (for clients) the one-shot
/// [`apply_peer_transport_params()`].
///
/// All methods take `&self` and are safe to call concurrently.
///
/// [`reserve()`]: FlowControl::reserve
/// [`wait_for_credit()`]: FlowControl::wait_for_credit
/// [`on_max_data()`]: FlowControl::on_max_data
/// [`on_max_stream_data()`]: FlowControl::on_max_stream_data
/// [`apply_peer_transport_params()`]: FlowControl::apply_peer_transport_params
pub struct FlowControl {
    role: Role,

    /// The initial limits as constructed. Immutable; `apply_peer_transport_params()`
    /// compares the handshake values against these.
    initial_max_data: u64,
    initial_max_stream_data_bidi_local: u64,
    initial_max_stream_data_bidi_remote: u64,
    initial_max_stream_data_uni: u64,

    trace_id: String,

    shared: Arc<Shared>,
}

impl FlowControl {
    /// Creates a new flow controller from the initial limits in
    /// `initial_params`.
    ///
    /// For a sender these are the limits advertised by the peer, or, for a
    /// client sending 0-RTT data, the values remembered from a previous
    /// session. `trace_id` is prefixed to this controller's log output.
    ///
    /// Returns [`Error::InvalidArgument`] if any limit exceeds
    /// [`MAX_VAR_INT`](crate::MAX_VAR_INT).
    pub fn new(
        role: Role, initial_params: &TransportParams, trace_id: String,
    ) -> Result<FlowControl> {
        if !initial_params.is_valid() {
            return Err(Error::InvalidArgument);
        }

        let ledger = Ledger {
            max_data_allowed: initial_params.initial_max_data,
            ..Default::default()
        };

        Ok(FlowControl {
            role,

            initial_max_data: initial_params.initial_max_data,
            initial_max_stream_data_bidi_local: initial_params
                .initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: initial_params
                .initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: initial_params
                .initial_max_stream_data_uni,

            trace_id,

            shared: Arc::new(Shared {
                ledger: Mutex::new(ledger),
                credit_raised: Condvar::new(),
            }),
        })
    }

    /// Requests to advance the stream's committed send offset up to
    /// `requested_limit`.
    ///
    /// The granted increment is capped by both the stream's remaining
    /// credit and the connection's remaining credit, so the returned new
    /// committed offset may fall anywhere between the current offset
    /// (no credit available) and `requested_limit`. The caller may transmit
    /// stream data up to, but not beyond, the returned offset.
    ///
    /// Returns [`Error::InvalidArgument`] if `requested_limit` lies below
    /// the stream's current committed offset.
    pub fn reserve(&self, stream_id: u64, requested_limit: u64) -> Result<u64> {
        let mut ledger = self.lock();

        let conn_available = ledger.conn_available();
        let stream = self.stream_credit(&mut ledger, stream_id)?;

        if requested_limit < stream.assigned {
            return Err(Error::InvalidArgument);
        }

        let requested = requested_limit - stream.assigned;
        let possible = cmp::min(stream.allowed - stream.assigned, conn_available);
        let granted = cmp::min(requested, possible);

        stream.assigned += granted;
        let new_limit = stream.assigned;

        ledger.max_data_assigned += granted;

        Ok(new_limit)
    }

    /// Returns the number of bytes the stream could reserve right now.
    ///
    /// This is an advisory snapshot: concurrent reservations or peer
    /// updates can change the outcome of a subsequent [`reserve()`] call.
    ///
    /// [`reserve()`]: FlowControl::reserve
    pub fn available(&self, stream_id: u64) -> Result<u64> {
        let mut ledger = self.lock();

        self.available_credit(&mut ledger, stream_id)
    }

    /// Blocks the calling thread until the stream has send credit.
    ///
    /// Returns immediately if credit is already available. Otherwise the
    /// caller is parked until a peer update raises a limit; the woken
    /// caller re-checks and may park again if a concurrent reservation beat
    /// it to the credit.
    ///
    /// Returns [`Error::Cancelled`] if [`close()`] is called before credit
    /// becomes available.
    ///
    /// [`close()`]: FlowControl::close
    pub fn wait_for_credit(&self, stream_id: u64) -> Result<()> {
        self.wait_until_available(stream_id, None)
    }

    /// Like [`wait_for_credit()`], but additionally aborts with
    /// [`Error::Cancelled`] when `cancel` fires.
    ///
    /// [`wait_for_credit()`]: FlowControl::wait_for_credit
    pub fn wait_for_credit_cancellable(
        &self, stream_id: u64, cancel: &CancelToken,
    ) -> Result<()> {
        self.wait_until_available(stream_id, Some(cancel))
    }

    /// Processes a MAX_DATA frame value from the peer.
    ///
    /// Frames may arrive out of order, so a value that does not increase
    /// the connection limit is silently discarded.
    pub fn on_max_data(&self, max_data: u64) {
        let mut ledger = self.lock();

        if max_data > ledger.max_data_allowed {
            ledger.max_data_allowed = max_data;

            drop(ledger);
            self.shared.credit_raised.notify_all();
        }
    }

    /// Processes a MAX_STREAM_DATA frame value from the peer.
    ///
    /// Frames may arrive out of order, so a value that does not increase
    /// the stream's limit is silently discarded.
    pub fn on_max_stream_data(
        &self, stream_id: u64, max_stream_data: u64,
    ) -> Result<()> {
        let mut ledger = self.lock();

        let stream = self.stream_credit(&mut ledger, stream_id)?;

        if max_stream_data > stream.allowed {
            stream.allowed = max_stream_data;

            drop(ledger);
            self.shared.credit_raised.notify_all();
        }

        Ok(())
    }

    /// Replaces the remembered initial limits with the peer's authoritative
    /// transport parameters.
    ///
    /// A client that sent 0-RTT data under values remembered from a
    /// previous session calls this once the server's handshake parameters
    /// are known. Limits that grew are adopted (for the connection, and for
    /// every existing stream of the matching class); the server must not
    /// shrink previously communicated limits, so a smaller value is logged
    /// and ignored.
    ///
    /// Returns [`Error::InternalError`] when called on a server.
    pub fn apply_peer_transport_params(
        &self, peer_params: &TransportParams,
    ) -> Result<()> {
        if self.role == Role::Server {
            return Err(Error::InternalError);
        }

        self.log_initial_updates(peer_params);

        let mut raised = false;

        let mut ledger = self.lock();

        if peer_params.initial_max_data > self.initial_max_data &&
            peer_params.initial_max_data > ledger.max_data_allowed
        {
            ledger.max_data_allowed = peer_params.initial_max_data;
            raised = true;
        }

        // The peer's bidi_local parameter covers streams the peer itself
        // opened, which are remotely-initiated here. The role was checked
        // above, so the classifications below are from a client's vantage.
        if peer_params.initial_max_stream_data_bidi_local >
            self.initial_max_stream_data_bidi_local
        {
            raised |= ledger.raise_allowed(
                peer_params.initial_max_stream_data_bidi_local,
                |id| stream_id::is_bidi(id) && !stream_id::is_local(id, false),
            );
        }

        if peer_params.initial_max_stream_data_bidi_remote >
            self.initial_max_stream_data_bidi_remote
        {
            raised |= ledger.raise_allowed(
                peer_params.initial_max_stream_data_bidi_remote,
                |id| stream_id::is_bidi(id) && stream_id::is_local(id, false),
            );
        }

        if peer_params.initial_max_stream_data_uni >
            self.initial_max_stream_data_uni
        {
            raised |= ledger.raise_allowed(
                peer_params.initial_max_stream_data_uni,
                |id| !stream_id::is_bidi(id) && stream_id::is_local(id, false),
            );
        }

        drop(ledger);

        if raised {
            self.shared.credit_raised.notify_all();
        }

        Ok(())
    }

    /// Shuts the controller down, releasing all parked senders.
    ///
    /// Pending and future [`wait_for_credit()`] calls fail with
    /// [`Error::Cancelled`]. Accounting operations remain callable; the
    /// connection owns teardown ordering.
    ///
    /// [`wait_for_credit()`]: FlowControl::wait_for_credit
    pub fn close(&self) {
        let mut ledger = self.lock();
        ledger.closed = true;

        drop(ledger);
        self.shared.credit_raised.notify_all();
    }

    /// Creates a cancellation handle for use with
    /// [`wait_for_credit_cancellable()`].
    ///
    /// [`wait_for_credit_cancellable()`]: FlowControl::wait_for_credit_cancellable
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            shared: Arc::clone(&self.shared),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn wait_until_available(
        &self, stream_id: u64, cancel: Option<&CancelToken>,
    ) -> Result<()> {
        // Advisory only: this snapshot is taken outside the critical
        // section below and may race with a peer update, but logging from
        // inside the guarded region would be worse.
        if log_enabled!(log::Level::Trace) && self.available(stream_id)? == 0 {
            trace!(
                "{} stream {} blocked by flow control",
                self.trace_id,
                stream_id
            );
        }

        let mut was_blocked = false;

        let mut ledger = self.lock();

        loop {
            if ledger.closed || cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled);
            }

            if self.available_credit(&mut ledger, stream_id)? > 0 {
                break;
            }

            was_blocked = true;
            ledger = self.shared.credit_raised.wait(ledger).unwrap();
        }

        drop(ledger);

        if was_blocked {
            trace!(
                "{} stream {} not blocked anymore",
                self.trace_id,
                stream_id
            );
        }

        Ok(())
    }

    /// Selects the initial send limit for a stream from the stored
    /// transport parameter values.
    ///
    /// The stream-data parameters are named from the vantage of the peer
    /// that advertised them, so a locally-initiated bidirectional stream
    /// falls under `bidi_remote` and a remotely-initiated one under
    /// `bidi_local`.
    fn initial_max_stream_data(&self, stream_id: u64) -> Result<u64> {
        let is_server = self.role.is_server();

        if !stream_id::is_bidi(stream_id) {
            // The peer cannot receive on its own unidirectional streams,
            // so a remotely-initiated one has no send limit to pick.
            if !stream_id::is_local(stream_id, is_server) {
                return Err(Error::InternalError);
            }

            return Ok(self.initial_max_stream_data_uni);
        }

        if stream_id::is_local(stream_id, is_server) {
            Ok(self.initial_max_stream_data_bidi_remote)
        } else {
            Ok(self.initial_max_stream_data_bidi_local)
        }
    }

    /// Returns the stream's ledger entry, creating it with the initial
    /// limit for its class if the stream has not been seen before.
    fn stream_credit<'a>(
        &self, ledger: &'a mut Ledger, stream_id: u64,
    ) -> Result<&'a mut StreamCredit> {
        match ledger.streams.entry(stream_id) {
            hash_map::Entry::Vacant(v) => {
                let allowed = self.initial_max_stream_data(stream_id)?;

                Ok(v.insert(StreamCredit {
                    allowed,
                    assigned: 0,
                }))
            },

            hash_map::Entry::Occupied(v) => Ok(v.into_mut()),
        }
    }

    fn available_credit(
        &self, ledger: &mut Ledger, stream_id: u64,
    ) -> Result<u64> {
        let conn_available = ledger.conn_available();
        let stream = self.stream_credit(ledger, stream_id)?;

        Ok(cmp::min(stream.allowed - stream.assigned, conn_available))
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.shared.ledger.lock().unwrap()
    }

    fn log_initial_updates(&self, peer_params: &TransportParams) {
        let updates = [
            (
                "initial_max_data",
                self.initial_max_data,
                peer_params.initial_max_data,
            ),
            (
                "initial_max_stream_data_bidi_local",
                self.initial_max_stream_data_bidi_local,
                peer_params.initial_max_stream_data_bidi_local,
            ),
            (
                "initial_max_stream_data_bidi_remote",
                self.initial_max_stream_data_bidi_remote,
                peer_params.initial_max_stream_data_bidi_remote,
            ),
            (
                "initial_max_stream_data_uni",
                self.initial_max_stream_data_uni,
                peer_params.initial_max_stream_data_uni,
            ),
        ];

        for (name, old, new) in updates {
            if new > old {
                info!("{} raising {} from {} to {}", self.trace_id, name, old, new);
            } else if new < old {
                error!(
                    "{} ignoring attempt to reduce {} from {} to {}",
                    self.trace_id, name, old, new
                );
            }
        }
    }

    /// Asserts the ledger's accounting invariants.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let ledger = self.lock();

        assert!(ledger.max_data_assigned <= ledger.max_data_allowed);
        assert!(ledger.max_data_allowed <= crate::MAX_VAR_INT);

        let mut total = 0;

        for stream in ledger.streams.values() {
            assert!(stream.assigned <= stream.allowed);
            assert!(stream.allowed <= crate::MAX_VAR_INT);

            total += stream.assigned;
        }

        assert_eq!(total, ledger.max_data_assigned);
    }
}

/// A handle that aborts a pending
/// [`wait_for_credit_cancellable()`](FlowControl::wait_for_credit_cancellable)
/// call.
///
/// Tokens are created with
/// [`cancel_token()`](FlowControl::cancel_token) and can be cloned and
/// fired from any thread. A fired token stays cancelled.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fires the cancellation signal, waking any waiter observing this
    /// token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        // Take the ledger lock before signalling, so the store cannot slip
        // between a waiter's predicate check and its wait.
        drop(self.shared.ledger.lock().unwrap());
        self.shared.credit_raised.notify_all();
    }

    /// Returns true once [`cancel()`](CancelToken::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
