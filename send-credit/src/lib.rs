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

//! Send-side QUIC flow-control credit tracking.
//!
//! This crate implements the sender half of the flow control scheme defined
//! in [RFC 9000 Section 4]: it tracks the connection-level and per-stream
//! data limits imposed by the peer, hands out send credit to concurrent
//! stream producers, and parks producers until the peer raises a limit when
//! no credit is available.
//!
//! The entry point is the [`FlowControl`] ledger, shared between all stream
//! senders and the connection's receive path:
//!
//! ```
//! use send_credit::FlowControl;
//! use send_credit::Role;
//! use send_credit::TransportParams;
//!
//! let params = TransportParams {
//!     initial_max_data: 1_000_000,
//!     initial_max_stream_data_bidi_local: 65_536,
//!     initial_max_stream_data_bidi_remote: 65_536,
//!     initial_max_stream_data_uni: 65_536,
//! };
//!
//! let flow = FlowControl::new(Role::Client, &params, String::from("client"))?;
//!
//! // Stream 0 is a client-initiated bidirectional stream, so it starts
//! // out with `initial_max_stream_data_bidi_remote` bytes of credit.
//! let granted = flow.reserve(0, 16_384)?;
//! assert_eq!(granted, 16_384);
//!
//! // The receive path raises limits as MAX_DATA / MAX_STREAM_DATA frames
//! // arrive, waking any parked senders.
//! flow.on_max_data(2_000_000);
//! flow.on_max_stream_data(0, 131_072)?;
//! # Ok::<(), send_credit::Error>(())
//! ```
//!
//! A sender that is granted zero bytes has run out of credit and can block
//! on [`FlowControl::wait_for_credit()`], which returns once a peer update
//! makes the stream's credit non-zero again. Note that running out of
//! credit at this layer does not by itself warrant a DATA_BLOCKED or
//! STREAM_DATA_BLOCKED frame, as a sender may just as well be stalled by
//! congestion control; emitting those frames is the sender's decision.
//!
//! [RFC 9000 Section 4]: https://www.rfc-editor.org/rfc/rfc9000.html#section-4

#![warn(missing_docs)]
#![warn(unused_qualifications)]

#[macro_use]
extern crate log;

/// The largest value that fits in a QUIC variable-length integer.
///
/// All offsets and limits handled by this crate are bounded by this value,
/// as per [RFC 9000 Section 16](https://www.rfc-editor.org/rfc/rfc9000.html#section-16).
pub const MAX_VAR_INT: u64 = (1 << 62) - 1;

/// Whether the local endpoint acts as a QUIC client or server.
///
/// The role is fixed for the lifetime of a connection. It determines how
/// stream ids are classified, and which endpoint is allowed to replace
/// remembered transport parameters once the handshake completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The endpoint that initiated the connection.
    Client,

    /// The endpoint that accepted the connection.
    Server,
}

impl Role {
    /// Returns true when the endpoint acts as a server.
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server)
    }
}

pub use crate::error::Error;
pub use crate::error::Result;

pub use crate::flowcontrol::CancelToken;
pub use crate::flowcontrol::FlowControl;

pub use crate::transport_params::TransportParams;

mod error;
mod flowcontrol;
mod stream_id;
mod transport_params;
