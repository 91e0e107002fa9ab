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

//! Flow control transport parameters as per RFC 9000 Section 18.2.

use crate::MAX_VAR_INT;

/// The flow-control limits carried in QUIC transport parameters.
///
/// These are the initial values for the connection-level and per-stream
/// send limits. For a sender they come from the parameters advertised by
/// the peer, or, for a client sending 0-RTT data, from the values
/// remembered from a previous session.
///
/// The stream-data parameters are named from the vantage of the endpoint
/// that advertised them: `bidi_local` governs bidirectional streams opened
/// by the advertising endpoint, `bidi_remote` governs bidirectional streams
/// opened by the endpoint that received the parameter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportParams {
    /// The initial flow control maximum data for the connection.
    pub initial_max_data: u64,

    /// The initial flow control maximum data for local bidirectional
    /// streams.
    pub initial_max_stream_data_bidi_local: u64,

    /// The initial flow control maximum data for remote bidirectional
    /// streams.
    pub initial_max_stream_data_bidi_remote: u64,

    /// The initial flow control maximum data for unidirectional streams.
    pub initial_max_stream_data_uni: u64,
}

impl TransportParams {
    /// Returns true if every limit fits in a QUIC variable-length integer.
    pub fn is_valid(&self) -> bool {
        self.initial_max_data <= MAX_VAR_INT &&
            self.initial_max_stream_data_bidi_local <= MAX_VAR_INT &&
            self.initial_max_stream_data_bidi_remote <= MAX_VAR_INT &&
            self.initial_max_stream_data_uni <= MAX_VAR_INT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_limits() {
        let mut params = TransportParams {
            initial_max_data: MAX_VAR_INT,
            ..Default::default()
        };

        assert!(params.is_valid());

        params.initial_max_stream_data_uni = MAX_VAR_INT + 1;
        assert!(!params.is_valid());
    }
}
