// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::messaging::{MsgType, ReturnCode};
use std::io;
use thiserror::Error;

/// Specialisation of `std::Result` for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the codec, the state service and its collaborators.
#[allow(clippy::large_enum_variant)]
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A precondition for the send was violated: the send gate denied the
    /// message, or the inflight window stayed saturated.
    #[error("Expectation failed: {0}")]
    ExpectationFailed(String),
    /// The confirmation wait elapsed before a terminal response arrived.
    #[error("Timed out after {0:?} awaiting a response")]
    Timeout(std::time::Duration),
    /// A request failed before its confirmation arrived; the reason is carried
    /// over from the wait token.
    #[error("Request failed before confirmation: {0}")]
    FailedConfirmation(String),
    /// A terminal frame arrived that does not pair with the stored request.
    #[error("Invalid response {response:?} to inflight {request:?}")]
    InvalidResponse {
        /// The message kind of the stored request.
        request: MsgType,
        /// The message kind of the frame that arrived.
        response: MsgType,
    },
    /// A terminal response carried a non-zero return code.
    #[error("Protocol error from peer: {0:?}")]
    Protocol(ReturnCode),
    /// No free packet id is left in the usable range.
    #[error("Packet id range exhausted")]
    IdExhausted,
    /// The per-peer message queue refused the publish.
    #[error("Message queue is full ({0} entries)")]
    QueueFull(usize),
    /// Inbound payload integrity verification failed.
    #[error("Payload integrity check failed")]
    SecurityCheckFailed,
    /// The datagram transport failed to hand the frame to the network.
    #[error("Transport failure: {0}")]
    Transport(#[from] io::Error),
    /// A frame could not be parsed off the wire.
    #[error("Failed to parse frame: {0}")]
    FailedToParse(String),
    /// A message could not be serialised onto the wire.
    #[error("Serialisation error: {0}")]
    Serialisation(String),
    /// A topic reference could not be resolved to a topic path.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}
