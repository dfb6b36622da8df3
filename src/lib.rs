// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! MQTT-SN for UDP-class sensor networks: wire codec, client and gateway.
//!
//! The heart of the crate is the per-peer message state service
//! ([`MessageStateService`]): it owns the inflight tables in both directions,
//! assigns and recycles 16-bit packet identifiers, enforces QoS 0/1/2 delivery
//! semantics, schedules per-peer queue flushes and releases callers waiting on
//! a confirmation token. The codec, transport, topic registry, message queue,
//! payload registry and security service are collaborators behind narrow
//! seams.

#![doc(
    html_logo_url = "https://github.com/maidsafe/QA/raw/master/Images/maidsafe_logo.png",
    html_favicon_url = "https://maidsafe.net/img/favicon.ico",
    test(attr(deny(warnings)))
)]
// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    clippy::unicode_not_nfc,
    clippy::unwrap_used
)]

#[macro_use]
extern crate tracing;

pub mod client;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod messaging;
pub mod peers;
pub mod queue;
pub mod registry;
pub mod security;
pub mod state;
pub mod topics;
pub mod transport;

pub use self::{
    config::{Config, Mode},
    errors::{Error, Result},
    messaging::{Message, ProtocolVersion, QoS, ReturnCode, TopicRef},
    peers::Peer,
    state::{Event, MessageStateService, WaitToken},
};

/// Standard channel size for the application event stream.
pub(crate) const EVENT_CHANNEL_SIZE: usize = 100;
