// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The unreliable datagram seam the state service writes through.

use crate::errors::Result;

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

/// Largest datagram we expect on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// A datagram writer. Sends are fire-and-forget at this seam; delivery
/// tracking lives in the state service above it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one frame to the network.
    async fn write(&self, addr: SocketAddr, data: Bytes) -> Result<()>;
}

/// UDP datagram transport.
#[derive(Clone, Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a socket for this endpoint.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the datagram receive loop, forwarding raw frames upward.
    ///
    /// The loop ends when the receiver side of `frames` goes away.
    pub fn spawn_receiver(&self, frames: Sender<(SocketAddr, Bytes)>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        let frame = Bytes::copy_from_slice(&buf[..len]);
                        if frames.send((addr, frame)).await.is_err() {
                            trace!("Frame receiver dropped, ending datagram loop");
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("Datagram receive error: {error}");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn write(&self, addr: SocketAddr, data: Bytes) -> Result<()> {
        let sent = self.socket.send_to(&data, addr).await?;
        if sent != data.len() {
            warn!(
                "Short datagram write to {}: {} of {} octets",
                addr,
                sent,
                data.len()
            );
        }
        Ok(())
    }
}
