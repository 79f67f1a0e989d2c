use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use bitvec::prelude::*;
use serde::{
    de::{Error, Visitor},
    Deserializer,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{
    error::PeerError,
    message::{read_message, write_message, Bitfield, Handshake, Message, PROTOCOL},
};

/// Size of one entry in a tracker's compact peer list.
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    /// Splits a compact peer list into addresses.
    /// A trailing partial entry makes the whole list invalid.
    pub fn from_compact(bytes: &[u8]) -> Option<Vec<PeerAddress>> {
        if bytes.len() % COMPACT_PEER_LEN != 0 {
            return None;
        }

        Some(
            bytes
                .chunks_exact(COMPACT_PEER_LEN)
                .map(|chunk| PeerAddress {
                    ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                    port: u16::from_be_bytes([chunk[4], chunk[5]]),
                })
                .collect(),
        )
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(peer: PeerAddress) -> Self {
        SocketAddr::V4(SocketAddrV4::new(peer.ip, peer.port))
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

pub fn deserialize_peers<'de, D>(deserializer: D) -> Result<Vec<PeerAddress>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> Visitor<'de> for PeerVisitor {
        type Value = Vec<PeerAddress>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("compact peer list")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            PeerAddress::from_compact(v)
                .ok_or_else(|| E::custom("compact peer list length is not a multiple of 6"))
        }
    }

    deserializer.deserialize_bytes(PeerVisitor)
}

/// One handshaked connection to a remote peer.
///
/// The capability bitfield and choke flag belong to this session only; they
/// are never shared with other workers.
pub struct PeerSession<S = TcpStream> {
    pub address: SocketAddr,
    pub remote_id: [u8; 20],
    conn: S,
    bitfield: Bitfield,
    choked: bool,
}

impl PeerSession<TcpStream> {
    /// Opens a TCP connection and completes the handshake, both under `deadline`.
    pub async fn connect(
        address: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        deadline: Duration,
    ) -> Result<Self, PeerError> {
        let attempt = async {
            let conn = TcpStream::connect(address).await?;
            PeerSession::handshake(conn, address, info_hash, peer_id).await
        };

        match timeout(deadline, attempt).await {
            Ok(res) => res,
            Err(_) => Err(PeerError::Timeout("connect")),
        }
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn handshake(
        mut conn: S,
        address: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<Self, PeerError> {
        conn.write_all(&Handshake::new(info_hash, peer_id).encode())
            .await?;
        conn.flush().await?;

        let reply = Handshake::read_from(&mut conn).await?;
        if reply.protocol != PROTOCOL {
            return Err(PeerError::InvalidHandshake(format!(
                "unsupported protocol {:?}",
                String::from_utf8_lossy(&reply.protocol)
            )));
        }
        if reply.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        Ok(Self {
            address,
            remote_id: reply.peer_id,
            conn,
            bitfield: BitVec::new(),
            choked: true,
        })
    }

    /// Waits for the peer's bitfield, which has to be its first message.
    ///
    /// The bitfield is cut or padded to `piece_count` bits, which also caps
    /// every later `have` index.
    pub async fn receive_bitfield(
        &mut self,
        deadline: Duration,
        piece_count: usize,
    ) -> Result<(), PeerError> {
        let wait = async {
            loop {
                match self.read_message().await {
                    Ok(Message::KeepAlive) => continue,
                    Ok(Message::Bitfield(bits)) => return Ok(bits),
                    Ok(other) => {
                        return Err(PeerError::UnexpectedMessage {
                            expected: "bitfield",
                            got: other.to_string(),
                        })
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let mut bits = match timeout(deadline, wait).await {
            Ok(res) => res?,
            Err(_) => return Err(PeerError::Timeout("bitfield")),
        };
        bits.resize(piece_count, false);
        self.bitfield = bits;

        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        let message = read_message(&mut self.conn).await?;
        debug!("{} > Receive: {}", self.address, message);
        Ok(message)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        debug!("{} > Send: {}", self.address, message);
        write_message(&mut self.conn, message).await
    }

    pub async fn send_request(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), PeerError> {
        self.send_message(&Message::Request(index, begin, length))
            .await
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield
            .get(index as usize)
            .as_deref()
            .copied()
            .unwrap_or(false)
    }

    /// Records a `have` announcement. Indices past the torrent's last piece
    /// are ignored and reported as `false`.
    pub fn set_piece(&mut self, index: u32) -> bool {
        match self.bitfield.get_mut(index as usize) {
            Some(mut bit) => {
                *bit = true;
                true
            }
            None => false,
        }
    }
}
