//! Peer wire framing.
//!
//! Ordinary messages are `<u32 length><u8 id><payload>` with a zero length
//! meaning keep-alive. The handshake has its own fixed layout:
//!
//! ```text
//! <u8 pstrlen><pstr><8 reserved><20 info hash><20 peer id>
//! ```

use bitvec::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PeerError;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Frames above this size are refused before anything is allocated for them.
pub const MAX_FRAME_LEN: u32 = 1 << 22;

pub type Bitfield = BitVec<u8, Msb0>;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    /// Any id this client does not speak; carried so it can be skipped.
    Unknown(u8, Vec<u8>),
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(..) => Some(6),
            Message::Piece(..) => Some(7),
            Message::Cancel(..) => Some(8),
            Message::Unknown(id, _) => Some(*id),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "KeepAlive"),
            Message::Choke => write!(f, "Choke"),
            Message::Unchoke => write!(f, "Unchoke"),
            Message::Interested => write!(f, "Interested"),
            Message::NotInterested => write!(f, "NotInterested"),
            Message::Have(index) => write!(f, "Have({})", index),
            Message::Bitfield(bits) => write!(f, "Bitfield([{}])", bits.len()),
            Message::Request(index, begin, length) => {
                write!(f, "Request({}, {}, {})", index, begin, length)
            }
            Message::Piece(index, begin, data) => {
                write!(f, "Piece({}, {}, [{}])", index, begin, data.len())
            }
            Message::Cancel(index, begin, length) => {
                write!(f, "Cancel({}, {}, {})", index, begin, length)
            }
            Message::Unknown(id, payload) => write!(f, "Unknown({}, [{}])", id, payload.len()),
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

fn expect_len(name: &str, payload: &[u8], len: usize) -> Result<(), PeerError> {
    if payload.len() != len {
        return Err(PeerError::MalformedMessage(format!(
            "{} payload must be {} bytes, got {}",
            name,
            len,
            payload.len()
        )));
    }
    Ok(())
}

/// Parses a frame body, i.e. everything after the length prefix.
impl TryFrom<&[u8]> for Message {
    type Error = PeerError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let payload = &bytes[1..];
        match bytes[0] {
            0 => expect_len("choke", payload, 0).map(|_| Message::Choke),
            1 => expect_len("unchoke", payload, 0).map(|_| Message::Unchoke),
            2 => expect_len("interested", payload, 0).map(|_| Message::Interested),
            3 => expect_len("not interested", payload, 0).map(|_| Message::NotInterested),
            4 => {
                expect_len("have", payload, 4)?;
                Ok(Message::Have(be_u32(payload)))
            }
            5 => Ok(Message::Bitfield(BitVec::from_vec(payload.to_vec()))),
            6 => {
                expect_len("request", payload, 12)?;
                Ok(Message::Request(
                    be_u32(&payload[0..4]),
                    be_u32(&payload[4..8]),
                    be_u32(&payload[8..12]),
                ))
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::MalformedMessage(format!(
                        "piece payload must be at least 8 bytes, got {}",
                        payload.len()
                    )));
                }
                Ok(Message::Piece(
                    be_u32(&payload[0..4]),
                    be_u32(&payload[4..8]),
                    payload[8..].to_vec(),
                ))
            }
            8 => {
                expect_len("cancel", payload, 12)?;
                Ok(Message::Cancel(
                    be_u32(&payload[0..4]),
                    be_u32(&payload[4..8]),
                    be_u32(&payload[8..12]),
                ))
            }
            id => Ok(Message::Unknown(id, payload.to_vec())),
        }
    }
}

/// Serializes a message including its length prefix.
impl From<&Message> for Vec<u8> {
    fn from(message: &Message) -> Self {
        let mut payload: Vec<u8> = vec![];
        match message {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => payload.extend(&index.to_be_bytes()),
            Message::Bitfield(bits) => payload.extend(bits.as_raw_slice()),
            Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
                payload.extend(&index.to_be_bytes());
                payload.extend(&begin.to_be_bytes());
                payload.extend(&length.to_be_bytes());
            }
            Message::Piece(index, begin, data) => {
                payload.extend(&index.to_be_bytes());
                payload.extend(&begin.to_be_bytes());
                payload.extend(data);
            }
            Message::Unknown(_, data) => payload.extend(data),
        }

        let mut frame = Vec::with_capacity(5 + payload.len());
        match message.id() {
            Some(id) => {
                frame.extend(&(1 + payload.len() as u32).to_be_bytes());
                frame.push(id);
                frame.extend(payload);
            }
            None => frame.extend(&0u32.to_be_bytes()),
        }
        frame
    }
}

impl From<Message> for Vec<u8> {
    fn from(message: Message) -> Self {
        Vec::from(&message)
    }
}

pub async fn read_message<R>(reader: &mut R) -> Result<Message, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut len_prefix = [0; 4];
    reader.read_exact(&mut len_prefix).await?;

    let length = u32::from_be_bytes(len_prefix);
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    if length > MAX_FRAME_LEN {
        return Err(PeerError::FrameTooLarge(length));
    }

    let mut body = vec![0; length as usize];
    reader.read_exact(&mut body).await?;

    Message::try_from(body.as_slice())
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    let frame: Vec<u8> = message.into();
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: Vec<u8>,
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol: PROTOCOL.to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + self.protocol.len());
        buf.push(self.protocol.len() as u8);
        buf.extend(&self.protocol);
        buf.extend(&self.reserved);
        buf.extend(&self.info_hash);
        buf.extend(&self.peer_id);
        buf
    }

    /// Decodes a complete handshake, length byte included.
    pub fn decode(buf: &[u8]) -> Result<Self, PeerError> {
        let pstrlen = match buf.first() {
            Some(0) | None => {
                return Err(PeerError::InvalidHandshake(
                    "protocol name length cannot be 0".to_string(),
                ))
            }
            Some(len) => *len as usize,
        };
        if buf.len() != 1 + pstrlen + 48 {
            return Err(PeerError::InvalidHandshake(format!(
                "expected {} bytes, got {}",
                1 + pstrlen + 48,
                buf.len()
            )));
        }

        let body = &buf[1..];
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&body[pstrlen..pstrlen + 8]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&body[pstrlen + 8..pstrlen + 28]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&body[pstrlen + 28..pstrlen + 48]);

        Ok(Self {
            protocol: body[..pstrlen].to_vec(),
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, PeerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len = [0; 1];
        reader.read_exact(&mut len).await?;
        if len[0] == 0 {
            return Err(PeerError::InvalidHandshake(
                "protocol name length cannot be 0".to_string(),
            ));
        }

        let mut buf = vec![0; 1 + len[0] as usize + 48];
        buf[0] = len[0];
        reader.read_exact(&mut buf[1..]).await?;

        Self::decode(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    fn decode_frame(frame: &[u8]) -> Result<Message, PeerError> {
        let length = be_u32(&frame[..4]) as usize;
        assert_eq!(length, frame.len() - 4);
        Message::try_from(&frame[4..])
    }

    #[test]
    fn messages_survive_encoding() {
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Bitfield(bitvec![u8, Msb0; 1, 0, 1, 1, 0, 0, 0, 0]),
            Message::Request(1, 15000, 15000),
            Message::Piece(3, 5, vec![9, 8, 7]),
            Message::Cancel(1, 0, 15000),
        ];

        for message in messages {
            let frame: Vec<u8> = (&message).into();
            assert_eq!(decode_frame(&frame).unwrap(), message);
        }
    }

    #[test]
    fn frames_have_expected_layout() {
        let frame: Vec<u8> = Message::Have(7).into();
        assert_eq!(frame, vec![0, 0, 0, 5, 4, 0, 0, 0, 7]);

        let frame: Vec<u8> = Message::KeepAlive.into();
        assert_eq!(frame, vec![0, 0, 0, 0]);

        let frame: Vec<u8> = Message::Request(1, 2, 3).into();
        assert_eq!(frame.len(), 17);
        assert_eq!(&frame[..5], &[0, 0, 0, 13, 6]);
    }

    #[test]
    fn rejects_inconsistent_fixed_fields() {
        assert!(matches!(
            Message::try_from(&[4u8, 0, 0, 1][..]),
            Err(PeerError::MalformedMessage(_))
        ));
        assert!(Message::try_from(&[4u8, 0, 0, 0, 1, 0][..]).is_err());
        assert!(Message::try_from(&[0u8, 1][..]).is_err());
        assert!(Message::try_from(&[6u8, 0, 0, 0, 1, 0, 0, 0, 2][..]).is_err());
        assert!(Message::try_from(&[7u8, 0, 0, 0, 1, 0, 0][..]).is_err());
        assert!(Message::try_from(&[8u8; 12][..]).is_err());
    }

    #[test]
    fn empty_piece_payload_is_allowed() {
        let message = Message::try_from(&[7u8, 0, 0, 0, 1, 0, 0, 0, 2][..]).unwrap();
        assert_eq!(message, Message::Piece(1, 2, vec![]));
    }

    #[test]
    fn unknown_ids_are_carried() {
        let message = Message::try_from(&[20u8, 1, 2][..]).unwrap();
        assert_eq!(message, Message::Unknown(20, vec![1, 2]));
    }

    #[tokio::test]
    async fn reads_frames_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_message(&mut server, &Message::KeepAlive).await.unwrap();
        write_message(&mut server, &Message::Piece(0, 5, vec![1; 5]))
            .await
            .unwrap();

        assert_eq!(read_message(&mut client).await.unwrap(), Message::KeepAlive);
        assert_eq!(
            read_message(&mut client).await.unwrap(),
            Message::Piece(0, 5, vec![1; 5])
        );
    }

    #[tokio::test]
    async fn refuses_oversized_frames() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            read_message(&mut client).await,
            Err(PeerError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn handshake_layout() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let buf = handshake.encode();

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL);
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[1; 20]);
        assert_eq!(&buf[48..68], &[2; 20]);
        assert_eq!(Handshake::decode(&buf).unwrap(), handshake);
    }

    #[test]
    fn handshake_with_other_protocol_name_length() {
        let handshake = Handshake {
            protocol: b"abc".to_vec(),
            reserved: [0; 8],
            info_hash: [3; 20],
            peer_id: [4; 20],
        };
        let buf = handshake.encode();

        assert_eq!(buf.len(), 52);
        assert_eq!(Handshake::decode(&buf).unwrap(), handshake);
    }

    #[test]
    fn handshake_rejects_bad_length() {
        assert!(Handshake::decode(&[0; 68]).is_err());
        assert!(Handshake::decode(&Handshake::new([0; 20], [0; 20]).encode()[..60]).is_err());
    }

    #[tokio::test]
    async fn handshake_reads_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let handshake = Handshake::new([5; 20], [6; 20]);
        server.write_all(&handshake.encode()).await.unwrap();

        assert_eq!(Handshake::read_from(&mut client).await.unwrap(), handshake);
    }
}
