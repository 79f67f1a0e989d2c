use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};

use crate::{config::DownloadConfig, error::PeerError, message::Message, peer::PeerSession};

/// A piece waiting to be downloaded. Tasks are never edited in place; a
/// failed attempt puts a copy back on the queue with its failure count bumped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceTask {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: u32,
    pub failures: u32,
}

impl PieceTask {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> Self {
        Self {
            index,
            hash,
            length,
            failures: 0,
        }
    }

    pub fn failed(&self) -> Self {
        Self {
            failures: self.failures + 1,
            ..self.clone()
        }
    }
}

/// A verified piece on its way to the scheduler.
#[derive(Debug)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockError {
    WrongIndex { expected: u32, got: u32 },
    OutOfBounds { begin: u32, len: usize, length: u32 },
    Unrequested { begin: u32, len: usize },
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockError::WrongIndex { expected, got } => {
                write!(f, "block for piece {} while assembling {}", got, expected)
            }
            BlockError::OutOfBounds { begin, len, length } => write!(
                f,
                "block [{}, +{}) overruns piece of {} bytes",
                begin, len, length
            ),
            BlockError::Unrequested { begin, len } => {
                write!(f, "block [{}, +{}) was never requested", begin, len)
            }
        }
    }
}

/// Request and receive bookkeeping for one piece attempt.
#[derive(Debug)]
pub struct PieceAssembly {
    index: u32,
    length: u32,
    data: Vec<u8>,
    requested: u32,
    received: u32,
    pending: Vec<(u32, u32)>,
}

impl PieceAssembly {
    pub fn new(task: &PieceTask) -> Self {
        Self {
            index: task.index,
            length: task.length,
            data: vec![0; task.length as usize],
            requested: 0,
            received: 0,
            pending: vec![],
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.length
    }

    /// Reserves the next block to request, if the pipeline has room and
    /// bytes are left unrequested.
    pub fn next_request(&mut self, block_size: u32, depth: usize) -> Option<(u32, u32)> {
        if self.pending.len() >= depth || self.requested >= self.length {
            return None;
        }

        let begin = self.requested;
        let len = block_size.min(self.length - begin);
        self.requested += len;
        self.pending.push((begin, len));

        Some((begin, len))
    }

    /// Copies a delivered block into the buffer. The block must belong to
    /// this piece, fit inside it and answer an outstanding request; otherwise
    /// the buffer is left untouched.
    pub fn accept_block(&mut self, index: u32, begin: u32, block: &[u8]) -> Result<(), BlockError> {
        if index != self.index {
            return Err(BlockError::WrongIndex {
                expected: self.index,
                got: index,
            });
        }

        let start = begin as usize;
        let end = start.checked_add(block.len());
        match end {
            Some(end) if end <= self.data.len() => {}
            _ => {
                return Err(BlockError::OutOfBounds {
                    begin,
                    len: block.len(),
                    length: self.length,
                })
            }
        }

        let slot = self
            .pending
            .iter()
            .position(|&(b, l)| b == begin && l as usize == block.len())
            .ok_or(BlockError::Unrequested {
                begin,
                len: block.len(),
            })?;
        self.pending.swap_remove(slot);

        self.data[start..start + block.len()].copy_from_slice(block);
        self.received += block.len() as u32;

        Ok(())
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

pub fn verify_piece(data: &[u8], hash: &[u8; 20]) -> bool {
    Sha1::digest(data)[..] == hash[..]
}

/// Runs one pipelined download attempt for `task` over `session`, bounded by
/// the configured piece deadline. The returned bytes are not yet verified.
pub async fn download_piece<S>(
    session: &mut PeerSession<S>,
    task: &PieceTask,
    config: &DownloadConfig,
) -> Result<Vec<u8>, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(config.piece_timeout, assemble(session, task, config)).await {
        Ok(res) => res,
        Err(_) => Err(PeerError::Timeout("piece download")),
    }
}

async fn assemble<S>(
    session: &mut PeerSession<S>,
    task: &PieceTask,
    config: &DownloadConfig,
) -> Result<Vec<u8>, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut assembly = PieceAssembly::new(task);

    while !assembly.is_complete() {
        if !session.is_choked() {
            while let Some((begin, len)) =
                assembly.next_request(config.block_size, config.pipeline_depth)
            {
                session.send_request(task.index, begin, len).await?;
            }
        }

        match session.read_message().await? {
            Message::Choke => session.set_choked(true),
            Message::Unchoke => session.set_choked(false),
            Message::Have(index) => {
                if !session.set_piece(index) {
                    warn!("{} > ignoring have for unknown piece {}", session.address, index);
                }
            }
            Message::Piece(index, begin, block) => {
                if let Err(e) = assembly.accept_block(index, begin, &block) {
                    warn!("{} > rejected block: {}", session.address, e);
                }
            }
            _ => {}
        }
    }

    debug!(
        "{} > assembled piece {} ({} bytes)",
        session.address,
        task.index,
        assembly.received()
    );

    Ok(assembly.into_data())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{read_message, write_message, Handshake};
    use bitvec::prelude::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    fn task(length: u32) -> PieceTask {
        PieceTask::new(0, [0; 20], length)
    }

    /// Drains every request a piece needs, delivering each block straight away.
    fn request_all(length: u32, block_size: u32) -> Vec<(u32, u32)> {
        let mut assembly = PieceAssembly::new(&task(length));
        let mut issued = vec![];
        while let Some((begin, len)) = assembly.next_request(block_size, 1) {
            issued.push((begin, len));
            assembly
                .accept_block(0, begin, &vec![0; len as usize])
                .unwrap();
        }
        assert!(assembly.is_complete());
        issued
    }

    #[test]
    fn block_count_is_ceiling_of_length_over_block_size() {
        for &(length, block_size) in &[(10, 5), (10, 4), (1, 4), (15000, 15000), (40001, 15000)] {
            let issued = request_all(length, block_size);
            let expected = (length + block_size - 1) / block_size;
            assert_eq!(issued.len() as u32, expected);

            let last = issued.last().unwrap().1;
            if length % block_size == 0 {
                assert_eq!(last, block_size);
            } else {
                assert_eq!(last, length - (length / block_size) * block_size);
            }
        }
    }

    #[test]
    fn pipeline_depth_bounds_in_flight_requests() {
        let mut assembly = PieceAssembly::new(&task(100));
        let mut issued = 0;
        while assembly.next_request(4, 5).is_some() {
            issued += 1;
        }
        assert_eq!(issued, 5);
        assert_eq!(assembly.in_flight(), 5);

        assembly.accept_block(0, 8, &[1; 4]).unwrap();
        assert_eq!(assembly.in_flight(), 4);
        assert_eq!(assembly.next_request(4, 5), Some((20, 4)));
        assert!(assembly.next_request(4, 5).is_none());
    }

    #[test]
    fn blocks_land_at_their_offset() {
        let mut assembly = PieceAssembly::new(&task(10));
        assert_eq!(assembly.next_request(5, 5), Some((0, 5)));
        assert_eq!(assembly.next_request(5, 5), Some((5, 5)));

        assembly.accept_block(0, 5, b"fghij").unwrap();
        assert!(!assembly.is_complete());
        assembly.accept_block(0, 0, b"abcde").unwrap();
        assert!(assembly.is_complete());
        assert_eq!(assembly.into_data(), b"abcdefghij".to_vec());
    }

    #[test]
    fn overrunning_block_leaves_buffer_untouched() {
        let mut assembly = PieceAssembly::new(&task(10));
        while assembly.next_request(5, 5).is_some() {}

        assert_eq!(
            assembly.accept_block(0, 8, &[1; 5]),
            Err(BlockError::OutOfBounds {
                begin: 8,
                len: 5,
                length: 10
            })
        );
        assert!(assembly
            .accept_block(0, u32::MAX, &[1; 5])
            .is_err());
        assert_eq!(assembly.received(), 0);
        assert_eq!(assembly.in_flight(), 2);
        assert_eq!(assembly.into_data(), vec![0; 10]);
    }

    #[test]
    fn misaligned_or_foreign_blocks_are_rejected() {
        let mut assembly = PieceAssembly::new(&task(10));
        while assembly.next_request(5, 5).is_some() {}

        assert_eq!(
            assembly.accept_block(0, 4, &[1; 5]),
            Err(BlockError::Unrequested { begin: 4, len: 5 })
        );
        assert_eq!(
            assembly.accept_block(3, 0, &[1; 5]),
            Err(BlockError::WrongIndex {
                expected: 0,
                got: 3
            })
        );
        assert_eq!(assembly.received(), 0);
        assert_eq!(assembly.into_data(), vec![0; 10]);
    }

    #[test]
    fn duplicate_block_is_counted_once() {
        let mut assembly = PieceAssembly::new(&task(10));
        while assembly.next_request(5, 5).is_some() {}

        assembly.accept_block(0, 0, &[1; 5]).unwrap();
        assert!(assembly.accept_block(0, 0, &[2; 5]).is_err());
        assert_eq!(assembly.received(), 5);
    }

    #[test]
    fn verifies_sha1() {
        let data = b"hello world";
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(data));

        assert!(verify_piece(data, &hash));
        assert!(!verify_piece(b"hello worle", &hash));
    }

    #[tokio::test]
    async fn requests_wait_for_unchoke() {
        let info_hash = [7; 20];
        let (local, mut remote) = duplex(64 * 1024);
        remote
            .write_all(&Handshake::new(info_hash, [2; 20]).encode())
            .await
            .unwrap();
        let mut session = PeerSession::handshake(
            local,
            "127.0.0.1:6881".parse().unwrap(),
            info_hash,
            [1; 20],
        )
        .await
        .unwrap();
        Handshake::read_from(&mut remote).await.unwrap();

        write_message(
            &mut remote,
            &Message::Bitfield(bitvec![u8, Msb0; 1, 0, 0, 0, 0, 0, 0, 0]),
        )
        .await
        .unwrap();
        session
            .receive_bitfield(Duration::from_secs(1), 3)
            .await
            .unwrap();
        assert!(!session.has_piece(2));

        let data = b"abcdefgh".to_vec();
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(&data));
        let task = PieceTask::new(0, hash, 8);
        let config = DownloadConfig {
            block_size: 4,
            pipeline_depth: 1,
            piece_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let downloading = tokio::spawn(async move {
            let res = download_piece(&mut session, &task, &config).await;
            (session, res)
        });

        let early =
            tokio::time::timeout(Duration::from_millis(100), read_message(&mut remote)).await;
        assert!(early.is_err(), "request sent while choked");

        write_message(&mut remote, &Message::Unchoke).await.unwrap();
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(0, 0, 4)
        );
        write_message(&mut remote, &Message::Have(2)).await.unwrap();
        write_message(&mut remote, &Message::Piece(0, 0, data[..4].to_vec()))
            .await
            .unwrap();
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(0, 4, 4)
        );
        write_message(&mut remote, &Message::Piece(0, 4, data[4..].to_vec()))
            .await
            .unwrap();

        let (session, res) = downloading.await.unwrap();
        let piece = res.unwrap();
        assert!(verify_piece(&piece, &hash));
        assert!(!session.is_choked());
        assert!(session.has_piece(2));
    }

    #[test]
    fn failed_task_keeps_its_identity() {
        let task = PieceTask::new(3, [9; 20], 77);
        let retry = task.failed().failed();

        assert_eq!(retry.index, 3);
        assert_eq!(retry.hash, [9; 20]);
        assert_eq!(retry.length, 77);
        assert_eq!(retry.failures, 2);
    }
}
