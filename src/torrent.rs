use std::net::SocketAddr;

use rand::{distributions::Alphanumeric, Rng};

use crate::{metainfo::Metainfo, piece::PieceTask};

const PEER_ID_PREFIX: &[u8; 8] = b"-PW0100-";

/// Client prefix followed by random alphanumerics, so the id stays printable.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    for (slot, byte) in peer_id[8..]
        .iter_mut()
        .zip(rand::thread_rng().sample_iter(&Alphanumeric))
    {
        *slot = byte;
    }
    peer_id
}

/// Everything a download needs, fixed before the first worker starts.
#[derive(Debug, Clone)]
pub struct TorrentJob {
    pub name: String,
    pub peer_id: [u8; 20],
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: u32,
    pub length: usize,
    pub peers: Vec<SocketAddr>,
}

impl TorrentJob {
    pub fn from_metainfo(
        metainfo: &Metainfo,
        peer_id: [u8; 20],
        peers: Vec<SocketAddr>,
    ) -> anyhow::Result<Self> {
        let length = metainfo
            .info
            .length
            .ok_or_else(|| anyhow::anyhow!("multi-file torrents are not supported"))?;

        let job = Self {
            name: metainfo.info.name.clone(),
            peer_id,
            info_hash: metainfo.info_hash,
            piece_hashes: metainfo.info.pieces.clone(),
            piece_length: metainfo.info.piece_length,
            length,
            peers,
        };
        job.validate().map_err(|e| anyhow::anyhow!(e))?;

        Ok(job)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` of a piece within the file.
    pub fn piece_bounds(&self, index: u32) -> (usize, usize) {
        let begin = index as usize * self.piece_length as usize;
        let end = (begin + self.piece_length as usize).min(self.length);
        (begin, end)
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        let (begin, end) = self.piece_bounds(index);
        (end - begin) as u32
    }

    pub fn tasks(&self) -> impl Iterator<Item = PieceTask> + '_ {
        self.piece_hashes
            .iter()
            .enumerate()
            .map(move |(index, hash)| {
                PieceTask::new(index as u32, *hash, self.piece_size(index as u32))
            })
    }

    /// Checks that the hash list covers the file exactly.
    pub fn validate(&self) -> Result<(), String> {
        if self.piece_length == 0 {
            return Err("piece length must be greater than zero".to_string());
        }

        let expected = (self.length + self.piece_length as usize - 1) / self.piece_length as usize;
        if expected != self.piece_count() {
            return Err(format!(
                "{} bytes at {} bytes per piece needs {} hashes, got {}",
                self.length,
                self.piece_length,
                expected,
                self.piece_count()
            ));
        }

        Ok(())
    }
}
