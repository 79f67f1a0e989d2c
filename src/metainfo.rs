use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use serde::{
    de::{Error, Visitor},
    Deserialize, Deserializer,
};
use sha1::{Digest, Sha1};

#[derive(Debug, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    #[serde(deserialize_with = "deserialize_pieces")]
    pub pieces: Vec<[u8; 20]>,
    pub length: Option<usize>,
    pub files: Option<Vec<File>>,
}

fn deserialize_pieces<'de, D>(deserializer: D) -> Result<Vec<[u8; 20]>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PieceVisitor;

    impl<'de> Visitor<'de> for PieceVisitor {
        type Value = Vec<[u8; 20]>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("concatenated 20-byte piece hashes")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            if v.len() % 20 != 0 {
                return Err(E::custom(format!(
                    "pieces length {} is not a multiple of 20",
                    v.len()
                )));
            }

            Ok(v
                .chunks_exact(20)
                .map(|chunk| {
                    let mut piece = [0; 20];
                    piece.copy_from_slice(chunk);
                    piece
                })
                .collect())
        }
    }

    deserializer.deserialize_bytes(PieceVisitor)
}

#[derive(Debug, Deserialize)]
pub struct File {
    pub length: usize,
    pub path: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
    #[serde(skip)]
    pub info_hash: [u8; 20],
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut metainfo: Self =
            serde_bencode::from_bytes(buf).context("failed to decode torrent descriptor")?;

        if metainfo.info.files.is_some() {
            return Err(anyhow!("multi-file torrents are not supported"));
        }
        if metainfo.info.length.is_none() {
            return Err(anyhow!("torrent descriptor has no length"));
        }

        metainfo.info_hash = create_info_hash(buf)?;

        Ok(metainfo)
    }
}

/// SHA-1 of the bencoded `info` dictionary, re-encoded from the raw descriptor
/// so keys this client does not model still count.
fn create_info_hash(buf: &[u8]) -> Result<[u8; 20]> {
    let root: HashMap<String, serde_bencode::value::Value> = serde_bencode::from_bytes(buf)?;
    let info = root
        .get("info")
        .ok_or_else(|| anyhow!("torrent descriptor has no info dictionary"))?;
    let info_bencoded = serde_bencode::to_bytes(info)?;

    let mut info_hash = [0; 20];
    info_hash.copy_from_slice(&Sha1::digest(&info_bencoded));

    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(info: &str) -> Vec<u8> {
        format!("d8:announce23:http://tracker/announce4:info{}e", info).into_bytes()
    }

    #[test]
    fn parses_single_file_descriptor() {
        let info = format!(
            "d6:lengthi25e4:name4:file12:piece lengthi10e6:pieces60:{}e",
            "a".repeat(20) + &"b".repeat(20) + &"c".repeat(20)
        );
        let buf = descriptor(&info);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        assert_eq!(metainfo.announce, "http://tracker/announce");
        assert_eq!(metainfo.info.name, "file");
        assert_eq!(metainfo.info.length, Some(25));
        assert_eq!(metainfo.info.piece_length, 10);
        assert_eq!(metainfo.info.pieces, vec![[b'a'; 20], [b'b'; 20], [b'c'; 20]]);

        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(info.as_bytes()));
        assert_eq!(metainfo.info_hash, expected);
    }

    #[test]
    fn rejects_truncated_piece_hashes() {
        let info = format!(
            "d6:lengthi25e4:name4:file12:piece lengthi10e6:pieces19:{}e",
            "a".repeat(19)
        );
        assert!(Metainfo::from_bytes(&descriptor(&info)).is_err());
    }

    #[test]
    fn rejects_multi_file_descriptor() {
        let info = format!(
            "d5:filesld6:lengthi5e4:pathl1:aeee4:name3:dir12:piece lengthi10e6:pieces20:{}e",
            "a".repeat(20)
        );
        assert!(Metainfo::from_bytes(&descriptor(&info)).is_err());
    }
}
