use std::{net::SocketAddr, time::Duration};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::{
    metainfo::Metainfo,
    peer::{deserialize_peers, PeerAddress},
};

/// Port announced to the tracker. Nothing listens on it since this client never seeds.
pub const PEER_PORT: u16 = 6881;

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

#[derive(Debug, Serialize)]
pub struct Params {
    #[serde(skip)]
    pub info_hash: [u8; 20],
    pub peer_id: String,
    pub port: u16,
    pub uploaded: usize,
    pub downloaded: usize,
    pub left: usize,
    pub event: Option<Event>,
    pub compact: i32,
}

#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    pub interval: Option<u64>,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    pub peers: Vec<PeerAddress>,
}

#[derive(Debug)]
pub enum Error {
    QueryError(String),
    HTTPError(String),
    BencodeError(serde_bencode::Error),
    URLEncodeError(serde_urlencoded::ser::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::QueryError(reason) => write!(f, "tracker refused announce: {}", reason),
            Error::HTTPError(e) => write!(f, "http: {}", e),
            Error::BencodeError(e) => write!(f, "bencode: {}", e),
            Error::URLEncodeError(e) => write!(f, "url encode: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::HTTPError(e.to_string())
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::BencodeError(e)
    }
}

impl From<serde_urlencoded::ser::Error> for Error {
    fn from(e: serde_urlencoded::ser::Error) -> Self {
        Error::URLEncodeError(e)
    }
}

const FRAGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'~')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

fn announce_url(url: &str, param: &Params) -> Result<String, Error> {
    let query = serde_urlencoded::to_string(param)?;
    let info_hash = percent_encode(&param.info_hash, FRAGMENT);
    let separator = if url.contains('?') { '&' } else { '?' };

    Ok(format!(
        "{}{}info_hash={}&{}",
        url, separator, info_hash, query
    ))
}

fn parse_response(buf: &[u8]) -> Result<Response, Error> {
    let response = serde_bencode::from_bytes::<Response>(buf)?;
    if let Some(reason) = &response.failure_reason {
        return Err(Error::QueryError(reason.clone()));
    }
    Ok(response)
}

pub async fn announce(url: &str, param: &Params) -> Result<Response, Error> {
    let tracker_url = announce_url(url, param)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let body = client.get(&tracker_url).send().await?.bytes().await?;

    parse_response(&body)
}

/// Asks the descriptor's tracker for peers. Any failure is logged and yields
/// an empty list.
pub async fn discover_peers(metainfo: &Metainfo, peer_id: &[u8; 20]) -> Vec<SocketAddr> {
    let param = Params {
        info_hash: metainfo.info_hash,
        peer_id: String::from_utf8_lossy(peer_id).into_owned(),
        port: PEER_PORT,
        uploaded: 0,
        downloaded: 0,
        left: metainfo.info.length.unwrap_or(0),
        event: Some(Event::Started),
        compact: 1,
    };

    match announce(&metainfo.announce, &param).await {
        Ok(response) => {
            info!(
                "tracker returned {} peers (interval {:?})",
                response.peers.len(),
                response.interval
            );
            response.peers.into_iter().map(SocketAddr::from).collect()
        }
        Err(e) => {
            error!("announce to {} failed: {}", metainfo.announce, e);
            vec![]
        }
    }
}
