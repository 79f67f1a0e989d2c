#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod scheduler;
pub mod torrent;
pub mod tracker;
pub mod worker;
pub mod writer;

pub use config::DownloadConfig;
pub use error::{DownloadError, PeerError};
pub use scheduler::PieceScheduler;
pub use torrent::TorrentJob;
