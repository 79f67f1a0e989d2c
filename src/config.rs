use std::time::Duration;

/// Largest block requested in a single `request` message.
pub const BLOCK_SIZE: u32 = 15000;

/// Maximum number of requested-but-undelivered blocks per piece attempt.
pub const PIPELINE_DEPTH: usize = 5;

/// Tuning knobs shared by the scheduler and every peer worker.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub block_size: u32,
    pub pipeline_depth: usize,
    /// Covers both the TCP connect and the handshake exchange.
    pub connect_timeout: Duration,
    pub bitfield_timeout: Duration,
    /// Upper bound for one whole piece attempt, all pipelined blocks included.
    pub piece_timeout: Duration,
    /// Failed attempts tolerated per piece before it is reported unobtainable.
    /// `None` lets a piece be requeued forever.
    pub max_piece_failures: Option<u32>,
    /// Pause taken by a worker after its peer turned out to lack every queued piece.
    pub idle_backoff: Duration,
    /// Fruitless passes over the queue a worker makes before it disconnects.
    /// `None` keeps an idle peer connected until the download ends.
    pub max_idle_sweeps: Option<u32>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            pipeline_depth: PIPELINE_DEPTH,
            connect_timeout: Duration::from_secs(3),
            bitfield_timeout: Duration::from_secs(5),
            piece_timeout: Duration::from_secs(15),
            max_piece_failures: Some(8),
            idle_backoff: Duration::from_millis(100),
            max_idle_sweeps: Some(50),
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 {
            return Err("block size must be greater than zero".to_string());
        }
        if self.pipeline_depth == 0 {
            return Err("pipeline depth must be greater than zero".to_string());
        }
        Ok(())
    }
}
