use std::sync::Arc;

use async_channel::{Receiver, Sender};

use crate::{
    config::DownloadConfig,
    error::DownloadError,
    piece::PieceTask,
    torrent::TorrentJob,
    worker::{PeerWorker, PieceOutcome},
};

/// Hands pieces out to one worker per peer and stitches verified results
/// into the output buffer. Only the scheduler writes to that buffer.
pub struct PieceScheduler {
    job: Arc<TorrentJob>,
    config: Arc<DownloadConfig>,
}

impl PieceScheduler {
    pub fn new(job: TorrentJob, config: DownloadConfig) -> Self {
        Self {
            job: Arc::new(job),
            config: Arc::new(config),
        }
    }

    /// Builds the task queue with one task per piece, in index order.
    ///
    /// The queue holds exactly as many slots as there are pieces. A task is
    /// either queued or held by a single worker, so requeueing never waits on
    /// a full queue.
    pub fn seed_tasks(&self) -> (Sender<PieceTask>, Receiver<PieceTask>) {
        let (task_tx, task_rx) = async_channel::bounded(self.job.piece_count().max(1));
        for task in self.job.tasks() {
            let queued = task_tx.try_send(task).is_ok();
            debug_assert!(queued, "task queue sized to the piece count");
        }
        (task_tx, task_rx)
    }

    pub async fn run(&self) -> Result<Vec<u8>, DownloadError> {
        self.job.validate().map_err(DownloadError::InvalidJob)?;
        self.config.validate().map_err(DownloadError::InvalidJob)?;

        let total = self.job.piece_count();
        let mut buf = vec![0; self.job.length];
        if total == 0 {
            return Ok(buf);
        }

        let (task_tx, task_rx) = self.seed_tasks();
        let (result_tx, result_rx) = async_channel::unbounded();

        info!(
            "downloading {} ({} pieces) from {} peers",
            self.job.name,
            total,
            self.job.peers.len()
        );
        let workers: Vec<_> = self
            .job
            .peers
            .iter()
            .map(|address| {
                PeerWorker::new(
                    *address,
                    self.job.clone(),
                    self.config.clone(),
                    (task_tx.clone(), task_rx.clone()),
                    result_tx.clone(),
                )
                .spawn()
            })
            .collect();
        // Once the last worker exits the result queue closes and `recv` fails.
        drop(result_tx);

        let mut done = vec![false; total];
        let mut completed = 0;
        let outcome = loop {
            if completed == total {
                break Ok(());
            }

            match result_rx.recv().await {
                Ok(PieceOutcome::Verified(piece)) => {
                    let index = piece.index as usize;
                    if index >= total || done[index] {
                        warn!("discarding unexpected result for piece {}", piece.index);
                        continue;
                    }

                    let (begin, end) = self.job.piece_bounds(piece.index);
                    if piece.data.len() != end - begin {
                        warn!(
                            "discarding piece {} with {} bytes, expected {}",
                            piece.index,
                            piece.data.len(),
                            end - begin
                        );
                        continue;
                    }
                    buf[begin..end].copy_from_slice(&piece.data);
                    done[index] = true;
                    completed += 1;

                    let percent = completed as f64 / total as f64 * 100.0;
                    info!(
                        "downloaded piece {} ({}/{}, {:.2}%)",
                        piece.index, completed, total, percent
                    );
                }
                Ok(PieceOutcome::Unobtainable(task)) => {
                    break Err(DownloadError::Unobtainable {
                        index: task.index,
                        failures: task.failures,
                    });
                }
                Err(_) => {
                    break Err(DownloadError::Stalled { completed, total });
                }
            }
        };

        task_tx.close();
        result_rx.close();
        for worker in workers {
            worker.abort();
        }

        outcome.map(|_| buf)
    }
}
