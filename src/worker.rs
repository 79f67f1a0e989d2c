use std::{net::SocketAddr, sync::Arc};

use async_channel::{Receiver, Sender};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};

use crate::{
    config::DownloadConfig,
    error::PeerError,
    message::Message,
    peer::PeerSession,
    piece::{download_piece, verify_piece, PieceResult, PieceTask},
    torrent::TorrentJob,
};

/// What a worker reports back to the scheduler.
#[derive(Debug)]
pub enum PieceOutcome {
    Verified(PieceResult),
    /// The task ran out of attempts.
    Unobtainable(PieceTask),
}

/// Drives one peer connection for as long as it stays useful.
pub struct PeerWorker {
    address: SocketAddr,
    job: Arc<TorrentJob>,
    config: Arc<DownloadConfig>,
    task_tx: Sender<PieceTask>,
    task_rx: Receiver<PieceTask>,
    result_tx: Sender<PieceOutcome>,
}

impl PeerWorker {
    pub fn new(
        address: SocketAddr,
        job: Arc<TorrentJob>,
        config: Arc<DownloadConfig>,
        tasks: (Sender<PieceTask>, Receiver<PieceTask>),
        result_tx: Sender<PieceOutcome>,
    ) -> Self {
        Self {
            address,
            job,
            config,
            task_tx: tasks.0,
            task_rx: tasks.1,
            result_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    pub async fn run(self) {
        debug!("{} > connecting", self.address);
        let mut session = match PeerSession::connect(
            self.address,
            self.job.info_hash,
            self.job.peer_id,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!("{} > connection: {}", self.address, e);
                return;
            }
        };
        info!("{} > handshake complete", self.address);

        match self.serve(&mut session).await {
            Ok(()) => debug!("{} > worker done", self.address),
            Err(e) => warn!("{} > dropping peer: {}", self.address, e),
        }
    }

    /// Works through the task queue over an already handshaked session.
    ///
    /// Returns `Ok` once the queue closes or the peer keeps lacking every
    /// queued piece. Any `Err` means the connection is unusable; a task held
    /// at that moment has already been requeued.
    pub async fn serve<S>(&self, session: &mut PeerSession<S>) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        session.send_message(&Message::Interested).await?;
        session
            .receive_bitfield(self.config.bitfield_timeout, self.job.piece_count())
            .await?;

        let mut misses = 0;
        let mut sweeps = 0;
        while let Ok(task) = self.task_rx.recv().await {
            if !session.has_piece(task.index) {
                if !self.requeue(task).await {
                    break;
                }

                // Every queued piece was just offered to a peer that lacks them all.
                misses += 1;
                if misses >= self.job.piece_count() {
                    misses = 0;
                    sweeps += 1;
                    if matches!(self.config.max_idle_sweeps, Some(max) if sweeps >= max) {
                        info!(
                            "{} > peer has none of the remaining pieces",
                            session.address
                        );
                        break;
                    }
                    tokio::time::sleep(self.config.idle_backoff).await;
                } else {
                    tokio::task::yield_now().await;
                }
                continue;
            }
            misses = 0;
            sweeps = 0;

            debug!("{} > downloading piece {}", session.address, task.index);
            let data = match download_piece(session, &task, &self.config).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("{} > piece {}: {}", session.address, task.index, e);
                    self.retry(task).await;
                    return Err(e);
                }
            };

            if !verify_piece(&data, &task.hash) {
                warn!(
                    "{} > piece {} failed integrity check",
                    session.address, task.index
                );
                self.retry(task).await;
                continue;
            }

            let result = PieceResult {
                index: task.index,
                data,
            };
            if self.result_tx.send(PieceOutcome::Verified(result)).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Puts a task back untouched. Returns `false` when the queue is closed.
    async fn requeue(&self, task: PieceTask) -> bool {
        self.task_tx.send(task).await.is_ok()
    }

    /// Requeues a task after a failed attempt, or gives it up once it has
    /// used all its attempts.
    async fn retry(&self, task: PieceTask) {
        let task = task.failed();

        let exhausted = match self.config.max_piece_failures {
            Some(max) => task.failures >= max,
            None => false,
        };
        if exhausted {
            let _ = self.result_tx.send(PieceOutcome::Unobtainable(task)).await;
        } else {
            let _ = self.task_tx.send(task).await;
        }
    }
}
