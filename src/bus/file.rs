//! Durable broker: one JSON file per message.
//!
//! ```text
//! <root>/.lock
//! <root>/<queue>/<sequence:020>-<message id>.json
//! <root>/<queue>.dead/...
//! ```
//!
//! File names sort in enqueue order. Writes go through a temp file and a
//! rename, so a crash never leaves a half-written message behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs;

use super::broker::dead_letter_queue;
use super::{check_queue_name, Broker, BusError, Delivery, Envelope};

const LOCK_FILE: &str = ".lock";

pub struct FileBroker {
    root: PathBuf,
    sequence: AtomicU64,
    _dir_lock: Arc<std::fs::File>,
}

impl FileBroker {
    /// Open (creating if needed) a broker rooted at `root`.
    pub async fn open(root: PathBuf) -> Result<Self, BusError> {
        fs::create_dir_all(&root).await?;
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| BusError::Locked(root.clone()))?;

        let next = Self::recover(&root).await? + 1;
        tracing::info!(
            "File broker opened at {} (next sequence {})",
            root.display(),
            next
        );
        Ok(Self {
            root,
            sequence: AtomicU64::new(next),
            _dir_lock: Arc::new(lock_file),
        })
    }

    /// Remove temp leftovers and return the highest sequence in use.
    async fn recover(root: &Path) -> Result<u64, BusError> {
        let mut highest = 0;
        let mut queues = fs::read_dir(root).await?;
        while let Some(queue) = queues.next_entry().await? {
            if !queue.file_type().await?.is_dir() {
                continue;
            }
            let mut messages = fs::read_dir(queue.path()).await?;
            while let Some(message) = messages.next_entry().await? {
                let path = message.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    tracing::warn!("Removing leftover temp file {}", path.display());
                    fs::remove_file(&path).await?;
                } else if let Some(seq) = sequence_of(&path) {
                    highest = highest.max(seq);
                }
            }
        }
        Ok(highest)
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(queue)
    }

    /// Message files of `queue` in delivery order.
    async fn messages(&self, queue: &str) -> Result<Vec<PathBuf>, BusError> {
        check_queue_name(queue)?;
        let mut entries = match fs::read_dir(self.queue_dir(queue)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if sequence_of(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), BusError> {
        check_queue_name(&envelope.queue)?;
        let dir = self.queue_dir(&envelope.queue);
        fs::create_dir_all(&dir).await?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("{:020}-{}.json", seq, envelope.id));
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec(envelope)?).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

fn sequence_of(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (seq, _) = stem.split_once('-')?;
    seq.parse().ok()
}

#[async_trait]
impl Broker for FileBroker {
    fn name(&self) -> &str {
        "file"
    }

    async fn enqueue(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.write(envelope).await
    }

    async fn next(&self, queue: &str) -> Result<Option<Delivery>, BusError> {
        for path in self.messages(queue).await? {
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => {
                    return Ok(Some(Delivery {
                        envelope,
                        receipt: path.to_string_lossy().into_owned(),
                    }))
                }
                Err(err) => {
                    // Unreadable messages would block the queue forever
                    tracing::error!("Discarding corrupt message {}: {}", path.display(), err);
                    fs::remove_file(&path).await?;
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        match fs::remove_file(&delivery.receipt).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Acked message {} was already gone", delivery.receipt);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn requeue(&self, delivery: Delivery) -> Result<(), BusError> {
        let mut envelope = delivery.envelope.clone();
        envelope.redeliveries += 1;
        self.write(&envelope).await?;
        self.ack(&delivery).await
    }

    async fn dead_letter(&self, delivery: Delivery) -> Result<(), BusError> {
        let mut envelope = delivery.envelope.clone();
        envelope.queue = dead_letter_queue(&envelope.queue);
        self.write(&envelope).await?;
        self.ack(&delivery).await
    }

    async fn pending(&self, queue: &str) -> Result<usize, BusError> {
        Ok(self.messages(queue).await?.len())
    }
}
