//! Durable outbound queues, one JSON-lines file per stream.
//!
//! `sync/<stream>.jsonl` holds pending items in FIFO order and
//! `sync/<stream>.deadletter.jsonl` collects items that will never be
//! retried. Enqueue appends a line; a flush delivers due items, then
//! rewrites the queue file atomically while keeping anything that was
//! enqueued in the meantime.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tutorhost_domain::{
    is_retryable_status, DeadLetterRecord, FlushSummary, QueueItem, RuntimeError,
};

use crate::config::SyncConfig;

/// Milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Sends one payload to a stream endpoint.
///
/// Failures must be [`RuntimeError::QueueDelivery`] or
/// [`RuntimeError::Network`] so the queue can classify them.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, endpoint: &str, payload: &Value) -> Result<(), RuntimeError>;
}

/// `POST`s the payload as JSON.
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    client: Client,
}

impl HttpDelivery {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn deliver(&self, endpoint: &str, payload: &Value) -> Result<(), RuntimeError> {
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                debug!(%endpoint, %err, "delivery request failed");
                RuntimeError::QueueDelivery {
                    status: None,
                    retryable: true,
                }
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(RuntimeError::QueueDelivery {
            status: Some(status.as_u16()),
            retryable: is_retryable_status(status.as_u16()),
        })
    }
}

pub struct SyncQueue {
    dir: PathBuf,
    settings: SyncConfig,
    delivery: Arc<dyn Delivery>,
    clock: Arc<dyn Clock>,
    files: Mutex<()>,
    flushes: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncQueue {
    pub fn new(
        dir: impl Into<PathBuf>,
        settings: SyncConfig,
        delivery: Arc<dyn Delivery>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir: dir.into(),
            settings,
            delivery,
            clock,
            files: Mutex::new(()),
            flushes: std::sync::Mutex::default(),
        }
    }

    #[must_use]
    pub fn queue_path(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("{stream}.jsonl"))
    }

    #[must_use]
    pub fn dead_letter_path(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("{stream}.deadletter.jsonl"))
    }

    /// Append a new item to `stream`.
    ///
    /// # Errors
    /// [`RuntimeError::Validation`] for a bad stream name, [`RuntimeError::Io`]
    /// when the queue file cannot be written.
    pub async fn enqueue(&self, stream: &str, payload: Value) -> Result<QueueItem, RuntimeError> {
        validate_stream(stream)?;
        let now = self.clock.now_ms();
        let item = QueueItem::new(new_item_id(now), payload, now);
        let path = self.queue_path(stream);
        let line = vec![item.clone()];
        let _guard = self.files.lock().await;
        blocking(move || append_lines(&path, &line)).await?;
        debug!(%stream, id = %item.id, "enqueued");
        Ok(item)
    }

    /// Items currently waiting in `stream`, in delivery order.
    ///
    /// # Errors
    /// [`RuntimeError::Validation`] for a bad stream name, [`RuntimeError::Io`]
    /// when the queue file exists but cannot be read.
    pub async fn pending(&self, stream: &str) -> Result<Vec<QueueItem>, RuntimeError> {
        validate_stream(stream)?;
        let path = self.queue_path(stream);
        let _guard = self.files.lock().await;
        blocking(move || read_lines(&path)).await
    }

    /// Items `stream` gave up on.
    ///
    /// # Errors
    /// Same as [`SyncQueue::pending`].
    pub async fn dead_letters(&self, stream: &str) -> Result<Vec<DeadLetterRecord>, RuntimeError> {
        validate_stream(stream)?;
        let path = self.dead_letter_path(stream);
        let _guard = self.files.lock().await;
        blocking(move || read_lines(&path)).await
    }

    /// Deliver every due item of `stream` to `endpoint`, in order.
    ///
    /// Items that are not due yet stay in place without holding back later
    /// due items. Failed items are retried with exponential backoff until
    /// `max_retries` attempts have failed or the failure is terminal, then
    /// dead-lettered.
    ///
    /// # Errors
    /// Delivery failures are never errors. Only a bad stream name or an
    /// unreadable/unwritable queue file fails the flush.
    pub async fn flush(
        &self,
        stream: &str,
        endpoint: &str,
        max_retries: u32,
    ) -> Result<FlushSummary, RuntimeError> {
        validate_stream(stream)?;
        let stream_lock = self.flush_lock(stream);
        let _flush = stream_lock.lock().await;
        let path = self.queue_path(stream);
        let snapshot: Vec<QueueItem> = {
            let path = path.clone();
            let _guard = self.files.lock().await;
            blocking(move || read_lines(&path)).await?
        };
        let snapshot_ids: HashSet<String> = snapshot.iter().map(|item| item.id.clone()).collect();

        let mut summary = FlushSummary::default();
        let mut kept = Vec::with_capacity(snapshot.len());
        let mut dead = Vec::new();
        for mut item in snapshot {
            let now = self.clock.now_ms();
            if !item.is_due(now) {
                debug!(%stream, id = %item.id, next_attempt_at = item.next_attempt_at, "not due yet");
                summary.deferred += 1;
                kept.push(item);
                continue;
            }
            let err = match self.delivery.deliver(endpoint, &item.payload).await {
                Ok(()) => {
                    debug!(%stream, id = %item.id, "delivered");
                    summary.sent += 1;
                    continue;
                }
                Err(err) => err,
            };

            item.retries += 1;
            item.last_error_status = failure_status(&err);
            let now = self.clock.now_ms();
            if !err.is_retryable() {
                debug!(%stream, id = %item.id, %err, "terminal delivery failure");
                dead.push(dead_letter(item, format!("{err} is not retryable"), now));
            } else if item.retries >= max_retries {
                debug!(%stream, id = %item.id, %err, retries = item.retries, "retry budget spent");
                let reason = format!("{err} after {} attempts", item.retries);
                dead.push(dead_letter(item, reason, now));
            } else {
                let delay = self.backoff(item.retries);
                item.next_attempt_at = now.saturating_add(millis(delay));
                debug!(
                    %stream,
                    id = %item.id,
                    %err,
                    retries = item.retries,
                    delay_ms = millis(delay),
                    "delivery failed; will retry"
                );
                kept.push(item);
            }
        }

        summary.dead_lettered = dead.len();
        let dead_path = self.dead_letter_path(stream);
        let _guard = self.files.lock().await;
        summary.remaining = blocking(move || {
            let arrived = read_lines::<QueueItem>(&path)?
                .into_iter()
                .filter(|item| !snapshot_ids.contains(&item.id));
            kept.extend(arrived);
            if !dead.is_empty() {
                append_lines(&dead_path, &dead)?;
            }
            rewrite_lines(&path, &kept)?;
            Ok(kept.len())
        })
        .await?;

        info!(
            %stream,
            sent = summary.sent,
            remaining = summary.remaining,
            deferred = summary.deferred,
            dead_lettered = summary.dead_lettered,
            "flushed sync queue"
        );
        Ok(summary)
    }

    /// Flushes of one stream run one at a time; other streams are unaffected.
    fn flush_lock(&self, stream: &str) -> Arc<Mutex<()>> {
        let mut locks = self.flushes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(stream.to_string()).or_default())
    }

    /// `min(base * 2^(retries-1), ceiling)` plus up to `jitter_ms` of jitter.
    fn backoff(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(32);
        let scaled = self
            .settings
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.settings.max_delay_ms);
        let jitter = if self.settings.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.settings.jitter_ms)
        };
        Duration::from_millis(scaled.saturating_add(jitter))
    }
}

/// Run queue file work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, RuntimeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RuntimeError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| RuntimeError::Io {
            context: "queue file task".to_string(),
            message: err.to_string(),
        })?
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn failure_status(err: &RuntimeError) -> Option<u16> {
    match err {
        RuntimeError::QueueDelivery { status, .. } | RuntimeError::Network { status, .. } => {
            *status
        }
        _ => None,
    }
}

fn dead_letter(item: QueueItem, reason: String, now: u64) -> DeadLetterRecord {
    warn!(id = %item.id, %reason, "dead-lettering sync item");
    DeadLetterRecord {
        item,
        reason,
        dead_lettered_at: now,
    }
}

fn new_item_id(now: u64) -> String {
    format!("{now:012x}-{:08x}", rand::random::<u32>())
}

fn validate_stream(stream: &str) -> Result<(), RuntimeError> {
    let valid = !stream.is_empty()
        && stream
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::Validation(format!(
            "stream name `{stream}` may only contain letters, digits, `-` and `_`"
        )))
    }
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, RuntimeError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(RuntimeError::io(format!("reading {}", path.display()), &err)),
    };
    let mut items = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(err) => {
                warn!(path = %path.display(), line = number + 1, %err, "skipping unreadable queue line");
            }
        }
    }
    Ok(items)
}

fn encode<T: serde::Serialize>(items: &[T]) -> Result<String, RuntimeError> {
    let mut out = String::new();
    for item in items {
        let line = serde_json::to_string(item).map_err(|err| RuntimeError::Io {
            context: "serializing queue item".to_string(),
            message: err.to_string(),
        })?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn ensure_parent(path: &Path) -> Result<&Path, RuntimeError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|err| RuntimeError::io(format!("creating {}", parent.display()), &err))?;
    Ok(parent)
}

fn append_lines<T: serde::Serialize>(path: &Path, items: &[T]) -> Result<(), RuntimeError> {
    ensure_parent(path)?;
    let contents = encode(items)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            file.write_all(contents.as_bytes())?;
            file.sync_data()
        })
        .map_err(|err| RuntimeError::io(format!("appending to {}", path.display()), &err))
}

fn rewrite_lines<T: serde::Serialize>(path: &Path, items: &[T]) -> Result<(), RuntimeError> {
    let parent = ensure_parent(path)?;
    let contents = encode(items)?;
    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| RuntimeError::io("creating temporary queue file", &err))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| RuntimeError::io("writing temporary queue file", &err))?;
    tmp.persist(path)
        .map_err(|err| RuntimeError::io(format!("replacing {}", path.display()), &err.error))?;
    Ok(())
}
