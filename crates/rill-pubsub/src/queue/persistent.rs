//! On-disk dispatch queue: an append-only log of versioned binary records
//! plus an index tracking the head offset. Pending items survive restarts
//! and are replayed in order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rill_core::{Clock, Uri};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{DequeueHandler, DispatchEvent, DispatchItem, DispatchQueue, QueueState, drain};
use crate::error::{PubSubError, Result};

/// Current record format version.
pub const RECORD_VERSION: u8 = 1;

const LOG_FILE: &str = "queue.log";
const INDEX_FILE: &str = "queue.idx";

/// Serialize a dispatch item to its versioned binary record (payload only;
/// the log adds a length frame).
pub fn serialize_item(item: &DispatchItem) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(RECORD_VERSION);
    put_str(&mut buf, &item.destination.to_string());
    put_str(&mut buf, &item.location);
    put_str(&mut buf, &item.event.id);
    put_str(&mut buf, &item.event.channel.to_string());
    match &item.event.resource {
        Some(resource) => {
            buf.push(1);
            put_str(&mut buf, &resource.to_string());
        }
        None => buf.push(0),
    }
    put_uri_list(&mut buf, &item.event.origins);
    put_uri_list(&mut buf, &item.event.recipients);
    put_uri_list(&mut buf, &item.event.via);
    put_str(&mut buf, &item.event.content_type);
    put_bytes(&mut buf, &item.event.body);
    buf
}

/// Decode a record payload; a version mismatch fails fast.
pub fn deserialize_item(payload: &[u8]) -> Result<DispatchItem> {
    let mut reader = RecordReader::new(payload);
    let version = reader.take_u8()?;
    if version != RECORD_VERSION {
        return Err(PubSubError::UnsupportedRecordVersion(version));
    }
    let destination = reader.take_uri()?;
    let location = reader.take_str()?;
    let id = reader.take_str()?;
    let channel = reader.take_uri()?;
    let resource = match reader.take_u8()? {
        0 => None,
        _ => Some(reader.take_uri()?),
    };
    let origins = reader.take_uri_list()?;
    let recipients = reader.take_uri_list()?;
    let via = reader.take_uri_list()?;
    let content_type = reader.take_str()?;
    let body = reader.take_bytes()?;
    reader.expect_end()?;

    Ok(DispatchItem {
        destination,
        location,
        event: DispatchEvent {
            id,
            channel,
            resource,
            origins,
            recipients,
            via,
            content_type,
            body,
        },
    })
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    put_bytes(buf, value.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

fn put_uri_list(buf: &mut Vec<u8>, uris: &[Uri]) {
    buf.extend_from_slice(&(uris.len() as u32).to_le_bytes());
    for uri in uris {
        put_str(buf, &uri.to_string());
    }
}

struct RecordReader<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    fn take_u8(&mut self) -> Result<u8> {
        let byte = self
            .payload
            .get(self.offset)
            .copied()
            .ok_or_else(|| PubSubError::CorruptRecord("unexpected end of record".into()))?;
        self.offset += 1;
        Ok(byte)
    }

    fn take_u32(&mut self) -> Result<u32> {
        let end = self.offset + 4;
        let bytes = self
            .payload
            .get(self.offset..end)
            .ok_or_else(|| PubSubError::CorruptRecord("unexpected end of record".into()))?;
        self.offset = end;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u32()? as usize;
        let end = self.offset + len;
        let bytes = self
            .payload
            .get(self.offset..end)
            .ok_or_else(|| PubSubError::CorruptRecord("truncated field".into()))?;
        self.offset = end;
        Ok(bytes.to_vec())
    }

    fn take_str(&mut self) -> Result<String> {
        String::from_utf8(self.take_bytes()?)
            .map_err(|_| PubSubError::CorruptRecord("non-utf8 field".into()))
    }

    fn take_uri(&mut self) -> Result<Uri> {
        let raw = self.take_str()?;
        Uri::parse(&raw).map_err(|e| PubSubError::CorruptRecord(format!("bad uri '{raw}': {e}")))
    }

    fn take_uri_list(&mut self) -> Result<Vec<Uri>> {
        let count = self.take_u32()? as usize;
        let mut uris = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            uris.push(self.take_uri()?);
        }
        Ok(uris)
    }

    fn expect_end(&self) -> Result<()> {
        if self.offset == self.payload.len() {
            Ok(())
        } else {
            Err(PubSubError::CorruptRecord("trailing bytes in record".into()))
        }
    }
}

/// Durable FIFO backed by `<dir>/queue.log` and `<dir>/queue.idx`.
pub struct PersistentDispatchQueue {
    state: Arc<QueueState>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    log: Mutex<File>,
    dir: PathBuf,
}

impl PersistentDispatchQueue {
    /// Open (or create) the queue directory, replay pending records through
    /// the worker and start draining.
    pub fn start(
        dir: &Path,
        handler: DequeueHandler,
        clock: Arc<dyn Clock>,
        backoff_step: Duration,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE);
        let index_path = dir.join(INDEX_FILE);

        let head = read_index(&index_path)?;
        let pending = read_pending(&log_path, head)?;
        if !pending.is_empty() {
            info!(
                path = %dir.display(),
                pending = pending.len(),
                "resuming persistent dispatch queue"
            );
        }

        let state = QueueState::new();
        for item in pending {
            state.push(item);
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&log_path)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let head_cell = Arc::new(Mutex::new(head));
        let on_success = {
            let head_cell = head_cell.clone();
            let index_path = index_path.clone();
            Box::new(move |item: &DispatchItem| {
                // The codec is deterministic, so the consumed frame length
                // can be recomputed from the item itself.
                let advance = 4 + serialize_item(item).len() as u64;
                let mut head = head_cell.lock().unwrap_or_else(|e| e.into_inner());
                *head += advance;
                if let Err(err) = write_index(&index_path, *head) {
                    tracing::warn!(error = %err, "failed to advance queue index");
                }
            })
        };
        let worker = tokio::spawn(drain(
            state.clone(),
            handler,
            clock,
            backoff_step,
            shutdown_rx,
            on_success,
        ));

        Ok(Arc::new(Self {
            state,
            shutdown,
            worker: Mutex::new(Some(worker)),
            log: Mutex::new(log),
            dir: dir.to_path_buf(),
        }))
    }

    async fn stop_worker(&self) {
        let _ = self.shutdown.send(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[async_trait]
impl DispatchQueue for PersistentDispatchQueue {
    fn enqueue(&self, item: DispatchItem) -> Result<()> {
        let payload = serialize_item(&item);
        {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            log.write_all(&(payload.len() as u32).to_le_bytes())?;
            log.write_all(&payload)?;
            log.flush()?;
        }
        self.state.push(item);
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.len()
    }

    async fn dispose(&self) {
        self.stop_worker().await;
        debug!(path = %self.dir.display(), "queue disposed, state retained");
    }

    async fn delete_and_dispose(&self) {
        self.stop_worker().await;
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!(path = %self.dir.display(), error = %err, "failed to erase queue state");
        }
    }
}

fn read_index(path: &Path) -> Result<u64> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == 8 => {
            Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
        }
        Ok(_) => Err(PubSubError::CorruptRecord("bad index file".into())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn write_index(path: &Path, head: u64) -> Result<()> {
    std::fs::write(path, head.to_le_bytes())?;
    Ok(())
}

fn read_pending(path: &Path, head: u64) -> Result<Vec<DispatchItem>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let len = file.metadata()?.len();
    if head >= len {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(head))?;
    let mut rest = Vec::with_capacity((len - head) as usize);
    file.read_to_end(&mut rest)?;

    let mut items = Vec::new();
    let mut offset = 0usize;
    while offset < rest.len() {
        let frame = rest
            .get(offset..offset + 4)
            .ok_or_else(|| PubSubError::CorruptRecord("truncated frame header".into()))?;
        let payload_len = u32::from_le_bytes(frame.try_into().expect("4 bytes")) as usize;
        offset += 4;
        let payload = rest
            .get(offset..offset + payload_len)
            .ok_or_else(|| PubSubError::CorruptRecord("truncated record".into()))?;
        offset += payload_len;
        items.push(deserialize_item(payload)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use rill_core::SystemClock;

    use super::*;
    use crate::queue::dequeue_handler;

    fn sample_item() -> DispatchItem {
        DispatchItem {
            destination: Uri::parse("http://mock/a").unwrap(),
            location: "set-1".to_string(),
            event: DispatchEvent {
                id: "evt-1".to_string(),
                channel: Uri::parse("channel:///deck/cards/discard").unwrap(),
                resource: Some(Uri::parse("http://deck/cards/5").unwrap()),
                origins: vec![Uri::parse("http://origin/1").unwrap()],
                recipients: vec![
                    Uri::parse("http://users/alice").unwrap(),
                    Uri::parse("http://users/bob").unwrap(),
                ],
                via: vec![Uri::parse("http://hub/pubsub").unwrap()],
                content_type: "application/json".to_string(),
                body: br#"{"card":5}"#.to_vec(),
            },
        }
    }

    #[test]
    fn records_round_trip_losslessly() {
        let item = sample_item();
        let payload = serialize_item(&item);
        let decoded = deserialize_item(&payload).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn record_without_resource_round_trips() {
        let mut item = sample_item();
        item.event.resource = None;
        item.event.recipients.clear();
        let decoded = deserialize_item(&serialize_item(&item)).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn version_mismatch_fails_fast() {
        let mut payload = serialize_item(&sample_item());
        payload[0] = 9;
        assert!(matches!(
            deserialize_item(&payload),
            Err(PubSubError::UnsupportedRecordVersion(9))
        ));
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let payload = serialize_item(&sample_item());
        assert!(matches!(
            deserialize_item(&payload[..payload.len() - 3]),
            Err(PubSubError::CorruptRecord(_))
        ));
    }

    #[tokio::test]
    async fn pending_items_survive_dispose_and_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set-1");

        // First life: the handler refuses everything, so items stay queued.
        let queue = PersistentDispatchQueue::start(
            &path,
            dequeue_handler(|_item| async { false }),
            Arc::new(SystemClock),
            Duration::from_secs(60),
        )
        .unwrap();
        for n in 0..3 {
            let mut item = sample_item();
            item.event.id = format!("evt-{n}");
            queue.enqueue(item).unwrap();
        }
        queue.dispose().await;

        // Second life: everything is accepted and must replay in order.
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let delivered_c = delivered.clone();
        let queue = PersistentDispatchQueue::start(
            &path,
            dequeue_handler(move |item: DispatchItem| {
                let delivered = delivered_c.clone();
                async move {
                    delivered.lock().unwrap().push(item.event.id.clone());
                    true
                }
            }),
            Arc::new(SystemClock),
            Duration::from_millis(1),
        )
        .unwrap();
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        queue.dispose().await;
        assert_eq!(*delivered.lock().unwrap(), vec!["evt-0", "evt-1", "evt-2"]);

        // Third life: nothing left to replay.
        let ran = Arc::new(AtomicBool::new(false));
        let ran_c = ran.clone();
        let queue = PersistentDispatchQueue::start(
            &path,
            dequeue_handler(move |_item| {
                let ran = ran_c.clone();
                async move {
                    ran.store(true, Ordering::SeqCst);
                    true
                }
            }),
            Arc::new(SystemClock),
            Duration::from_millis(1),
        )
        .unwrap();
        assert!(queue.is_empty());
        queue.dispose().await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delete_and_dispose_erases_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set-2");
        let queue = PersistentDispatchQueue::start(
            &path,
            dequeue_handler(|_item| async { false }),
            Arc::new(SystemClock),
            Duration::from_secs(60),
        )
        .unwrap();
        queue.enqueue(sample_item()).unwrap();
        queue.delete_and_dispose().await;
        assert!(!path.exists());
    }
}
