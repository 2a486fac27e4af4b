//! Persistent broadcast-and-replay for a single room.
//!
//! Architecture:
//! ```text
//!            write(bytes)                      send(bytes)
//!                 │                                 │
//!                 ▼                                 │
//!        ┌─────────────────┐                        │
//!        │ PersistentLog   │ ── offset ──┐          │
//!        └────────▲────────┘             ▼          ▼
//!                 │             File{off,len}    Ram[bytes]
//!                 │                  │               │
//!                 │       ┌──────────┴───────┬───────┴──────────┐
//!                 │       ▼                  ▼                  ▼
//!                 │   file/ram lanes     file/ram lanes     file/ram lanes
//!                 │       │                  │                  │
//!                 │   PendingQueue       PendingQueue       PendingQueue
//!                 │       │                  │                  │
//!                 └── read_at ◄── delivery loop (one per subscriber)
//!                         │                  │                  │
//!                         ▼                  ▼                  ▼
//!                     outbound           outbound           outbound
//! ```
//!
//! One writer at a time per room: `write`, `add_subscriber` and `reset`
//! serialize on an async mutex, so announced ranges are always adjacent and
//! a joining subscriber sees history strictly before live traffic.
//!
//! Announcements never block the writer. Intake lanes are bounded and fed
//! with `try_send`. A delivery loop keeps moving announcements into its
//! queue (where adjacent ranges merge) even while it waits on a log read or
//! for outbound room, so a full lane means the loop has stopped making
//! progress altogether and the subscriber is evicted. A consumer that is
//! merely slow is evicted only when one outbound push waits longer than
//! `send_timeout`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TryRecvError, TrySendError},
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::RadioConfig;
use crate::queue::{Chunk, PendingQueue};
use crate::signature::derive_signature;
use crate::storage::{LogError, PersistentLog};

/// Identity of one connected subscriber.
pub type SubscriberId = Uuid;

/// A framed packet as handed to a subscriber's socket.
pub type Packet = Arc<Vec<u8>>;

/// Radio errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Persistent log failure
    Log(LogError),
    /// Radio has been closed
    Closed,
    /// No subscriber registered under this id
    UnknownSubscriber(SubscriberId),
    /// Writer lane did not accept the command in time
    Busy,
}

impl std::fmt::Display for RadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RadioError::Log(e) => write!(f, "Radio log error: {e}"),
            RadioError::Closed => write!(f, "Radio is closed"),
            RadioError::UnknownSubscriber(id) => write!(f, "Unknown subscriber: {id}"),
            RadioError::Busy => write!(f, "Radio writer is busy"),
        }
    }
}

impl std::error::Error for RadioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RadioError::Log(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LogError> for RadioError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Closed => RadioError::Closed,
            e => RadioError::Log(e),
        }
    }
}

/// Statistics for monitoring radio health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadioStats {
    pub writes: u64,
    pub bytes_written: u64,
    pub announcements: u64,
    pub deliveries: u64,
    pub evictions: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters shared with every delivery loop.
#[derive(Default)]
struct AtomicRadioStats {
    writes: AtomicU64,
    bytes_written: AtomicU64,
    announcements: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

/// A chunk announced to one subscriber, tagged with the log generation.
#[derive(Debug)]
struct Announcement {
    generation: u64,
    chunk: Chunk,
}

/// Registry entry for one subscriber.
struct SubscriberSlot {
    /// Distinguishes re-registrations under the same id
    session: u64,
    queue: Arc<Mutex<PendingQueue>>,
    ram_lane: mpsc::Sender<Announcement>,
    file_lane: mpsc::Sender<Announcement>,
}

/// Receiving end handed to a subscriber's socket layer.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    start: u64,
    length: u64,
    outbound: mpsc::Receiver<Packet>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The clamped `(start, length)` history range seeded for this subscriber.
    pub fn catch_up(&self) -> (u64, u64) {
        (self.start, self.length)
    }

    /// Next packet, or `None` once the subscriber has been removed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        self.outbound.try_recv().ok()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<Packet> {
        self.outbound
    }
}

/// Command applied by the per-room writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    /// Record and broadcast
    Write(Vec<u8>),
    /// Broadcast without recording
    Send(Vec<u8>),
    /// Deliver to one subscriber without recording
    SingleSend(Vec<u8>, SubscriberId),
}

/// Cloneable handle feeding the per-room writer task.
#[derive(Debug, Clone)]
pub struct RadioSender {
    tx: mpsc::Sender<RadioCommand>,
    timeout: Duration,
}

impl RadioSender {
    pub async fn write(&self, data: Vec<u8>) -> Result<(), RadioError> {
        self.submit(RadioCommand::Write(data)).await
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<(), RadioError> {
        self.submit(RadioCommand::Send(data)).await
    }

    pub async fn single_send(&self, data: Vec<u8>, id: SubscriberId) -> Result<(), RadioError> {
        self.submit(RadioCommand::SingleSend(data, id)).await
    }

    /// Enqueue a command, waiting at most the configured command timeout.
    pub async fn submit(&self, command: RadioCommand) -> Result<(), RadioError> {
        self.tx
            .send_timeout(command, self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => RadioError::Busy,
                SendTimeoutError::Closed(_) => RadioError::Closed,
            })
    }
}

/// Broadcast radio for one room: a persistent log plus its subscribers.
pub struct BroadcastRadio {
    config: RadioConfig,
    log: Arc<PersistentLog>,
    /// Signature the radio was opened with; names the log file
    storage_key: String,
    subscribers: RwLock<HashMap<SubscriberId, SubscriberSlot>>,
    /// Single in-flight writer
    writer: tokio::sync::Mutex<()>,
    signature: RwLock<String>,
    /// Bumped by every reset; stale file chunks are discarded
    generation: Arc<AtomicU64>,
    next_session: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<AtomicRadioStats>,
}

impl BroadcastRadio {
    /// Open the radio whose log lives at `<data_dir>/<signature>.data`.
    ///
    /// An existing file is reattached, so this is also the recovery path.
    /// Must be called within a Tokio runtime (starts the periodic flusher).
    pub fn open(config: RadioConfig, signature: impl Into<String>) -> Result<Arc<Self>, RadioError> {
        let signature = signature.into();
        std::fs::create_dir_all(&config.data_dir).map_err(LogError::from)?;

        let path = Self::log_path(&config.data_dir, &signature);
        let log = Arc::new(PersistentLog::open(path, config.log.clone())?);
        let flusher = log.spawn_flusher();

        log::info!("Radio {signature} ready ({} bytes recorded)", log.whole_size());

        Ok(Arc::new(Self {
            config,
            log,
            storage_key: signature.clone(),
            subscribers: RwLock::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
            signature: RwLock::new(signature),
            generation: Arc::new(AtomicU64::new(0)),
            next_session: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![flusher]),
            stats: Arc::new(AtomicRadioStats::default()),
        }))
    }

    /// Location of a room's log file.
    pub fn log_path(data_dir: &Path, signature: &str) -> PathBuf {
        data_dir.join(format!("{signature}.data"))
    }

    /// Register a subscriber and seed its queue with a history range.
    ///
    /// `start` is clamped to `[0, whole_size()]` and `length` to what has
    /// been recorded past `start`. History is queued before the subscriber
    /// can see any live announcement.
    pub async fn add_subscriber(
        self: &Arc<Self>,
        id: SubscriberId,
        start: u64,
        length: u64,
    ) -> Result<Subscription, RadioError> {
        self.ensure_open()?;
        let _writer = self.writer.lock().await;

        let whole = self.log.whole_size();
        let start = start.min(whole);
        let length = length.min(whole - start);

        let queue = Arc::new(Mutex::new(PendingQueue::with_range(
            start,
            length,
            self.config.queue_limits(),
        )));
        let intake = self.config.intake_capacity.max(1);
        let (ram_lane, ram_rx) = mpsc::channel(intake);
        let (file_lane, file_rx) = mpsc::channel(intake);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);

        let delivery = DeliveryLoop {
            id,
            session,
            radio: Arc::downgrade(self),
            log: Arc::clone(&self.log),
            queue: Arc::clone(&queue),
            generation: Arc::clone(&self.generation),
            stats: Arc::clone(&self.stats),
            ram_rx,
            file_rx,
            outbound: outbound_tx,
            tick: self.config.tick_interval(),
            send_timeout: self.config.send_timeout(),
        };

        let slot = SubscriberSlot {
            session,
            queue,
            ram_lane,
            file_lane,
        };
        if self.subscribers.write().insert(id, slot).is_some() {
            log::debug!("Subscriber {id} re-registered, previous session dropped");
        }
        tokio::spawn(delivery.run());

        log::debug!("Subscriber {id} joined with history {start}+{length}");
        Ok(Subscription {
            id,
            start,
            length,
            outbound: outbound_rx,
        })
    }

    /// Record `data` and announce its range to every subscriber.
    ///
    /// Returns the offset the data starts at. On a log failure nothing is
    /// announced.
    pub async fn write(&self, data: &[u8]) -> Result<u64, RadioError> {
        self.ensure_open()?;
        let _writer = self.writer.lock().await;
        self.ensure_open()?;

        let offset = self.log.write(data)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);

        if !data.is_empty() {
            self.announce(None, Chunk::file(offset, data.len() as u64));
        }
        Ok(offset)
    }

    /// Broadcast without recording. Returns the number of subscribers reached.
    pub fn send(&self, data: Vec<u8>) -> Result<usize, RadioError> {
        self.ensure_open()?;
        Ok(self.announce(None, Chunk::ram(data)))
    }

    /// Deliver to one subscriber without recording.
    pub fn single_send(&self, data: Vec<u8>, id: SubscriberId) -> Result<(), RadioError> {
        self.ensure_open()?;
        if !self.has_subscriber(&id) {
            return Err(RadioError::UnknownSubscriber(id));
        }
        self.announce(Some(id), Chunk::ram(data));
        Ok(())
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn remove_subscriber(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(id).is_some();
        if removed {
            log::debug!("Subscriber {id} removed");
        }
        removed
    }

    /// Remove every subscriber. Returns how many were registered.
    pub fn remove_all_subscribers(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    /// Truncate the log, empty every queue and rotate the signature.
    ///
    /// Returns the new signature.
    pub async fn reset(&self) -> Result<String, RadioError> {
        self.ensure_open()?;
        let _writer = self.writer.lock().await;

        self.generation.fetch_add(1, Ordering::AcqRel);
        for slot in self.subscribers.read().values() {
            slot.queue.lock().clear();
        }
        self.log.clear()?;

        let mut signature = self.signature.write();
        let next = derive_signature(&signature);
        log::info!("Radio {} reset, new signature {next}", *signature);
        *signature = next.clone();
        Ok(next)
    }

    /// Start the per-room writer task and return a handle feeding it.
    ///
    /// Commands are applied strictly in submission order. Failures inside
    /// the task are logged; the task stops when the radio closes.
    pub fn spawn_writer(self: &Arc<Self>) -> RadioSender {
        let (tx, mut rx) = mpsc::channel(self.config.command_capacity.max(1));
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(radio) = weak.upgrade() else { break };
                match radio.apply(command).await {
                    Ok(()) => {}
                    Err(RadioError::Closed) => break,
                    Err(e) => log::error!("Radio command failed: {e}"),
                }
            }
        });
        self.tasks.lock().push(handle);

        RadioSender {
            tx,
            timeout: self.config.command_timeout(),
        }
    }

    /// Opaque token for the current content generation.
    pub fn signature(&self) -> String {
        self.signature.read().clone()
    }

    /// Key naming the log file. Unlike `signature()` it survives `reset`,
    /// so it is what a caller persists to reopen the room later.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Total bytes recorded.
    pub fn whole_size(&self) -> u64 {
        self.log.whole_size()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn has_subscriber(&self, id: &SubscriberId) -> bool {
        self.subscribers.read().contains_key(id)
    }

    /// Number of chunks waiting in one subscriber's queue.
    pub fn pending_chunks(&self, id: &SubscriberId) -> Option<usize> {
        self.subscribers.read().get(id).map(|slot| slot.queue.lock().len())
    }

    pub fn stats(&self) -> RadioStats {
        RadioStats {
            writes: self.stats.writes.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            announcements: self.stats.announcements.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    pub fn log_file(&self) -> &Path {
        self.log.path()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop every subscriber, stop background tasks, flush and close the log.
    pub fn close(&self) -> Result<(), RadioError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let dropped = self.remove_all_subscribers();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.log.close()?;

        log::info!("Radio {} closed ({dropped} subscribers dropped)", self.signature());
        Ok(())
    }

    /// Close the radio and delete its log file.
    pub fn remove(&self) -> Result<(), RadioError> {
        self.close()?;
        self.log.remove()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), RadioError> {
        if self.is_closed() {
            Err(RadioError::Closed)
        } else {
            Ok(())
        }
    }

    async fn apply(&self, command: RadioCommand) -> Result<(), RadioError> {
        match command {
            RadioCommand::Write(data) => self.write(&data).await.map(|_| ()),
            RadioCommand::Send(data) => self.send(data).map(|_| ()),
            RadioCommand::SingleSend(data, id) => self.single_send(data, id),
        }
    }

    /// Push `chunk` onto the matching intake lane of every (or one) subscriber.
    fn announce(&self, target: Option<SubscriberId>, chunk: Chunk) -> usize {
        let generation = self.generation.load(Ordering::Acquire);
        let mut reached = 0;
        let mut dropped = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (id, slot) in subscribers.iter() {
                if target.is_some_and(|t| t != *id) {
                    continue;
                }
                let lane = match chunk {
                    Chunk::Ram(_) => &slot.ram_lane,
                    Chunk::File { .. } => &slot.file_lane,
                };
                let announcement = Announcement {
                    generation,
                    chunk: chunk.clone(),
                };
                match lane.try_send(announcement) {
                    Ok(()) => reached += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Evicting subscriber {id}: intake lane full");
                        dropped.push((*id, slot.session, true));
                    }
                    Err(TrySendError::Closed(_)) => dropped.push((*id, slot.session, false)),
                }
            }
        }

        for (id, session, evicted) in dropped {
            if self.remove_session(&id, session) && evicted {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.announcements.fetch_add(reached as u64, Ordering::Relaxed);
        reached
    }

    /// Remove `id` only if it is still the registration from `session`.
    fn remove_session(&self, id: &SubscriberId, session: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.get(id) {
            Some(slot) if slot.session == session => {
                subscribers.remove(id);
                log::debug!("Subscriber {id} removed");
                true
            }
            _ => false,
        }
    }
}

impl Drop for BroadcastRadio {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Outcome of one delivery attempt.
enum Step {
    Idle,
    Sent,
    Dropped,
    /// Range not readable yet; wait for the next tick
    Retry,
    Evict { timed_out: bool },
    /// Intake lanes closed: the subscriber was removed
    Stop,
}

/// Per-subscriber task draining its queue into the outbound channel.
struct DeliveryLoop {
    id: SubscriberId,
    session: u64,
    radio: Weak<BroadcastRadio>,
    log: Arc<PersistentLog>,
    queue: Arc<Mutex<PendingQueue>>,
    generation: Arc<AtomicU64>,
    stats: Arc<AtomicRadioStats>,
    ram_rx: mpsc::Receiver<Announcement>,
    file_rx: mpsc::Receiver<Announcement>,
    outbound: mpsc::Sender<Packet>,
    tick: Duration,
    send_timeout: Duration,
}

impl DeliveryLoop {
    async fn run(self) {
        let id = self.id;
        let session = self.session;
        let radio = self.radio.clone();

        if AssertUnwindSafe(self.deliver_until_removed()).catch_unwind().await.is_err() {
            log::error!("Delivery loop for subscriber {id} panicked");
            if let Some(radio) = radio.upgrade() {
                radio.remove_session(&id, session);
            }
        }
    }

    async fn deliver_until_removed(mut self) {
        // One ticker for the whole loop so intake traffic cannot postpone a retry
        let mut retry_tick = tokio::time::interval(self.tick);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = false;

        loop {
            if !self.drain_intake() {
                break;
            }

            let idle = backoff || self.queue.lock().is_empty();
            if idle {
                tokio::select! {
                    biased;
                    _ = retry_tick.tick(), if backoff => backoff = false,
                    announcement = self.ram_rx.recv() => match announcement {
                        Some(a) => self.intake(a),
                        None => break,
                    },
                    announcement = self.file_rx.recv() => match announcement {
                        Some(a) => self.intake(a),
                        None => break,
                    },
                }
                continue;
            }

            match self.deliver_front().await {
                Step::Retry => {
                    backoff = true;
                    retry_tick.reset();
                }
                Step::Evict { timed_out } => {
                    self.evict(timed_out);
                    break;
                }
                Step::Stop => break,
                Step::Idle | Step::Sent | Step::Dropped => {}
            }
        }
        log::debug!("Delivery loop for subscriber {} stopped", self.id);
    }

    /// Move every waiting announcement into the queue. False once the lanes
    /// are closed (subscriber removed).
    fn drain_intake(&mut self) -> bool {
        loop {
            match self.ram_rx.try_recv() {
                Ok(a) => {
                    self.intake(a);
                    continue;
                }
                Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => {}
            }
            match self.file_rx.try_recv() {
                Ok(a) => self.intake(a),
                Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn intake(&self, announcement: Announcement) {
        let mut queue = self.queue.lock();
        let stale = matches!(announcement.chunk, Chunk::File { .. })
            && announcement.generation != self.generation.load(Ordering::Acquire);
        if !stale {
            queue.append(announcement.chunk);
        }
    }

    /// Drive `work` to completion while still taking announcements into the
    /// queue. `None` once the lanes are closed.
    async fn keep_intake<F: Future>(&mut self, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;
                out = &mut work => return Some(out),
                announcement = self.ram_rx.recv() => self.intake(announcement?),
                announcement = self.file_rx.recv() => self.intake(announcement?),
            }
        }
    }

    async fn deliver_front(&mut self) -> Step {
        let (chunk, generation) = {
            let mut queue = self.queue.lock();
            match queue.pop_front() {
                Some(chunk) => (chunk, self.generation.load(Ordering::Acquire)),
                None => return Step::Idle,
            }
        };

        let (packet, from_log) = match chunk {
            Chunk::Ram(data) => (data, false),
            Chunk::File { start, length } => {
                let log = Arc::clone(&self.log);
                let read = tokio::task::spawn_blocking(move || log.read_at(start, length));
                let Some(read) = self.keep_intake(read).await else {
                    return Step::Stop;
                };
                match read {
                    Ok(Ok(bytes)) => (Arc::new(bytes), true),
                    Ok(Err(e)) if e.is_transient() => {
                        let mut queue = self.queue.lock();
                        if self.generation.load(Ordering::Acquire) == generation {
                            queue.push_front(Chunk::file(start, length));
                        }
                        return Step::Retry;
                    }
                    Ok(Err(e)) => {
                        log::error!(
                            "Dropping {length} bytes at {start} for subscriber {}: {e}",
                            self.id
                        );
                        return Step::Dropped;
                    }
                    Err(e) => {
                        log::error!("Log read for subscriber {} failed: {e}", self.id);
                        return Step::Dropped;
                    }
                }
            }
        };

        let reserve = tokio::time::timeout(self.send_timeout, self.outbound.clone().reserve_owned());
        let Some(reserved) = self.keep_intake(reserve).await else {
            return Step::Stop;
        };
        match reserved {
            Ok(Ok(permit)) => {
                if from_log && self.generation.load(Ordering::Acquire) != generation {
                    return Step::Dropped;
                }
                permit.send(packet);
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                Step::Sent
            }
            Ok(Err(_)) => Step::Evict { timed_out: false },
            Err(_) => {
                log::warn!(
                    "Evicting subscriber {}: outbound push blocked for {:?}",
                    self.id,
                    self.send_timeout
                );
                Step::Evict { timed_out: true }
            }
        }
    }

    fn evict(&self, timed_out: bool) {
        if let Some(radio) = self.radio.upgrade() {
            if radio.remove_session(&self.id, self.session) && timed_out {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::{sleep, timeout};

    async fn collect(sub: &mut Subscription, expected: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < expected {
            let packet = timeout(Duration::from_secs(2), sub.recv())
                .await
                .expect("timed out waiting for packet")
                .expect("subscription closed");
            out.extend_from_slice(&packet);
        }
        out
    }

    fn open(dir: &Path) -> Arc<BroadcastRadio> {
        BroadcastRadio::open(RadioConfig::for_testing(dir), "room").unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_log_file() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        assert_eq!(radio.log_file(), dir.path().join("room.data"));
        assert!(radio.log_file().exists());
        assert_eq!(radio.signature(), "room");
        assert_eq!(radio.whole_size(), 0);
    }

    #[tokio::test]
    async fn test_write_broadcasts_to_all() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());

        let mut a = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();
        let mut b = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();

        assert_eq!(radio.write(b"stroke-1").await.unwrap(), 0);
        assert_eq!(radio.write(b"stroke-2").await.unwrap(), 8);

        assert_eq!(collect(&mut a, 16).await, b"stroke-1stroke-2".to_vec());
        assert_eq!(collect(&mut b, 16).await, b"stroke-1stroke-2".to_vec());
        assert_eq!(radio.whole_size(), 16);
    }

    #[tokio::test]
    async fn test_catch_up_is_clamped() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        radio.write(&[1; 10]).await.unwrap();

        let sub = radio.add_subscriber(Uuid::new_v4(), 5, 100).await.unwrap();
        assert_eq!(sub.catch_up(), (5, 5));

        let sub = radio.add_subscriber(Uuid::new_v4(), 50, 10).await.unwrap();
        assert_eq!(sub.catch_up(), (10, 0));

        let sub = radio.add_subscriber(Uuid::new_v4(), 2, 3).await.unwrap();
        assert_eq!(sub.catch_up(), (2, 3));
    }

    #[tokio::test]
    async fn test_history_precedes_live() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let history: Vec<u8> = (0..200u8).collect();
        radio.write(&history).await.unwrap();

        let mut sub = radio.add_subscriber(Uuid::new_v4(), 0, 200).await.unwrap();
        radio.write(b"live").await.unwrap();

        let mut expected = history.clone();
        expected.extend_from_slice(b"live");
        assert_eq!(collect(&mut sub, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_send_is_not_recorded() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let mut sub = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();

        assert_eq!(radio.send(b"cursor".to_vec()).unwrap(), 1);
        assert_eq!(collect(&mut sub, 6).await, b"cursor".to_vec());
        assert_eq!(radio.whole_size(), 0);

        let late = radio.add_subscriber(Uuid::new_v4(), 0, u64::MAX).await.unwrap();
        assert_eq!(late.catch_up(), (0, 0));
    }

    #[tokio::test]
    async fn test_single_send_targets_one() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let alice = Uuid::new_v4();
        let mut a = radio.add_subscriber(alice, 0, 0).await.unwrap();
        let mut b = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();

        radio.single_send(b"welcome".to_vec(), alice).unwrap();
        assert_eq!(collect(&mut a, 7).await, b"welcome".to_vec());

        sleep(Duration::from_millis(50)).await;
        assert!(b.try_recv().is_none());

        let stranger = Uuid::new_v4();
        assert_eq!(
            radio.single_send(b"x".to_vec(), stranger),
            Err(RadioError::UnknownSubscriber(stranger))
        );
    }

    #[tokio::test]
    async fn test_remove_subscriber_is_idempotent() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let id = Uuid::new_v4();
        let mut sub = radio.add_subscriber(id, 0, 0).await.unwrap();

        assert!(radio.remove_subscriber(&id));
        assert!(!radio.remove_subscriber(&id));
        assert_eq!(radio.subscriber_count(), 0);

        // Writes keep working and the removed subscriber's stream ends
        radio.write(b"after").await.unwrap();
        let end = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_reregistering_replaces_session() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let id = Uuid::new_v4();

        let old = radio.add_subscriber(id, 0, 0).await.unwrap();
        let mut new = radio.add_subscriber(id, 0, 0).await.unwrap();
        drop(old);

        radio.write(b"hello").await.unwrap();
        assert_eq!(collect(&mut new, 5).await, b"hello".to_vec());
        assert!(radio.has_subscriber(&id));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        radio.write(&[7; 2000]).await.unwrap();

        let id = Uuid::new_v4();
        let mut sub = radio.add_subscriber(id, 0, 2000).await.unwrap();
        let before = radio.signature();

        let after = radio.reset().await.unwrap();
        assert_ne!(before, after);
        assert_eq!(radio.signature(), after);
        assert_eq!(radio.storage_key(), "room");
        assert_eq!(radio.whole_size(), 0);
        assert_eq!(radio.pending_chunks(&id), Some(0));

        // Drain whatever was already in flight, then only new content arrives
        while timeout(Duration::from_millis(100), sub.recv()).await.is_ok() {}
        radio.write(b"fresh").await.unwrap();
        assert_eq!(collect(&mut sub, 5).await, b"fresh".to_vec());
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_evicted() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let stalled = Uuid::new_v4();
        let _never_read = radio.add_subscriber(stalled, 0, 0).await.unwrap();
        let mut healthy = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();

        for i in 0..20u8 {
            let started = std::time::Instant::now();
            radio.write(&[i]).await.unwrap();
            assert!(started.elapsed() < Duration::from_millis(100));
            // Let delivery loops turn each write into its own packet
            tokio::task::yield_now().await;
        }
        assert_eq!(collect(&mut healthy, 20).await, (0..20u8).collect::<Vec<_>>());

        timeout(Duration::from_secs(2), async {
            while radio.has_subscriber(&stalled) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("stalled subscriber should be evicted");
        assert_eq!(radio.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let id = Uuid::new_v4();
        drop(radio.add_subscriber(id, 0, 0).await.unwrap());

        radio.write(b"ping").await.unwrap();
        timeout(Duration::from_secs(1), async {
            while radio.has_subscriber(&id) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber with a dropped receiver should be removed");
        assert_eq!(radio.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_spawned_writer_keeps_order() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let mut sub = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();
        let sender = radio.spawn_writer();

        for i in 0..50u8 {
            sender.write(vec![i]).await.unwrap();
        }
        assert_eq!(collect(&mut sub, 50).await, (0..50u8).collect::<Vec<_>>());
        assert_eq!(radio.whole_size(), 50);
    }

    #[tokio::test]
    async fn test_close_stops_radio() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let mut sub = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();
        let sender = radio.spawn_writer();
        radio.write(b"kept").await.unwrap();

        radio.close().unwrap();
        radio.close().unwrap();
        assert!(radio.is_closed());
        assert_eq!(radio.subscriber_count(), 0);
        assert_eq!(radio.write(b"x").await, Err(RadioError::Closed));
        assert_eq!(std::fs::metadata(radio.log_file()).unwrap().len(), 4);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.write(b"y".to_vec()).await, Err(RadioError::Closed));
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), sub.recv()).await {}
    }

    #[tokio::test]
    async fn test_remove_deletes_file() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        radio.write(b"gone").await.unwrap();
        let path = radio.log_file().to_path_buf();

        radio.remove().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let mut sub = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();

        radio.write(b"abc").await.unwrap();
        radio.write(b"de").await.unwrap();
        collect(&mut sub, 5).await;

        let stats = radio.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.bytes_written, 5);
        assert_eq!(stats.announcements, 2);
        assert!(stats.deliveries >= 1);
        assert_eq!(stats.active_subscribers, 1);
    }

    #[tokio::test]
    async fn test_close_while_write_waits_reports_closed() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());

        let held = radio.writer.lock().await;
        let pending = {
            let radio = Arc::clone(&radio);
            tokio::spawn(async move { radio.write(b"late").await })
        };
        sleep(Duration::from_millis(20)).await;

        radio.close().unwrap();
        drop(held);
        assert_eq!(pending.await.unwrap(), Err(RadioError::Closed));
        assert_eq!(radio.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_retry_fires_while_writes_keep_arriving() {
        let dir = tempdir().unwrap();
        let radio = open(dir.path());
        let id = Uuid::new_v4();
        let mut sub = radio.add_subscriber(id, 0, 0).await.unwrap();

        // A range the log does not hold yet; readable once enough writes land
        radio.subscribers.read()[&id].queue.lock().push_front(Chunk::file(0, 10));

        let writer = {
            let radio = Arc::clone(&radio);
            tokio::spawn(async move {
                for i in 0..500u32 {
                    radio.write(&[i as u8]).await.unwrap();
                    sleep(Duration::from_millis(2)).await;
                }
            })
        };

        // Writes land every 2ms, well inside the 10ms tick
        let first = timeout(Duration::from_millis(300), sub.recv())
            .await
            .expect("re-queued chunk was never retried")
            .unwrap();
        assert_eq!(first.as_slice(), (0..10u8).collect::<Vec<_>>().as_slice());
        assert!(radio.has_subscriber(&id));
        writer.abort();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_write_announces_nothing() {
        let dir = tempdir().unwrap();
        // Every write to /dev/full fails with ENOSPC
        std::os::unix::fs::symlink("/dev/full", dir.path().join("full.data")).unwrap();
        let radio = BroadcastRadio::open(RadioConfig::for_testing(dir.path()), "full").unwrap();
        let mut sub = radio.add_subscriber(Uuid::new_v4(), 0, 0).await.unwrap();

        // Larger than the buffer, so it goes straight to the device
        let err = radio.write(&[9; 1024]).await.unwrap_err();
        assert!(matches!(err, RadioError::Log(LogError::Io(_))));
        assert_eq!(radio.whole_size(), 0);

        let stats = radio.stats();
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.announcements, 0);
        sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_radio_error_display() {
        assert!(RadioError::Closed.to_string().contains("closed"));
        assert!(RadioError::Busy.to_string().contains("busy"));
        assert_eq!(RadioError::from(LogError::Closed), RadioError::Closed);
        let err = RadioError::from(LogError::Io("disk full".into()));
        assert!(err.to_string().contains("disk full"));
    }
}
