//! Concurrency groups - named FIFO mutual exclusion
//!
//! A run takes a ticket when it is triggered and is granted the group once
//! every earlier ticket has been released. Nothing is ever preempted: a
//! queued run waits, an in-flight run finishes.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error waiting for or holding a concurrency group
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("concurrency group `{0}` was shut down")]
    Closed(String),

    #[error("ticket queue for `{group}`: {source}")]
    Io {
        group: String,
        #[source]
        source: std::io::Error,
    },
}

/// Backend-specific slot behind a ticket; dropping it releases the slot
#[async_trait]
pub trait TicketSlot: Send + Sync {
    /// Resolve once every earlier slot in the group is released
    async fn wait_turn(&self) -> Result<(), ConcurrencyError>;

    /// Number of live slots ahead of this one
    fn position(&self) -> usize;
}

/// Issues tickets for named groups
pub trait ConcurrencyBackend: Send + Sync {
    fn enqueue(&self, group: &str, run_id: Uuid) -> Result<Ticket, ConcurrencyError>;
}

/// A place in a group's queue
pub struct Ticket {
    group: String,
    run_id: Uuid,
    slot: Box<dyn TicketSlot>,
}

impl Ticket {
    pub fn new(group: impl Into<String>, run_id: Uuid, slot: Box<dyn TicketSlot>) -> Self {
        Self {
            group: group.into(),
            run_id,
            slot,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn position(&self) -> usize {
        self.slot.position()
    }

    /// Wait until this ticket heads the queue
    pub async fn wait_turn(&self) -> Result<Permit<'_>, ConcurrencyError> {
        debug!(group = %self.group, run_id = %self.run_id, "Waiting for turn");
        self.slot.wait_turn().await?;
        info!(group = %self.group, run_id = %self.run_id, "Acquired concurrency group");
        Ok(Permit { ticket: self })
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("group", &self.group)
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Proof that the holder is at the head of its group
#[derive(Debug)]
pub struct Permit<'a> {
    ticket: &'a Ticket,
}

impl Permit<'_> {
    pub fn group(&self) -> &str {
        &self.ticket.group
    }

    pub fn run_id(&self) -> Uuid {
        self.ticket.run_id
    }
}

struct GroupQueue {
    next: AtomicU64,
    outstanding: watch::Sender<BTreeSet<u64>>,
}

/// In-process concurrency groups
#[derive(Default, Clone)]
pub struct ConcurrencyGroups {
    groups: Arc<Mutex<HashMap<String, Arc<GroupQueue>>>>,
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, group: &str) -> Arc<GroupQueue> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .entry(group.to_string())
            .or_insert_with(|| {
                let (outstanding, _) = watch::channel(BTreeSet::new());
                Arc::new(GroupQueue {
                    next: AtomicU64::new(0),
                    outstanding,
                })
            })
            .clone()
    }

    /// Number of tickets currently held in `group`
    pub fn len(&self, group: &str) -> usize {
        self.queue(group).outstanding.borrow().len()
    }
}

impl ConcurrencyBackend for ConcurrencyGroups {
    fn enqueue(&self, group: &str, run_id: Uuid) -> Result<Ticket, ConcurrencyError> {
        let queue = self.queue(group);
        let seq = queue.next.fetch_add(1, Ordering::SeqCst);
        queue.outstanding.send_modify(|set| {
            set.insert(seq);
        });
        debug!(group, %run_id, seq, "Ticket issued");

        Ok(Ticket::new(
            group,
            run_id,
            Box::new(MemorySlot {
                group: group.to_string(),
                queue,
                seq,
            }),
        ))
    }
}

struct MemorySlot {
    group: String,
    queue: Arc<GroupQueue>,
    seq: u64,
}

#[async_trait]
impl TicketSlot for MemorySlot {
    async fn wait_turn(&self) -> Result<(), ConcurrencyError> {
        let mut rx = self.queue.outstanding.subscribe();
        rx.wait_for(|set| set.first() == Some(&self.seq))
            .await
            .map(|_| ())
            .map_err(|_| ConcurrencyError::Closed(self.group.clone()))
    }

    fn position(&self) -> usize {
        self.queue
            .outstanding
            .borrow()
            .iter()
            .take_while(|&&s| s < self.seq)
            .count()
    }
}

impl Drop for MemorySlot {
    fn drop(&mut self) {
        self.queue.outstanding.send_modify(|set| {
            set.remove(&self.seq);
        });
    }
}

/// Cross-process ticket queue backed by files.
///
/// Each ticket is a file in `<root>/<group>/` whose name sorts by issue time;
/// the oldest live file holds the group. Tickets left behind by processes
/// that died are pruned on Linux.
#[derive(Debug, Clone)]
pub struct FileTicketQueue {
    root: PathBuf,
    poll_interval: Duration,
}

impl FileTicketQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl ConcurrencyBackend for FileTicketQueue {
    fn enqueue(&self, group: &str, run_id: Uuid) -> Result<Ticket, ConcurrencyError> {
        let io = |source| ConcurrencyError::Io {
            group: group.to_string(),
            source,
        };

        let dir = self.root.join(sanitize(group));
        std::fs::create_dir_all(&dir).map_err(io)?;

        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0);
        let name = format!("{:020}-{}.ticket", nanos, run_id.simple());
        let path = dir.join(&name);
        std::fs::write(&path, std::process::id().to_string()).map_err(io)?;
        debug!(group, %run_id, ticket = %name, "Ticket file written");

        Ok(Ticket::new(
            group,
            run_id,
            Box::new(FileSlot {
                group: group.to_string(),
                dir,
                name,
                poll_interval: self.poll_interval,
            }),
        ))
    }
}

fn sanitize(group: &str) -> String {
    group
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

struct FileSlot {
    group: String,
    dir: PathBuf,
    name: String,
    poll_interval: Duration,
}

impl FileSlot {
    /// Live ticket names in queue order
    fn live_tickets(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".ticket") {
                continue;
            }
            if name != self.name && is_abandoned(&entry.path()) {
                warn!(group = %self.group, ticket = %name, "Pruning ticket of a dead process");
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl TicketSlot for FileSlot {
    async fn wait_turn(&self) -> Result<(), ConcurrencyError> {
        loop {
            let tickets = self.live_tickets().map_err(|source| ConcurrencyError::Io {
                group: self.group.clone(),
                source,
            })?;
            if tickets.first() == Some(&self.name) {
                return Ok(());
            }
            if !tickets.contains(&self.name) {
                return Err(ConcurrencyError::Closed(self.group.clone()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn position(&self) -> usize {
        self.live_tickets()
            .map(|tickets| tickets.iter().take_while(|t| **t != self.name).count())
            .unwrap_or(0)
    }
}

impl Drop for FileSlot {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.dir.join(&self.name)) {
            warn!(group = %self.group, "Failed to release ticket {}: {}", self.name, e);
        }
    }
}

#[cfg(target_os = "linux")]
fn is_abandoned(ticket: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(ticket) else {
        return false;
    };
    match content.trim().parse::<u32>() {
        Ok(pid) => !Path::new("/proc").join(pid.to_string()).exists(),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_abandoned(_ticket: &Path) -> bool {
    false
}
