//! Per-slot concurrency limits for extraction calls.
//!
//! `SlotsSemaphore` keeps one semaphore per living slot, which limits the
//! number of calls running concurrently within a slot (typically a domain)
//! without limiting concurrency between slots. A slot is forgotten as soon as
//! no task is waiting on or running in it, so the map never grows with the
//! number of domains seen over a crawl.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use publicsuffix::{List, Psl};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{trace, warn};
use url::Url;

use crate::config::SlotPolicy;
use crate::error::{AutoExtractError, Result};

/// Slot shared by every call under `SlotPolicy::SingleSlot`.
pub const SINGLE_SLOT: &str = "__AutoExtract__";

static PUBLIC_SUFFIXES: LazyLock<Option<List>> = LazyLock::new(|| {
    match include_str!("../data/public_suffix_list.dat").parse::<List>() {
        Ok(list) => Some(list),
        Err(e) => {
            warn!("Failed to parse the public suffix list, slots fall back to hosts: {:?}", e);
            None
        }
    }
});

struct SlotMeta {
    semaphore: Arc<Semaphore>,
    registered_tasks: usize,
}

pub struct SlotsSemaphore {
    concurrency_per_slot: usize,
    slots: Mutex<HashMap<String, SlotMeta>>,
}

impl SlotsSemaphore {
    pub fn new(concurrency_per_slot: usize) -> Self {
        Self {
            concurrency_per_slot: concurrency_per_slot.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn concurrency_per_slot(&self) -> usize {
        self.concurrency_per_slot
    }

    /// Number of slots with pending or running tasks.
    pub fn active_slots(&self) -> usize {
        self.lock().len()
    }

    /// Waits for a free place in `slot`. The place is held until the returned
    /// permit is dropped.
    pub async fn acquire(&self, slot: &str) -> Result<SlotPermit<'_>> {
        let semaphore = {
            let mut slots = self.lock();
            let meta = slots.entry(slot.to_string()).or_insert_with(|| SlotMeta {
                semaphore: Arc::new(Semaphore::new(self.concurrency_per_slot)),
                registered_tasks: 0,
            });
            meta.registered_tasks += 1;
            Arc::clone(&meta.semaphore)
        };
        let registration = Registration {
            parent: self,
            slot: slot.to_string(),
        };

        trace!("Waiting for a place in slot {}", slot);
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| AutoExtractError::Cancelled)?;

        Ok(SlotPermit {
            _permit: permit,
            _registration: registration,
        })
    }

    /// Runs `task` while holding a place in `slot`.
    pub async fn run<F: Future>(&self, slot: &str, task: F) -> Result<F::Output> {
        let _permit = self.acquire(slot).await?;
        Ok(task.await)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SlotMeta>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, slot: &str) {
        let mut slots = self.lock();
        if let Some(meta) = slots.get_mut(slot) {
            meta.registered_tasks -= 1;
            if meta.registered_tasks == 0 {
                slots.remove(slot);
            }
        }
    }
}

impl fmt::Display for SlotsSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.lock();
        if slots.is_empty() {
            return write!(f, "SlotsSemaphore({}) empty", self.concurrency_per_slot);
        }
        let counts: Vec<String> = slots
            .values()
            .map(|meta| meta.registered_tasks.to_string())
            .collect();
        write!(
            f,
            "SlotsSemaphore({}) {} slots. Tasks counts {}",
            self.concurrency_per_slot,
            slots.len(),
            counts.join(",")
        )
    }
}

// Unregisters the task on drop, including when it is dropped while waiting.
struct Registration<'a> {
    parent: &'a SlotsSemaphore,
    slot: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.parent.release(&self.slot);
    }
}

/// A held place in a slot.
pub struct SlotPermit<'a> {
    // Released before the registration so the slot is never removed while a
    // permit is still out.
    _permit: OwnedSemaphorePermit,
    _registration: Registration<'a>,
}

/// The slot an extraction for `url` belongs to under `policy`.
pub fn slot_key(url: &Url, policy: SlotPolicy) -> Option<String> {
    match policy {
        SlotPolicy::PerDomain => Some(get_domain(url)),
        SlotPolicy::SingleSlot => Some(SINGLE_SLOT.to_string()),
        SlotPolicy::FrameworkDefault => None,
    }
}

/// The registrable domain of `url`: its public suffix plus one label.
///
/// Hosts without a registrable part (IPs, `localhost`, bare suffixes) are
/// returned whole.
pub fn get_domain(url: &Url) -> String {
    let host = match url.host_str() {
        Some(host) => host.trim_end_matches('.').to_ascii_lowercase(),
        None => return String::new(),
    };
    if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok() {
        return host;
    }

    PUBLIC_SUFFIXES
        .as_ref()
        .and_then(|list| list.domain(host.as_bytes()))
        .and_then(|domain| std::str::from_utf8(domain.as_bytes()).ok().map(str::to_string))
        .unwrap_or(host)
}
