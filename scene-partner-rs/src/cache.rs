//! Audio prefetch cache.
//!
//! Keeps synthesized audio for the next few non-user lines ready before the
//! orchestrator reaches them. Each line index owns one slot; the slot is
//! registered under the map lock before any await, so a prefetch task and the
//! main loop asking for the same line share a single synthesis call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::script::{strip_parentheticals, ScriptModel};
use crate::synth::{SynthesisRequest, Synthesizer};

/// Playable audio for one line.
///
/// Clones share the same buffer; it is freed when the cache lets go of its
/// entry and the last clone in flight is dropped.
#[derive(Debug, Clone)]
pub struct AudioHandle {
    line_index: usize,
    bytes: Arc<[u8]>,
}

impl AudioHandle {
    pub fn new(line_index: usize, bytes: Vec<u8>) -> Self {
        Self {
            line_index,
            bytes: bytes.into(),
        }
    }

    pub fn line_index(&self) -> usize {
        self.line_index
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStatus {
    Pending,
    Ready,
    Failed,
}

type Slot = Arc<OnceCell<Option<AudioHandle>>>;

struct Entry {
    slot: Slot,
    prefetch: Option<AbortHandle>,
}

impl Entry {
    fn status(&self) -> CacheStatus {
        match self.slot.get() {
            None => CacheStatus::Pending,
            Some(Some(_)) => CacheStatus::Ready,
            Some(None) => CacheStatus::Failed,
        }
    }

    fn release(self) {
        if let Some(task) = self.prefetch {
            task.abort();
        }
    }
}

/// Line index → synthesized audio, bounded to a lookahead window.
pub struct AudioCache {
    script: Arc<ScriptModel>,
    active_character: String,
    synth: Arc<dyn Synthesizer>,
    lookahead: usize,
    permits: Arc<Semaphore>,
    entries: Mutex<HashMap<usize, Entry>>,
}

impl AudioCache {
    pub fn new(
        script: Arc<ScriptModel>,
        active_character: impl Into<String>,
        synth: Arc<dyn Synthesizer>,
        lookahead: usize,
    ) -> Self {
        let lookahead = lookahead.max(1);
        Self {
            script,
            active_character: active_character.into(),
            synth,
            lookahead,
            permits: Arc::new(Semaphore::new(lookahead)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<usize, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Existing slot for `index`, or a fresh one marked in flight.
    fn slot(&self, index: usize) -> Slot {
        let mut entries = self.entries();
        let entry = entries.entry(index).or_insert_with(|| Entry {
            slot: Slot::default(),
            prefetch: None,
        });
        Arc::clone(&entry.slot)
    }

    /// Audio for line `index`, generating it if nobody has yet.
    ///
    /// `Ok(None)` means generation failed for this line; the failure sticks
    /// until [`release_all`](Self::release_all).
    pub async fn ensure(&self, index: usize) -> Result<Option<AudioHandle>> {
        self.script.line_at(index)?;
        let slot = self.slot(index);
        let audio = slot.get_or_init(|| self.generate(index)).await;
        Ok(audio.clone())
    }

    async fn generate(&self, index: usize) -> Option<AudioHandle> {
        let line = self.script.line_at(index).ok()?;
        let request = SynthesisRequest {
            text: strip_parentheticals(&line.dialog),
            character: line.character.clone(),
        };

        match self.synth.synthesize(&request).await {
            Ok(bytes) => {
                debug!("Line {index} ready ({} bytes)", bytes.len());
                Some(AudioHandle::new(index, bytes))
            }
            Err(e) => {
                warn!("Line {index}: {e}");
                None
            }
        }
    }

    /// Start background generation for the upcoming non-user lines.
    ///
    /// Returns immediately. Entries behind `from_index` are released.
    pub fn prefetch(self: &Arc<Self>, from_index: usize) {
        let window: Vec<usize> = self
            .script
            .lines()
            .get(from_index..)
            .unwrap_or_default()
            .iter()
            .filter(|line| line.character != self.active_character)
            .take(self.lookahead)
            .map(|line| line.index)
            .collect();

        let mut entries = self.entries();

        let stale: Vec<usize> = entries.keys().copied().filter(|&i| i < from_index).collect();
        for index in stale {
            if let Some(entry) = entries.remove(&index) {
                entry.release();
            }
        }

        for index in window {
            if entries.contains_key(&index) {
                continue;
            }
            let slot = Slot::default();
            let cache = Arc::clone(self);
            let task_slot = Arc::clone(&slot);
            let task = tokio::spawn(async move {
                let Ok(_permit) = Arc::clone(&cache.permits).acquire_owned().await else {
                    return;
                };
                task_slot.get_or_init(|| cache.generate(index)).await;
            });
            debug!("Prefetching line {index}");
            entries.insert(
                index,
                Entry {
                    slot,
                    prefetch: Some(task.abort_handle()),
                },
            );
        }
    }

    /// Drop every cached handle and cancel outstanding prefetches.
    pub fn release_all(&self) {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            entry.release();
        }
        info!("Released {count} cached lines");
    }

    pub fn status(&self, index: usize) -> Option<CacheStatus> {
        self.entries().get(&index).map(Entry::status)
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }
}

impl Drop for AudioCache {
    fn drop(&mut self) {
        for (_, entry) in self.entries().drain() {
            entry.release();
        }
    }
}
