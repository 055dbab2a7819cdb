//! Event-sourced uptime tracking
//!
//! Each service keeps a bounded, append-only log of lifecycle and health
//! events. Availability statistics are derived from it on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_registry::{RecordStore, ServiceId, UptimeEvent, UptimeEventKind};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Availability figures for one service over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeStats {
    /// Length of the window
    pub window: Duration,
    /// Share of the window not spent down, 0 to 100
    pub uptime_percent: f64,
    /// Observed time divided by failure count; zero with fewer than two failures
    pub mtbf: Duration,
    /// Time spent down inside the window
    pub total_downtime: Duration,
    /// `started` events in the window, not counting the very first start
    pub total_restarts: u32,
    /// Start of the most recent down period that overlaps the window
    pub last_downtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ServiceLog {
    events: VecDeque<UptimeEvent>,
    first_started_at: Option<DateTime<Utc>>,
}

/// Per-service bounded event logs with derived statistics
pub struct UptimeTracker {
    capacity: usize,
    logs: Mutex<HashMap<ServiceId, ServiceLog>>,
    store: Option<Arc<dyn RecordStore>>,
}

impl UptimeTracker {
    /// In-memory tracker keeping `capacity` events per service
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            logs: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Tracker that also forwards every event to `store`
    pub fn with_store(capacity: usize, store: Arc<dyn RecordStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(capacity)
        }
    }

    /// Append an event to the in-memory log only
    pub fn record_local(&self, event: UptimeEvent) {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(event.service_id).or_default();
        if event.kind == UptimeEventKind::Started && log.first_started_at.is_none() {
            log.first_started_at = Some(event.timestamp);
        }
        if log.events.len() == self.capacity {
            log.events.pop_front();
        }
        log.events.push_back(event);
    }

    /// Append an event and forward it to the record store
    pub async fn record(&self, event: UptimeEvent) {
        debug!("Uptime event {:?} for {}", event.kind, event.service_id);
        self.record_local(event);
        if let Some(store) = &self.store {
            if let Err(e) = store.append_uptime_event(&event).await {
                warn!("Failed to persist uptime event for {}: {}", event.service_id, e);
            }
        }
    }

    /// Reload persisted history for the given services
    pub async fn load(&self, ids: impl IntoIterator<Item = ServiceId>) -> crate::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut total = 0;
        for id in ids {
            let first_started_at = store.first_started_at(id).await?;
            let events = store.load_uptime_events(id).await?;
            total += events.len();
            if first_started_at.is_some() {
                let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
                logs.entry(id).or_default().first_started_at = first_started_at;
            }
            for event in events {
                self.record_local(event);
            }
        }
        Ok(total)
    }

    /// Copy of a service's events, oldest first
    pub fn events(&self, id: ServiceId) -> Vec<UptimeEvent> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|log| log.events.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a service's history
    pub fn forget(&self, id: ServiceId) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Statistics over the trailing `window` ending now
    pub fn stats(&self, id: ServiceId, window: Duration) -> UptimeStats {
        self.stats_at(id, window, Utc::now())
    }

    /// Statistics over the `window` ending at `now`
    pub fn stats_at(&self, id: ServiceId, window: Duration, now: DateTime<Utc>) -> UptimeStats {
        let (mut events, first_started_at) = {
            let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            match logs.get(&id) {
                Some(log) => (log.events.iter().copied().collect::<Vec<_>>(), log.first_started_at),
                None => (Vec::new(), None),
            }
        };
        events.sort_by_key(|e| e.timestamp);
        compute_stats(&events, first_started_at, window, now)
    }
}

impl std::fmt::Debug for UptimeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UptimeTracker")
            .field("capacity", &self.capacity)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or_default()
}

fn compute_stats(
    events: &[UptimeEvent],
    first_started_at: Option<DateTime<Utc>>,
    window: Duration,
    now: DateTime<Utc>,
) -> UptimeStats {
    let empty = UptimeStats {
        window,
        uptime_percent: 100.0,
        mtbf: Duration::ZERO,
        total_downtime: Duration::ZERO,
        total_restarts: 0,
        last_downtime: None,
    };
    if events.is_empty() || window.is_zero() {
        return empty;
    }

    let span = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let window_start = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);

    // State at the window start comes from the last earlier event
    let mut down_since: Option<DateTime<Utc>> = None;
    let mut last_downtime: Option<DateTime<Utc>> = None;
    if let Some(prior) = events.iter().rev().find(|e| e.timestamp < window_start) {
        if prior.kind.is_failure() {
            // Walk back to where that down period began
            let began = events
                .iter()
                .rev()
                .filter(|e| e.timestamp <= prior.timestamp)
                .take_while(|e| e.kind.is_failure())
                .last()
                .map(|e| e.timestamp)
                .unwrap_or(prior.timestamp);
            down_since = Some(window_start);
            last_downtime = Some(began);
        }
    }

    let in_window: Vec<&UptimeEvent> = events
        .iter()
        .filter(|e| e.timestamp >= window_start && e.timestamp <= now)
        .collect();
    if in_window.is_empty() {
        return empty;
    }

    let mut downtime = chrono::Duration::zero();
    let mut failures = 0u32;
    let mut restarts = 0u32;

    for event in &in_window {
        match event.kind {
            UptimeEventKind::Crashed | UptimeEventKind::Unhealthy => {
                failures += 1;
                if down_since.is_none() {
                    down_since = Some(event.timestamp);
                    last_downtime = Some(event.timestamp);
                }
            }
            UptimeEventKind::Healthy | UptimeEventKind::Started | UptimeEventKind::Stopped => {
                if let Some(since) = down_since.take() {
                    downtime += event.timestamp - since;
                }
                if event.kind == UptimeEventKind::Started && Some(event.timestamp) != first_started_at {
                    restarts += 1;
                }
            }
        }
    }
    if let Some(since) = down_since {
        downtime += now - since;
    }

    let total_downtime = to_std(downtime).min(window);
    let ratio = total_downtime.as_secs_f64() / window.as_secs_f64();
    let uptime_percent = (100.0 * (1.0 - ratio)).clamp(0.0, 100.0);

    let observed_from = in_window
        .first()
        .map(|e| e.timestamp)
        .into_iter()
        .chain(events.iter().any(|e| e.timestamp < window_start).then_some(window_start))
        .min()
        .unwrap_or(window_start);
    let observed = to_std(now - observed_from);
    let mtbf = if failures >= 2 {
        observed / failures
    } else {
        Duration::ZERO
    };

    UptimeStats {
        window,
        uptime_percent,
        mtbf,
        total_downtime,
        total_restarts: restarts,
        last_downtime,
    }
}
