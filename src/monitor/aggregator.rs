use crate::monitor::types::{HistoryWindow, MetricEvent, Observation, SourceSeries, StatusCount};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub type SharedAggregator = Arc<Mutex<Aggregator>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatorSnapshot {
    pub revision: u64,
    pub historical: HashMap<String, SourceSeries>,
    pub live: HashMap<String, SourceSeries>,
    pub distribution: HashMap<String, Vec<StatusCount>>,
}

/// Per-source state for both feeds. `historical` and `distribution` are only
/// ever replaced; `live` is only ever appended to and trimmed.
#[derive(Debug)]
pub struct Aggregator {
    live_capacity: usize,
    revision: u64,
    history_ticket: u64,
    historical: HashMap<String, SourceSeries>,
    live: HashMap<String, VecDeque<Observation>>,
    distribution: HashMap<String, Vec<StatusCount>>,
}

impl Aggregator {
    pub fn new(live_capacity: usize) -> Self {
        Self {
            live_capacity: live_capacity.max(1),
            revision: 0,
            history_ticket: 0,
            historical: HashMap::new(),
            live: HashMap::new(),
            distribution: HashMap::new(),
        }
    }

    pub fn shared(live_capacity: usize) -> SharedAggregator {
        Arc::new(Mutex::new(Self::new(live_capacity)))
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Appends one parsed batch, keeping arrival order per source and evicting
    /// the oldest observations beyond capacity.
    pub fn apply_live(&mut self, events: &[MetricEvent]) {
        if events.is_empty() {
            return;
        }

        let capacity = self.live_capacity;
        for event in events {
            let buffer = self
                .live
                .entry(event.source_key.clone())
                .or_insert_with(|| VecDeque::with_capacity(capacity));
            buffer.push_back(event.observation());
            if buffer.len() > capacity {
                let overflow = buffer.len() - capacity;
                buffer.drain(..overflow);
            }
        }
        self.bump_revision();
    }

    pub fn replace_historical(
        &mut self,
        source_key: &str,
        label: &str,
        observations: Vec<Observation>,
    ) {
        self.historical.insert(
            source_key.to_string(),
            SourceSeries {
                source_key: source_key.to_string(),
                origin_label: label.to_string(),
                observations,
            },
        );
        self.bump_revision();
    }

    pub fn replace_distribution(&mut self, source_key: &str, distribution: Vec<StatusCount>) {
        self.distribution.insert(source_key.to_string(), distribution);
        self.bump_revision();
    }

    /// Replaces both historical mappings with one query result. Sources missing
    /// from the result are dropped.
    pub fn apply_history_window(&mut self, window: HistoryWindow) {
        self.historical = window.series;
        self.distribution = window.distribution;
        self.bump_revision();
    }

    /// Issues the sequence number for a new history request. Every ticket
    /// issued earlier becomes stale, whether or not this request succeeds.
    pub fn issue_history_ticket(&mut self) -> u64 {
        self.history_ticket = self.history_ticket.wrapping_add(1);
        self.history_ticket
    }

    /// Applies `window` only when `ticket` is the newest ticket issued.
    pub fn apply_history_window_if_current(&mut self, ticket: u64, window: HistoryWindow) -> bool {
        if ticket != self.history_ticket {
            return false;
        }
        self.apply_history_window(window);
        true
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        let live = self
            .live
            .iter()
            .map(|(source_key, buffer)| {
                (
                    source_key.clone(),
                    SourceSeries {
                        source_key: source_key.clone(),
                        origin_label: source_key.clone(),
                        observations: buffer.iter().copied().collect(),
                    },
                )
            })
            .collect();

        AggregatorSnapshot {
            revision: self.revision,
            historical: self.historical.clone(),
            live,
            distribution: self.distribution.clone(),
        }
    }

    fn bump_revision(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}
