//! 检测事件模块
//!
//! 提供逐条 URL 判定记录与各阶段耗时的发布-订阅机制。
//! Subscribers run synchronously on the publishing thread.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::detection::{DetectionMethod, DetectionResult, Label};

/// Pipeline stage, for timing and availability events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Rules,
    Retrieval,
    Classifier,
    DeepAnalysis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rules => "rules",
            Self::Retrieval => "retrieval",
            Self::Classifier => "classifier",
            Self::DeepAnalysis => "deep_analysis",
        }
    }
}

/// Detection event
#[derive(Debug, Clone)]
pub enum DetectionEvent {
    /// A URL entered Stage 1
    DetectionStarted {
        url: String,
        timestamp: DateTime<Utc>,
    },

    /// A rule decided the verdict
    RuleMatched {
        url: String,
        rule_id: String,
        attack_type: String,
        predicted: Label,
        timestamp: DateTime<Utc>,
    },

    /// The best retrieved case cleared the similarity threshold
    SimilarityShortcut {
        url: String,
        similarity: f32,
        label: String,
        timestamp: DateTime<Utc>,
    },

    /// One classifier call finished
    ModelInvoked {
        url: String,
        stage: Stage,
        with_context: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Stage-1 verdict produced
    DetectionCompleted {
        url: String,
        result: DetectionResult,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A stage switched itself off for the rest of the run
    StageDisabled {
        stage: Stage,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A URL could not be processed
    DetectionError {
        url: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl DetectionEvent {
    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            DetectionEvent::DetectionStarted { .. } => "detection_started",
            DetectionEvent::RuleMatched { .. } => "rule_matched",
            DetectionEvent::SimilarityShortcut { .. } => "similarity_shortcut",
            DetectionEvent::ModelInvoked { .. } => "model_invoked",
            DetectionEvent::DetectionCompleted { .. } => "detection_completed",
            DetectionEvent::StageDisabled { .. } => "stage_disabled",
            DetectionEvent::DetectionError { .. } => "detection_error",
        }
    }

    /// Event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DetectionEvent::DetectionStarted { timestamp, .. }
            | DetectionEvent::RuleMatched { timestamp, .. }
            | DetectionEvent::SimilarityShortcut { timestamp, .. }
            | DetectionEvent::ModelInvoked { timestamp, .. }
            | DetectionEvent::DetectionCompleted { timestamp, .. }
            | DetectionEvent::StageDisabled { timestamp, .. }
            | DetectionEvent::DetectionError { timestamp, .. } => *timestamp,
        }
    }
}

/// Event subscriber
pub trait EventSubscriber: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &DetectionEvent);

    fn name(&self) -> &str;

    /// Event types of interest; empty means all
    fn interested_events(&self) -> Vec<&'static str>;
}

/// Event bus with a bounded ring buffer of recent events
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
    event_buffer: Mutex<VecDeque<DetectionEvent>>,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            event_buffer: Mutex::new(VecDeque::with_capacity(buffer_size)),
            buffer_size,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    pub fn unsubscribe(&self, subscriber_name: &str) {
        self.subscribers.lock().retain(|s| s.name() != subscriber_name);
    }

    /// Publish an event to the buffer and every interested subscriber
    pub fn publish(&self, event: DetectionEvent) {
        if self.buffer_size > 0 {
            let mut buffer = self.event_buffer.lock();
            if buffer.len() >= self.buffer_size {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        // clone the list so subscribers may publish without deadlocking
        let subs: Vec<Arc<dyn EventSubscriber>> = self.subscribers.lock().clone();
        for subscriber in subs {
            let interested = subscriber.interested_events();
            if interested.is_empty() || interested.contains(&event.event_type()) {
                subscriber.on_event(&event);
            }
        }
    }

    /// The most recent `count` events, oldest first
    pub fn get_recent_events(&self, count: usize) -> Vec<DetectionEvent> {
        let buffer = self.event_buffer.lock();
        let start = buffer.len().saturating_sub(count);
        buffer.iter().skip(start).cloned().collect()
    }

    pub fn clear_buffer(&self) {
        self.event_buffer.lock().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Logging subscriber - writes decisions to the tracing log
pub struct LoggingSubscriber {
    name: String,
}

impl LoggingSubscriber {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EventSubscriber for LoggingSubscriber {
    fn on_event(&self, event: &DetectionEvent) {
        use tracing::{debug, info, warn};

        match event {
            DetectionEvent::DetectionCompleted { url, result, duration_ms, .. } => {
                info!(
                    url = %url,
                    predicted = %result.predicted,
                    attack_type = %result.attack_type,
                    method = %result.detection_method,
                    duration_ms = duration_ms,
                    "URL classified"
                );
            }
            DetectionEvent::RuleMatched { url, rule_id, attack_type, .. } => {
                debug!(url = %url, rule_id = %rule_id, attack_type = %attack_type, "Rule matched");
            }
            DetectionEvent::SimilarityShortcut { url, similarity, label, .. } => {
                debug!(url = %url, similarity = similarity, label = %label, "Similarity shortcut taken");
            }
            DetectionEvent::ModelInvoked { url, stage, with_context, duration_ms, .. } => {
                debug!(
                    url = %url,
                    stage = stage.as_str(),
                    with_context = with_context,
                    duration_ms = duration_ms,
                    "Classifier call finished"
                );
            }
            DetectionEvent::StageDisabled { stage, reason, .. } => {
                warn!(stage = stage.as_str(), reason = %reason, "Stage disabled for the rest of the run");
            }
            DetectionEvent::DetectionError { url, error, .. } => {
                warn!(url = %url, error = %error, "URL detection failed");
            }
            DetectionEvent::DetectionStarted { .. } => {}
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn interested_events(&self) -> Vec<&'static str> {
        vec![]
    }
}

/// Live counters collected from events
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionStatistics {
    pub total_detections: u64,
    pub malicious_detected: u64,
    pub detection_errors: u64,
    pub model_calls: u64,
    pub total_duration_ms: u64,
    pub by_method: BTreeMap<DetectionMethod, u64>,
}

impl DetectionStatistics {
    pub fn average_duration_ms(&self) -> f64 {
        if self.total_detections == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_detections as f64
        }
    }

    pub fn malicious_rate(&self) -> f64 {
        if self.total_detections == 0 {
            0.0
        } else {
            self.malicious_detected as f64 / self.total_detections as f64
        }
    }
}

/// Statistics subscriber - keeps running counters
pub struct StatisticsSubscriber {
    name: String,
    stats: Mutex<DetectionStatistics>,
}

impl StatisticsSubscriber {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats: Mutex::new(DetectionStatistics::default()),
        }
    }

    pub fn get_statistics(&self) -> DetectionStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = DetectionStatistics::default();
    }
}

impl EventSubscriber for StatisticsSubscriber {
    fn on_event(&self, event: &DetectionEvent) {
        let mut stats = self.stats.lock();

        match event {
            DetectionEvent::DetectionCompleted { result, duration_ms, .. } => {
                stats.total_detections += 1;
                stats.total_duration_ms += duration_ms;
                if result.is_malicious() {
                    stats.malicious_detected += 1;
                }
                *stats.by_method.entry(result.detection_method).or_default() += 1;
            }
            DetectionEvent::ModelInvoked { .. } => stats.model_calls += 1,
            DetectionEvent::DetectionError { .. } => stats.detection_errors += 1,
            _ => {}
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn interested_events(&self) -> Vec<&'static str> {
        vec!["detection_completed", "model_invoked", "detection_error"]
    }
}
