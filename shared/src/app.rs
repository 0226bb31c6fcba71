//! Crux core of the analysis screen.
//!
//! The core owns the state the shell renders: session generation, stage, the
//! result on screen and the enrichment memo. Pipeline stages run on the host
//! and report back through [`Event`]s. Insights are fetched with the
//! `crux_http` capability and every view change goes out through `Render`.
//!
//! A session generation is bumped by [`Event::ModeChanged`], [`Event::Cancel`]
//! and [`Event::LiveStopped`]. Host events stamped with an older generation
//! are dropped, and so are insights that arrive for a result no longer shown.

use std::num::NonZeroUsize;

use crux_core::render::Render;
use crux_http::Http;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::AnalysisResult;
use crate::config::{DEFAULT_ENRICHMENT_CACHE_CAPACITY, DEFAULT_ENRICHMENT_RETRY_AFTER_MS};
use crate::enrichment::{
    encode_request, insights_from_reply, normalize_user_text, AiInsights, EnrichmentError,
    EnrichmentKey,
};
use crate::model::{AnalysisMode, AnalysisStage, AnalysisView, NetworkMode, UserFacingError};

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub http: Http<Event>,
    pub render: Render<Event>,
}

/// Enrichment settings handed over by the host once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreSettings {
    /// GraphQL endpoint; `None` keeps the core fully offline.
    pub endpoint: Option<String>,
    pub cache_capacity: usize,
    pub retry_after_ms: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            cache_capacity: DEFAULT_ENRICHMENT_CACHE_CAPACITY,
            retry_after_ms: DEFAULT_ENRICHMENT_RETRY_AFTER_MS,
        }
    }
}

impl CoreSettings {
    fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[derive(Serialize, Deserialize)]
pub enum Event {
    Configure(CoreSettings),
    ModeChanged(AnalysisMode),
    Cancel,
    /// A live session ended; ignored when a newer session already took over.
    LiveStopped {
        generation: u64,
    },
    NetworkChanged(NetworkMode),
    UserTextChanged(Option<String>),
    ModelReady,

    FrameTick {
        generation: u64,
    },
    StageChanged {
        generation: u64,
        stage: AnalysisStage,
    },
    InferenceDone {
        generation: u64,
        result: Box<AnalysisResult>,
        /// Host clock, used for the enrichment retry window.
        now_ms: u64,
    },
    /// `silent` failures drop back to idle and keep the last overlay.
    AnalysisFailed {
        generation: u64,
        error: UserFacingError,
        silent: bool,
    },

    #[serde(skip)]
    InsightsFetched {
        generation: u64,
        key: EnrichmentKey,
        result: Box<crux_http::Result<crux_http::Response<Vec<u8>>>>,
    },
}

#[derive(Debug, Clone)]
enum Insight {
    Pending { since_ms: u64 },
    Ready(AiInsights),
    Failed { at_ms: u64 },
}

pub struct Model {
    view: AnalysisView,
    settings: CoreSettings,
    user_text: Option<String>,
    insights: LruCache<EnrichmentKey, Insight>,
}

impl Default for Model {
    fn default() -> Self {
        let settings = CoreSettings::default();
        Self {
            view: AnalysisView::default(),
            insights: LruCache::new(settings.capacity()),
            settings,
            user_text: None,
        }
    }
}

impl Model {
    pub fn generation(&self) -> u64 {
        self.view.generation
    }

    pub fn user_text(&self) -> Option<&str> {
        self.user_text.as_deref()
    }

    /// Number of memoized enrichment lookups, pending ones included.
    pub fn cached_insights(&self) -> usize {
        self.insights.len()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.view.generation == generation
    }

    fn next_generation(&mut self) {
        self.view.generation += 1;
        self.view.stage = AnalysisStage::Idle;
        self.view.error = None;
    }

    fn enrichment_key(&self, result: &AnalysisResult) -> Option<EnrichmentKey> {
        if !self.view.network.is_online() || self.settings.endpoint.is_none() {
            return None;
        }
        EnrichmentKey::for_detections(&result.detections)
            .map(|key| key.with_user_text(self.user_text.as_deref()))
    }

    fn shows(&self, generation: u64, key: &EnrichmentKey) -> bool {
        self.is_current(generation)
            && self
                .view
                .result
                .as_ref()
                .is_some_and(|r| r.result_hash == key.result_hash)
    }
}

#[derive(Default)]
pub struct App;

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = AnalysisView;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        match event {
            Event::Configure(settings) => {
                model.insights.resize(settings.capacity());
                model.settings = settings;
            }
            Event::ModeChanged(mode) => {
                model.next_generation();
                model.view.mode = mode;
                caps.render.render();
            }
            Event::Cancel => {
                model.next_generation();
                caps.render.render();
            }
            Event::LiveStopped { generation } => {
                if model.is_current(generation) {
                    model.next_generation();
                    model.view.mode = AnalysisMode::SingleShot;
                    caps.render.render();
                }
            }
            Event::NetworkChanged(network) => {
                if model.view.network != network {
                    model.view.network = network;
                    caps.render.render();
                }
            }
            Event::UserTextChanged(text) => {
                model.user_text = normalize_user_text(text.as_deref());
            }
            Event::ModelReady => {
                model.view.model_ready = true;
                caps.render.render();
            }
            Event::FrameTick { generation } => {
                if model.view.mode == AnalysisMode::Live {
                    set_stage(model, generation, AnalysisStage::Capturing, caps);
                }
            }
            Event::StageChanged { generation, stage } => {
                set_stage(model, generation, stage, caps);
            }
            Event::InferenceDone {
                generation,
                result,
                now_ms,
            } => {
                if model.is_current(generation) {
                    show_result(model, *result, generation, now_ms, caps);
                } else {
                    metrics::counter!("analysis.stale").increment(1);
                    debug!(generation, current = model.view.generation, "dropped stale result");
                }
            }
            Event::AnalysisFailed {
                generation,
                error,
                silent,
            } => {
                if !model.is_current(generation) {
                    return;
                }
                if silent {
                    model.view.stage = AnalysisStage::Idle;
                } else {
                    model.view.stage = AnalysisStage::Error;
                    model.view.error = Some(error);
                }
                caps.render.render();
            }
            Event::InsightsFetched {
                generation,
                key,
                result,
            } => insights_fetched(model, generation, key, *result, caps),
        }
    }

    fn view(&self, model: &Model) -> AnalysisView {
        model.view.clone()
    }
}

/// Renders only on an actual change.
fn set_stage(model: &mut Model, generation: u64, stage: AnalysisStage, caps: &Capabilities) {
    if model.is_current(generation) && model.view.stage != stage {
        model.view.stage = stage;
        caps.render.render();
    }
}

fn show_result(
    model: &mut Model,
    mut result: AnalysisResult,
    generation: u64,
    now_ms: u64,
    caps: &Capabilities,
) {
    let enriching = match model.enrichment_key(&result) {
        Some(key) => enrich(model, &mut result, key, generation, now_ms, caps),
        None => false,
    };

    model.view.stage = if enriching {
        AnalysisStage::Enriching
    } else {
        AnalysisStage::Done
    };
    model.view.result = Some(result);
    model.view.error = None;
    model.view.frames_analyzed += 1;
    caps.render.render();
}

/// Serves `key` from the memo or issues a fetch. Returns whether insights
/// are still on their way.
fn enrich(
    model: &mut Model,
    result: &mut AnalysisResult,
    key: EnrichmentKey,
    generation: u64,
    now_ms: u64,
    caps: &Capabilities,
) -> bool {
    match model.insights.get(&key) {
        Some(Insight::Ready(insights)) => {
            metrics::counter!("enrichment.deduplicated").increment(1);
            result.attach_insights(&key.category, insights);
            return false;
        }
        Some(Insight::Pending { .. }) => {
            metrics::counter!("enrichment.deduplicated").increment(1);
            return true;
        }
        Some(Insight::Failed { at_ms })
            if now_ms.saturating_sub(*at_ms) < model.settings.retry_after_ms =>
        {
            debug!(category = %key.category, "enrichment failed recently, not retrying yet");
            return false;
        }
        _ => {}
    }

    let Some(endpoint) = model.settings.endpoint.as_deref() else {
        return false;
    };
    let body = match encode_request(&key) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "could not encode enrichment request");
            return false;
        }
    };

    metrics::counter!("enrichment.requests").increment(1);
    debug!(category = %key.category, hash = %key.result_hash, "requesting insights");
    model
        .insights
        .put(key.clone(), Insight::Pending { since_ms: now_ms });

    caps.http
        .post(endpoint)
        .header("Content-Type", "application/json")
        .body_bytes(body)
        .send(move |result| Event::InsightsFetched {
            generation,
            key,
            result: Box::new(result),
        });
    true
}

fn insights_fetched(
    model: &mut Model,
    generation: u64,
    key: EnrichmentKey,
    result: crux_http::Result<crux_http::Response<Vec<u8>>>,
    caps: &Capabilities,
) {
    let outcome = match result {
        Ok(mut response) => {
            let status: u16 = response.status().into();
            let body = response.take_body().unwrap_or_default();
            insights_from_reply(status, &body)
        }
        Err(e) => Err(EnrichmentError::Transport {
            reason: e.to_string(),
        }),
    };

    let since_ms = match model.insights.peek(&key) {
        Some(Insight::Pending { since_ms }) => *since_ms,
        _ => 0,
    };
    let shown = model.shows(generation, &key);

    match outcome {
        Ok(insights) => {
            if shown {
                if let Some(current) = model.view.result.as_mut() {
                    current.attach_insights(&key.category, &insights);
                }
            }
            model.insights.put(key, Insight::Ready(insights));
        }
        Err(e) => {
            metrics::counter!("enrichment.failures").increment(1);
            warn!(error = %e, retryable = e.is_retryable(), "enrichment failed");
            model.insights.put(key, Insight::Failed { at_ms: since_ms });
        }
    }

    if !shown {
        metrics::counter!("enrichment.discarded").increment(1);
        return;
    }
    if model.view.stage == AnalysisStage::Enriching {
        model.view.stage = AnalysisStage::Done;
    }
    caps.render.render();
}
