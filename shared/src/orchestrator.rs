//! Host side of the analysis core: single-shot calls and the live polling loop.
//!
//! The orchestrator runs capture, preprocessing, inference and decoding, then
//! hands each outcome to the Crux [`App`] as an [`Event`]. It carries out the
//! effects the core asks for: `Render` publishes a fresh [`AnalysisView`] to
//! subscribers and `Http` goes out through the configured [`HttpTransport`].
//!
//! The session generation lives in the core. Work stamped with an older
//! generation is discarded instead of being shown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use crux_core::{Core, Request};
use crux_http::protocol::HttpRequest;
use metrics::{counter, histogram};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::analysis::{AnalysisResult, StageTimings};
use crate::app::{App, Capabilities, CoreSettings, Effect, Event};
use crate::capture::{FrameSource, ImageLoader, ImageSource, LocalImageLoader};
use crate::config::PipelineConfig;
use crate::enrichment::{to_http_result, EnrichmentError, HttpTransport};
use crate::error::AnalysisError;
use crate::image_processing::ImagePreprocessor;
use crate::inference::InferenceEngine;
use crate::knowledge::RecyclingKnowledgeMapper;
use crate::model::{AnalysisMode, AnalysisStage, AnalysisView, UserFacingError};
use crate::nms::NonMaxSuppressor;
use crate::vision::{CoordinateRemapper, DetectionDecoder};

pub use crate::model::NetworkMode;

pub struct OrchestratorBuilder {
    config: PipelineConfig,
    engine: Arc<dyn InferenceEngine>,
    loader: Option<Arc<dyn ImageLoader>>,
    transport: Option<Arc<dyn HttpTransport>>,
    network: NetworkMode,
}

impl OrchestratorBuilder {
    pub fn loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Transport for enrichment requests. Without one, or without an
    /// endpoint in the config, results stay local.
    pub fn http(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn build(self) -> AnalysisOrchestrator {
        let config = self.config.validated();
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(LocalImageLoader::new(config.max_input_bytes)));

        let core: Core<Effect, App> = Core::new::<Capabilities>();
        let (view, _) = watch::channel(core.view());
        let settings = CoreSettings {
            endpoint: self
                .transport
                .as_ref()
                .and(config.enrichment_endpoint.clone()),
            cache_capacity: config.enrichment_cache_capacity,
            retry_after_ms: config.enrichment_retry_after_ms,
        };

        let inner = Arc::new(Inner {
            preprocessor: ImagePreprocessor::new(&config),
            decoder: DetectionDecoder::new(&config),
            nms: NonMaxSuppressor::new(&config),
            remapper: CoordinateRemapper::new(config.remap_strategy),
            mapper: RecyclingKnowledgeMapper::new(config.language),
            engine: self.engine,
            engine_gate: Mutex::new(()),
            loader,
            transport: self.transport,
            core: std::sync::Mutex::new(core),
            view,
            clock: tokio::time::Instant::now(),
            config,
        });
        inner.dispatch(Event::Configure(settings));
        inner.dispatch(Event::NetworkChanged(self.network));

        AnalysisOrchestrator { inner }
    }
}

/// Drives the detection pipeline and publishes [`AnalysisView`] snapshots.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    preprocessor: ImagePreprocessor,
    decoder: DetectionDecoder,
    nms: NonMaxSuppressor,
    remapper: CoordinateRemapper,
    mapper: RecyclingKnowledgeMapper,
    engine: Arc<dyn InferenceEngine>,
    /// Held for the duration of one inference call.
    engine_gate: Mutex<()>,
    loader: Arc<dyn ImageLoader>,
    transport: Option<Arc<dyn HttpTransport>>,
    /// Never held across an await.
    core: std::sync::Mutex<Core<Effect, App>>,
    view: watch::Sender<AnalysisView>,
    clock: tokio::time::Instant,
}

impl AnalysisOrchestrator {
    pub fn builder(config: PipelineConfig, engine: Arc<dyn InferenceEngine>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            engine,
            loader: None,
            transport: None,
            network: NetworkMode::Online,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> watch::Receiver<AnalysisView> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> AnalysisView {
        self.inner.view.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.inner.view.borrow().network
    }

    pub fn set_network_mode(&self, network: NetworkMode) {
        self.inner.dispatch(Event::NetworkChanged(network));
        info!(?network, "network mode changed");
    }

    /// Optional hint sent along with enrichment requests. Blank text clears it.
    pub fn set_user_text(&self, text: Option<String>) {
        self.inner.dispatch(Event::UserTextChanged(text));
    }

    /// Starts a new session generation. Work from earlier generations is
    /// discarded when it completes; a running live loop stops at its next tick.
    pub fn set_mode(&self, mode: AnalysisMode) -> u64 {
        let generation = self.inner.advance(Event::ModeChanged(mode));
        info!(?mode, generation, "analysis mode changed");
        generation
    }

    /// Abandons whatever is in flight without changing the mode.
    pub fn cancel(&self) -> u64 {
        let generation = self.inner.advance(Event::Cancel);
        info!(generation, "analysis cancelled");
        generation
    }

    #[instrument(skip(self))]
    pub async fn warmup(&self) -> Result<(), AnalysisError> {
        let _gate = self.inner.engine_gate.lock().await;
        let timeout = self.inner.config.inference_timeout();
        tokio::time::timeout(timeout, self.inner.engine.warmup())
            .await
            .map_err(|_| AnalysisError::Timeout(timeout))??;
        self.inner.dispatch(Event::ModelReady);
        debug!(model = self.inner.engine.name(), "model warmed up");
        Ok(())
    }

    /// Runs one image through the pipeline, waiting for the engine if it is
    /// busy with another call.
    pub async fn analyze(&self, source: ImageSource) -> Result<AnalysisResult, AnalysisError> {
        self.analyze_with(source, None).await
    }

    /// Like [`analyze`](Self::analyze) but fails with [`AnalysisError::Busy`]
    /// instead of queueing behind an in-flight inference.
    pub async fn try_analyze(&self, source: ImageSource) -> Result<AnalysisResult, AnalysisError> {
        let gate = self
            .inner
            .engine_gate
            .try_lock()
            .map_err(|_| AnalysisError::Busy)?;
        self.analyze_with(source, Some(gate)).await
    }

    #[instrument(skip(self, source, gate), fields(kind = source.kind()))]
    async fn analyze_with(
        &self,
        source: ImageSource,
        gate: Option<MutexGuard<'_, ()>>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let inner = &self.inner;
        let generation = inner.generation();
        let start = Instant::now();
        counter!("analysis.requests", "mode" => "single").increment(1);

        let outcome = async {
            inner.dispatch(Event::StageChanged {
                generation,
                stage: AnalysisStage::Capturing,
            });
            let mut result = inner.run_pipeline(&source, generation, gate).await?;
            result.timings.total_ms = elapsed_ms(start);
            inner.present(&mut result, generation).await?;
            result.timings.total_ms = elapsed_ms(start);
            Ok(result)
        }
        .await;

        histogram!("analysis.duration_ms").record(elapsed_ms(start));

        match &outcome {
            Ok(_) => {}
            Err(AnalysisError::Stale) => {
                counter!("analysis.stale").increment(1);
                debug!(generation, "discarded stale single-shot result");
            }
            Err(e) => {
                counter!("analysis.errors", "code" => e.code()).increment(1);
                warn!(error = %e, "analysis failed");
                inner.dispatch(Event::AnalysisFailed {
                    generation,
                    error: UserFacingError::from(e),
                    silent: false,
                });
            }
        }

        outcome
    }

    /// Enters live mode and starts polling `frames` every `live_interval`.
    ///
    /// A tick that fires while the previous frame is still being analyzed is
    /// skipped, so at most one capture/inference cycle is in flight.
    pub fn start_live(&self, frames: Arc<dyn FrameSource>) -> LiveSession {
        let generation = self.set_mode(AnalysisMode::Live);
        let in_flight = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(live_loop(
            Arc::clone(&self.inner),
            frames,
            generation,
            Arc::clone(&in_flight),
        ));

        info!(generation, interval_ms = self.inner.config.live_interval_ms, "live mode started");

        LiveSession {
            inner: Arc::clone(&self.inner),
            generation,
            in_flight,
            handle: Some(handle),
        }
    }
}

impl Inner {
    fn lock_core(&self) -> std::sync::MutexGuard<'_, Core<Effect, App>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.lock_core().view().generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn check_current(&self, generation: u64) -> Result<(), AnalysisError> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(AnalysisError::Stale)
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    /// Feeds `event` to the core, publishes any render and returns the HTTP
    /// requests still to be carried out.
    fn dispatch(&self, event: Event) -> Vec<Request<HttpRequest>> {
        let effects = self.lock_core().process_event(event);
        self.handle_effects(effects)
    }

    /// Dispatches a generation-bumping event and returns the new generation.
    fn advance(&self, event: Event) -> u64 {
        let (effects, generation) = {
            let core = self.lock_core();
            let effects = core.process_event(event);
            (effects, core.view().generation)
        };
        self.handle_effects(effects);
        generation
    }

    fn handle_effects(&self, effects: Vec<Effect>) -> Vec<Request<HttpRequest>> {
        let mut requests = Vec::new();
        for effect in effects {
            match effect {
                Effect::Render(_) => {
                    let view = self.lock_core().view();
                    self.view.send_replace(view);
                }
                Effect::Http(request) => requests.push(request),
            }
        }
        requests
    }

    /// Executes requests and resolves them back into the core, including any
    /// follow-up requests the core issues in response.
    async fn fulfil(&self, requests: Vec<Request<HttpRequest>>) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let timeout = self.config.enrichment_timeout();
        let mut queue = VecDeque::from(requests);

        while let Some(mut request) = queue.pop_front() {
            let reply = tokio::time::timeout(timeout, transport.execute(&request.operation))
                .await
                .unwrap_or_else(|_| {
                    Err(EnrichmentError::Timeout {
                        timeout_ms: self.config.enrichment_timeout_ms,
                    })
                });
            let effects = self.lock_core().resolve(&mut request, to_http_result(reply));
            queue.extend(self.handle_effects(effects));
        }
    }

    /// Hands a local result to the core and waits for the enrichment it
    /// starts, then copies whatever the core attached back into `result`.
    async fn present(
        &self,
        result: &mut AnalysisResult,
        generation: u64,
    ) -> Result<(), AnalysisError> {
        self.check_current(generation)?;
        let requests = self.dispatch(Event::InferenceDone {
            generation,
            result: Box::new(result.clone()),
            now_ms: self.now_ms(),
        });

        let enriching = !requests.is_empty()
            || self.stage_of(generation) == Some(AnalysisStage::Enriching);
        if enriching {
            let started = Instant::now();
            if requests.is_empty() {
                self.settle(generation, &result.result_hash).await;
            } else {
                self.fulfil(requests).await;
            }
            result.timings.enrichment_ms = Some(elapsed_ms(started));
        }

        self.check_current(generation)?;
        let view = self.view.borrow();
        if let Some(shown) = view.result.as_ref() {
            if shown.result_hash == result.result_hash {
                result.recycling_plan.clone_from(&shown.recycling_plan);
                result.models.clone_from(&shown.models);
            }
        }
        Ok(())
    }

    fn stage_of(&self, generation: u64) -> Option<AnalysisStage> {
        let view = self.view.borrow();
        (view.generation == generation).then_some(view.stage)
    }

    /// Waits for an enrichment another call already started for this result.
    async fn settle(&self, generation: u64, result_hash: &str) {
        let mut updates = self.view.subscribe();
        let settled = updates.wait_for(|v| {
            v.generation != generation
                || v.stage != AnalysisStage::Enriching
                || v.result.as_ref().map_or(true, |r| r.result_hash != result_hash)
        });
        if tokio::time::timeout(self.config.enrichment_timeout(), settled)
            .await
            .is_err()
        {
            debug!(generation, "stopped waiting for shared enrichment");
        }
    }

    /// Load, preprocess, infer, decode. Produces the local-only result.
    async fn run_pipeline(
        &self,
        source: &ImageSource,
        generation: u64,
        gate: Option<MutexGuard<'_, ()>>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let bytes = self.loader.load(source).await?;
        self.check_current(generation)?;

        self.stage(generation, AnalysisStage::Preprocessing);
        let started = Instant::now();
        let (tensor, meta) = self.preprocessor.prepare_async(bytes).await?;
        let preprocess_ms = elapsed_ms(started);
        self.check_current(generation)?;

        self.stage(generation, AnalysisStage::Inferring);
        let started = Instant::now();
        let raw = {
            let _gate = match gate {
                Some(held) => held,
                None => self.engine_gate.lock().await,
            };
            let timeout = self.config.inference_timeout();
            tokio::time::timeout(timeout, self.engine.infer(&tensor))
                .await
                .map_err(|_| AnalysisError::Timeout(timeout))??
        };
        let inference_ms = elapsed_ms(started);
        self.check_current(generation)?;

        self.stage(generation, AnalysisStage::Decoding);
        let started = Instant::now();
        let candidates = self.decoder.decode(&raw, self.config.num_classes)?;
        let (survivors, suppressed) = self.nms.apply(&candidates);
        let detections = survivors
            .iter()
            .map(|c| {
                self.remapper
                    .remap(c, &meta, meta.original_width, meta.original_height)
            })
            .collect::<Vec<_>>();
        let postprocess_ms = elapsed_ms(started);

        debug!(
            candidates = suppressed.considered,
            kept = detections.len(),
            truncated = suppressed.truncated,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
            "pipeline finished"
        );

        Ok(AnalysisResult::local(
            detections,
            &self.mapper,
            suppressed.considered,
            suppressed.truncated,
            StageTimings {
                preprocess_ms,
                inference_ms,
                postprocess_ms,
                enrichment_ms: None,
                total_ms: preprocess_ms + inference_ms + postprocess_ms,
            },
        )
        .with_vision_model(self.engine.name()))
    }

    fn stage(&self, generation: u64, stage: AnalysisStage) {
        self.dispatch(Event::StageChanged { generation, stage });
    }

    async fn live_cycle(self: Arc<Self>, frames: Arc<dyn FrameSource>, generation: u64) {
        counter!("live.frames").increment(1);
        let start = Instant::now();

        self.dispatch(Event::FrameTick { generation });
        let outcome = async {
            let source = frames.capture_frame().await?;
            self.run_pipeline(&source, generation, None).await
        }
        .await;

        histogram!("analysis.duration_ms").record(elapsed_ms(start));

        let mut result = match outcome {
            Ok(result) => result,
            Err(AnalysisError::Stale) => {
                counter!("live.discarded_results").increment(1);
                return;
            }
            Err(e) => {
                // live mode keeps the last overlay and tries again next tick
                counter!("analysis.errors", "code" => e.code()).increment(1);
                warn!(error = %e, retryable = e.is_retryable(), "live frame failed");
                self.dispatch(Event::AnalysisFailed {
                    generation,
                    error: UserFacingError::from(&e),
                    silent: true,
                });
                return;
            }
        };
        result.timings.total_ms = elapsed_ms(start);

        if !self.is_current(generation) {
            counter!("live.discarded_results").increment(1);
            return;
        }
        let requests = self.dispatch(Event::InferenceDone {
            generation,
            result: Box::new(result),
            now_ms: self.now_ms(),
        });

        if !requests.is_empty() {
            let inner = Arc::clone(&self);
            tokio::spawn(async move { inner.fulfil(requests).await });
        }
    }
}

/// Clears the in-flight flag when a live cycle ends, including by panic.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn live_loop(
    inner: Arc<Inner>,
    frames: Arc<dyn FrameSource>,
    generation: u64,
    in_flight: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(inner.config.live_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !inner.is_current(generation) {
            debug!(generation, "live loop superseded");
            break;
        }
        if in_flight.swap(true, Ordering::AcqRel) {
            counter!("live.skipped_ticks").increment(1);
            continue;
        }

        let guard = InFlight(Arc::clone(&in_flight));
        let cycle = Arc::clone(&inner).live_cycle(Arc::clone(&frames), generation);
        tokio::spawn(async move {
            let _guard = guard;
            cycle.await;
        });
    }
}

/// Handle to a running live loop. Stopping or dropping it ends the loop and
/// invalidates any frame still in flight.
pub struct LiveSession {
    inner: Arc<Inner>,
    generation: u64,
    in_flight: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LiveSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_current(self.generation)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_frame_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
        // the core ignores this when a newer session already owns the generation
        self.inner.dispatch(Event::LiveStopped {
            generation: self.generation,
        });
        info!(generation = self.generation, "live mode stopped");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
