mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use shared::{AnalysisMode, AnalysisStage, NetworkMode, PipelineConfig};

fn live_config(interval_ms: u64) -> PipelineConfig {
    PipelineConfig::default().with_live_interval(Duration::from_millis(interval_ms))
}

#[tokio::test(start_paused = true)]
async fn slow_inference_never_overlaps() {
    let engine = Arc::new(
        FakeEngine::new(raw_output(&[centered_glass()])).with_delay(Duration::from_millis(300)),
    );
    let frames = Arc::new(FakeFrames::new(png(64, 64)));
    let orch = orchestrator(live_config(50), engine.clone(), None, NetworkMode::Offline);

    let session = orch.start_live(frames.clone());
    tokio::time::sleep(Duration::from_millis(3_000)).await;
    session.stop();

    // ceil(3000 / 300) + 1
    assert!(engine.calls() <= 11, "calls = {}", engine.calls());
    assert!(engine.calls() >= 5, "calls = {}", engine.calls());
    assert_eq!(engine.max_in_flight(), 1);
    assert!(frames.captures() >= engine.calls());
}

#[tokio::test(start_paused = true)]
async fn live_results_update_the_view() {
    let engine = Arc::new(FakeEngine::new(raw_output(&[centered_glass()])));
    let frames = Arc::new(FakeFrames::new(png(400, 300)));
    let orch = orchestrator(live_config(100), engine.clone(), None, NetworkMode::Offline);
    let mut updates = orch.subscribe();

    let session = orch.start_live(frames);
    assert_eq!(orch.view().mode, AnalysisMode::Live);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            updates.changed().await.unwrap();
            if updates.borrow().frames_analyzed >= 3 {
                break;
            }
        }
    })
    .await
    .unwrap();

    let view = orch.view();
    assert_eq!(view.generation, session.generation());
    assert_eq!(view.detection_count(), 1);
    assert!(session.is_active());
    drop(session);

    assert_eq!(orch.view().mode, AnalysisMode::SingleShot);
}

#[tokio::test(start_paused = true)]
async fn identical_frames_enrich_once() {
    let engine = Arc::new(
        FakeEngine::new(raw_output(&[centered_glass()])).with_delay(Duration::from_millis(200)),
    );
    let enrichment = Arc::new(FakeEnrichment::new().with_delay(Duration::from_millis(400)));
    let frames = Arc::new(FakeFrames::new(png(200, 200)));
    let orch = orchestrator(
        live_config(50),
        engine.clone(),
        Some(enrichment.clone()),
        NetworkMode::Online,
    );

    let session = orch.start_live(frames);
    // off the 50ms grid, so no frame completes at the instant we look
    tokio::time::sleep(Duration::from_millis(2_125)).await;

    assert!(engine.calls() > 5);
    assert_eq!(enrichment.calls(), 1);

    let view = orch.view();
    let item = &view.result.as_ref().unwrap().recycling_plan[0];
    assert_eq!(
        item.ai_insights.as_ref().map(|i| i.simplified_summary.as_str()),
        Some("About glass")
    );
    session.stop();
}

#[tokio::test(start_paused = true)]
async fn offline_live_mode_makes_no_network_calls() {
    let engine = Arc::new(FakeEngine::new(raw_output(&[centered_glass()])));
    let enrichment = Arc::new(FakeEnrichment::new());
    let frames = Arc::new(FakeFrames::new(png(200, 200)));
    let orch = orchestrator(
        live_config(50),
        engine.clone(),
        Some(enrichment.clone()),
        NetworkMode::Offline,
    );

    let session = orch.start_live(frames);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    session.stop();

    assert!(engine.calls() > 1);
    assert_eq!(enrichment.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn stopping_discards_the_in_flight_frame() {
    let engine = Arc::new(
        FakeEngine::new(raw_output(&[centered_glass()])).with_delay(Duration::from_millis(300)),
    );
    let frames = Arc::new(FakeFrames::new(png(64, 64)));
    let orch = orchestrator(live_config(50), engine.clone(), None, NetworkMode::Offline);

    let session = orch.start_live(frames);
    while engine.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    session.stop();

    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let view = orch.view();
    assert_eq!(engine.calls(), 1);
    assert!(view.result.is_none());
    assert_eq!(view.frames_analyzed, 0);
    assert_eq!(view.stage, AnalysisStage::Idle);
    assert_eq!(view.mode, AnalysisMode::SingleShot);
}

#[tokio::test(start_paused = true)]
async fn switching_to_single_shot_ends_the_loop() {
    let engine = Arc::new(FakeEngine::new(raw_output(&[centered_glass()])));
    let frames = Arc::new(FakeFrames::new(png(64, 64)));
    let orch = orchestrator(live_config(50), engine.clone(), None, NetworkMode::Offline);

    let session = orch.start_live(frames);
    tokio::time::sleep(Duration::from_millis(500)).await;
    orch.set_mode(AnalysisMode::SingleShot);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let calls = engine.calls();
    assert!(!session.is_active());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.calls(), calls);
    assert_eq!(orch.view().mode, AnalysisMode::SingleShot);

    // dropping a superseded session leaves the newer generation alone
    let generation = orch.generation();
    drop(session);
    assert_eq!(orch.generation(), generation);
}

#[tokio::test(start_paused = true)]
async fn live_failures_stay_silent_and_retry() {
    let engine = Arc::new(FakeEngine::new(raw_output(&[centered_glass()])));
    engine.set_failing(true);
    let frames = Arc::new(FakeFrames::new(png(64, 64)));
    let orch = orchestrator(live_config(50), engine.clone(), None, NetworkMode::Offline);

    let session = orch.start_live(frames);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let view = orch.view();
    assert!(engine.calls() > 1);
    assert!(view.error.is_none());
    assert_ne!(view.stage, AnalysisStage::Error);
    assert!(view.result.is_none());

    engine.set_failing(false);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(orch.view().detection_count(), 1);
    session.stop();
}
