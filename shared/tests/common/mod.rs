#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crux_http::protocol::HttpRequest;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};

use shared::{
    AnalysisOrchestrator, CaptureError, EnrichmentError, FrameSource, HttpTransport, ImageSource,
    InferenceEngine, InferenceError, NetworkMode, PipelineConfig, RawOutput, Tensor,
    TransportResponse,
};

pub const ENDPOINT: &str = "https://insights.example.test/graphql";

pub const NUM_CLASSES: usize = 8;
pub const GLASS: usize = 1;
pub const BATTERY: usize = 6;

pub fn png(width: u32, height: u32) -> Bytes {
    let img = RgbImage::from_pixel(width, height, Rgb([90, 140, 60]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    Bytes::from(buf.into_inner())
}

/// One anchor: normalized `(cx, cy, w, h)`, class and score.
#[derive(Clone, Copy)]
pub struct Anchor {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub class: usize,
    pub score: f32,
}

/// Feature-major raw output for the given anchors.
pub fn raw_output(anchors: &[Anchor]) -> Vec<f32> {
    let n = anchors.len();
    let mut data = vec![0.0; (4 + NUM_CLASSES) * n];
    for (i, a) in anchors.iter().enumerate() {
        data[i] = a.cx;
        data[n + i] = a.cy;
        data[2 * n + i] = a.w;
        data[3 * n + i] = a.h;
        data[(4 + a.class) * n + i] = a.score;
    }
    data
}

/// A glass bottle in the middle of the model input.
pub fn centered_glass() -> Anchor {
    Anchor {
        cx: 0.5,
        cy: 0.5,
        w: 0.25,
        h: 0.25,
        class: GLASS,
        score: 0.9,
    }
}

pub struct FakeEngine {
    output: Vec<f32>,
    delay: Duration,
    fail: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEngine {
    pub fn new(output: Vec<f32>) -> Self {
        Self {
            output,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn infer(&self, input: &Tensor) -> Result<RawOutput, InferenceError> {
        assert!(!input.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::Engine("simulated failure".into()));
        }
        Ok(RawOutput::new(self.output.clone()))
    }
}

/// GraphQL insights server behind the host transport.
pub struct FakeEnrichment {
    delay: Duration,
    fail: AtomicBool,
    calls: AtomicUsize,
    inputs: Mutex<Vec<Value>>,
}

impl FakeEnrichment {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `variables.input` of the last request.
    pub fn last_input(&self) -> Option<Value> {
        self.inputs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl HttpTransport for FakeEnrichment {
    async fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, EnrichmentError> {
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, ENDPOINT);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let input = body["variables"]["input"].clone();
        let category = input["category"].as_str().unwrap_or_default().to_string();
        self.inputs.lock().unwrap().push(input);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Ok(TransportResponse {
                status: 502,
                body: b"bad gateway".to_vec(),
            });
        }

        let reply = json!({
            "data": {
                "AIInsights": {
                    "extra_facts": [format!("{category} fact")],
                    "simplified_summary": format!("About {category}"),
                    "motivation_text": "Every item counts",
                }
            }
        });
        Ok(TransportResponse {
            status: 200,
            body: serde_json::to_vec(&reply).unwrap(),
        })
    }
}

pub struct FakeFrames {
    frame: Bytes,
    captures: AtomicUsize,
}

impl FakeFrames {
    pub fn new(frame: Bytes) -> Self {
        Self {
            frame,
            captures: AtomicUsize::new(0),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for FakeFrames {
    async fn capture_frame(&self) -> Result<ImageSource, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(ImageSource::Bytes(self.frame.clone()))
    }
}

pub fn orchestrator(
    config: PipelineConfig,
    engine: Arc<FakeEngine>,
    enrichment: Option<Arc<FakeEnrichment>>,
    network: NetworkMode,
) -> AnalysisOrchestrator {
    match enrichment {
        Some(transport) => {
            let config = if config.enrichment_endpoint.is_some() {
                config
            } else {
                config.with_enrichment_endpoint(ENDPOINT)
            };
            AnalysisOrchestrator::builder(config, engine)
                .http(transport)
                .network(network)
                .build()
        }
        None => AnalysisOrchestrator::builder(config, engine)
            .network(network)
            .build(),
    }
}
