//! Test support: a scriptable mock model engine and a static loader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use vision_serve_common::Category;

use crate::engine::{EngineError, InferenceInput, ItemOutcome, ModelEngine, ModelLoader};

/// What the mock engine does when asked to predict.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Classify every input deterministically from its payload bytes.
    Classify,
    /// Fail the whole batch with an execution error.
    FailBatch(String),
    /// Classify, but fail the item at `index` with a per-item error.
    FailItem { index: usize, message: String },
    /// Return one result fewer than the input count (contract violation).
    ShortResults,
    /// Hang on the first `n` calls, classify afterwards.
    HangTimes(usize),
}

/// A mock model engine with scriptable behavior.
pub struct MockEngine {
    model_id: String,
    behavior: MockBehavior,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<Uuid>>,
}

impl MockEngine {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            behavior: MockBehavior::Classify,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Simulated inference time per batch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of predict calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request ids seen, in processing order across all batches.
    pub fn seen(&self) -> Vec<Uuid> {
        self.seen.lock().expect("seen lock").clone()
    }

    fn classify_one(&self, input: &InferenceInput) -> Vec<Category> {
        const LABELS: [&str; 3] = ["tabby", "beagle", "goldfinch"];
        let pivot = input.payload.first().copied().unwrap_or(0) as usize % LABELS.len();
        // Deliberately unsorted so the router's ordering is exercised.
        vec![
            Category::new(LABELS[(pivot + 1) % LABELS.len()], 0.19),
            Category::new(LABELS[pivot], 0.72),
            Category::new(LABELS[(pivot + 2) % LABELS.len()], 0.09),
        ]
    }
}

#[async_trait]
impl ModelEngine for MockEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn predict(&self, inputs: &[InferenceInput]) -> Result<Vec<ItemOutcome>, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut seen = self.seen.lock().expect("seen lock");
            seen.extend(inputs.iter().map(|i| i.request_id));
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.behavior {
            MockBehavior::Classify => Ok(inputs.iter().map(|i| Ok(self.classify_one(i))).collect()),
            MockBehavior::FailBatch(message) => Err(EngineError::Execution(message.clone())),
            MockBehavior::FailItem { index, message } => Ok(inputs
                .iter()
                .enumerate()
                .map(|(i, input)| {
                    if i == *index {
                        Err(message.clone())
                    } else {
                        Ok(self.classify_one(input))
                    }
                })
                .collect()),
            MockBehavior::ShortResults => Ok(inputs
                .iter()
                .skip(1)
                .map(|i| Ok(self.classify_one(i)))
                .collect()),
            MockBehavior::HangTimes(n) => {
                if call < *n {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(EngineError::Execution("hung".to_string()))
                } else {
                    Ok(inputs.iter().map(|i| Ok(self.classify_one(i))).collect())
                }
            }
        }
    }
}

/// A loader that serves a fixed set of pre-built engines.
#[derive(Default)]
pub struct StaticLoader {
    engines: HashMap<String, Arc<MockEngine>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader serving exactly one engine under its own model id.
    pub fn single(engine: Arc<MockEngine>) -> Self {
        Self::new().with(engine)
    }

    pub fn with(mut self, engine: Arc<MockEngine>) -> Self {
        self.engines.insert(engine.model_id().to_string(), engine);
        self
    }
}

#[async_trait]
impl ModelLoader for StaticLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn ModelEngine>, EngineError> {
        self.engines
            .get(model_id)
            .cloned()
            .map(|e| e as Arc<dyn ModelEngine>)
            .ok_or_else(|| EngineError::LoadFailed(format!("no such model: {model_id}")))
    }
}
