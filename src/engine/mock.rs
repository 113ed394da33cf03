//! Scripted engine double for pool, task, service and server tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::{
    ContextOptions, Engine, EngineContext, EngineSegment, InferenceParams, RunHooks, SAMPLE_RATE,
    Token, TokenKind,
};
use crate::error::{Error, Result};

const LANGUAGES: &[&str] = &["en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt"];

/// Shared, inspectable state behind a [`MockEngine`] and every context it
/// hands out.
#[derive(Default)]
pub(crate) struct MockState {
    pub loads: AtomicUsize,
    pub frees: AtomicUsize,
    pub runs: AtomicUsize,
    pub fail_load: AtomicBool,
    pub multilingual: AtomicBool,
    pub run_delay: Mutex<Duration>,
    pub detected_language: Mutex<String>,

    /// Segment batches handed out run by run; when exhausted, a run yields
    /// one synthetic segment spanning its sample buffer.
    pub script: Mutex<Vec<Vec<EngineSegment>>>,
}

#[derive(Default)]
pub(crate) struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn multilingual() -> Self {
        let engine = Self::default();
        engine.state.multilingual.store(true, Ordering::Relaxed);
        engine
    }

    pub(crate) fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }

    pub(crate) fn push_run(&self, segments: Vec<EngineSegment>) {
        self.state.script.lock().unwrap().push(segments);
    }
}

impl Engine for MockEngine {
    fn load(&self, path: &Path, _options: &ContextOptions) -> Result<Box<dyn EngineContext>> {
        if self.state.fail_load.load(Ordering::Relaxed) {
            return Err(Error::ModelLoad(format!("refused: {}", path.display())));
        }
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            state: Arc::clone(&self.state),
            last: Vec::new(),
        }))
    }

    fn language_id(&self, name: &str) -> i32 {
        LANGUAGES
            .iter()
            .position(|l| *l == name)
            .map(|i| i as i32)
            .unwrap_or(-1)
    }

    fn language_name(&self, id: i32) -> Option<String> {
        usize::try_from(id)
            .ok()
            .and_then(|i| LANGUAGES.get(i))
            .map(|l| (*l).to_owned())
    }

    fn num_languages(&self) -> i32 {
        LANGUAGES.len() as i32
    }
}

struct MockContext {
    state: Arc<MockState>,
    last: Vec<EngineSegment>,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.state.frees.fetch_add(1, Ordering::SeqCst);
    }
}

impl EngineContext for MockContext {
    fn is_multilingual(&self) -> bool {
        self.state.multilingual.load(Ordering::Relaxed)
    }

    fn run(&mut self, _params: &InferenceParams, samples: &[f32], hooks: RunHooks) -> Result<()> {
        self.last.clear();

        // Cancellation is polled before any work happens, mirroring the
        // native abort callback firing ahead of the first encoder pass.
        if let Some(mut on_abort) = hooks.on_abort
            && on_abort()
        {
            return Err(Error::RunAborted);
        }

        let delay = *self.state.run_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let n = self.state.runs.fetch_add(1, Ordering::SeqCst);
        let mut script = self.state.script.lock().unwrap();
        let segments = if script.is_empty() {
            vec![EngineSegment {
                id: 0,
                start: 0.0,
                end: samples.len() as f64 / f64::from(SAMPLE_RATE),
                text: format!(" segment {n}."),
                speaker_turn: false,
            }]
        } else {
            script.remove(0)
        };
        drop(script);

        if let Some(mut on_new_segment) = hooks.on_new_segment {
            for segment in &segments {
                on_new_segment(segment.clone());
            }
        }
        if let Some(mut on_progress) = hooks.on_progress {
            on_progress(100);
        }

        self.last = segments;
        Ok(())
    }

    fn segments(&mut self) -> Result<Vec<EngineSegment>> {
        Ok(self.last.clone())
    }

    fn tokens(&mut self, segment: usize) -> Result<Vec<Token>> {
        let Some(segment) = self.last.get(segment) else {
            return Ok(Vec::new());
        };
        Ok(segment
            .text
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| Token {
                id: i as i32,
                text: format!(" {word}"),
                probability: 1.0,
                start: segment.start,
                end: segment.end,
                kind: TokenKind::classify(word),
            })
            .collect())
    }

    fn detected_language(&mut self) -> Option<String> {
        let lang = self.state.detected_language.lock().unwrap().clone();
        if lang.is_empty() {
            Some("en".to_owned())
        } else {
            Some(lang)
        }
    }
}
