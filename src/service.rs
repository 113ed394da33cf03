//! The service façade: owns the model store and the context pool, and runs
//! whole transcription requests end to end.

use std::fs;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::{Config, clamp_segment_duration};
use crate::engine::{Engine, SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::pool::ContextPool;
use crate::schema::{Model, TaskKind, Transcription};
use crate::segmenter::Segmenter;
use crate::store::ModelStore;
use crate::task::{SegmentSink, TaskContext};
use crate::vad::SpeechFilter;

/// Per-request knobs, mapped from HTTP form fields or CLI flags.
#[derive(Default)]
pub struct TranscribeOptions {
    pub task: Task,
    pub language: Option<String>,
    pub temperature: Option<f32>,
    pub initial_prompt: Option<String>,
    pub segment_duration: Option<Duration>,

    /// Keep per-segment detail in the cumulative result.
    pub emit_segments: bool,
}

/// The request variants the façade exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
    Diarize,
}

impl From<Task> for TaskKind {
    fn from(task: Task) -> TaskKind {
        match task {
            Task::Transcribe => TaskKind::Transcribe,
            Task::Translate => TaskKind::Translate,
            Task::Diarize => TaskKind::Diarize,
        }
    }
}

pub struct Service {
    config: Config,
    store: ModelStore,
    pool: ContextPool,
    vad: Option<Mutex<SpeechFilter>>,
}

impl Service {
    /// Build a service from configuration, creating the store directory when
    /// it is missing.
    pub fn new(config: Config, engine: Arc<dyn Engine>) -> Result<Self> {
        fs::create_dir_all(&config.store_dir)?;

        let store = ModelStore::new(&config.store_dir, &config.model_ext, &config.model_url)?;
        let pool = ContextPool::new(
            Arc::clone(&engine),
            &config.store_dir,
            config.max_concurrent,
            config.gpu,
        )?;

        let vad = match &config.vad_model {
            Some(path) => Some(Mutex::new(SpeechFilter::new(path)?)),
            None => None,
        };

        tracing::info!(
            store = %config.store_dir.display(),
            max_concurrent = config.max_concurrent,
            gpu = config.gpu,
            vad = vad.is_some(),
            "service ready"
        );

        Ok(Self {
            config,
            store,
            pool,
            vad,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn models(&self) -> Vec<Model> {
        self.store.list()
    }

    pub fn model_by_id(&self, id: &str) -> Option<Model> {
        self.store.by_id(id)
    }

    pub fn download_model(
        &self,
        cancel: &CancelToken,
        path: &str,
        progress: impl FnMut(u64, u64),
    ) -> Result<Model> {
        self.store.download(cancel, path, progress)
    }

    /// Delete a model and free any idle contexts still holding it.
    pub fn delete_model(&self, id: &str) -> Result<()> {
        self.store.delete(id)?;
        self.pool.drain(id);
        Ok(())
    }

    /// Borrow a context for `model`, run `f`, and return the context to the
    /// pool whatever happened. Parameters are reset to defaults (language
    /// `"auto"`) before `f` runs.
    pub fn with_model<T>(
        &self,
        model: &Model,
        f: impl FnOnce(&mut TaskContext) -> Result<T>,
    ) -> Result<T> {
        let mut ctx = self.pool.acquire(model)?;
        ctx.reset();
        let result = f(&mut ctx);
        self.pool.release(ctx);
        result
    }

    /// Run one full request: decode `reader`, segment it, and drive
    /// inference over each segment on a pooled context.
    ///
    /// Segments are forwarded through `on_segment` as they are finalised,
    /// in non-decreasing start order within the request.
    pub fn transcribe<R>(
        &self,
        model_id: &str,
        reader: R,
        options: &TranscribeOptions,
        cancel: &CancelToken,
        on_segment: Option<SegmentSink>,
    ) -> Result<Transcription>
    where
        R: Read + Send + Sync + 'static,
    {
        let model = self
            .store
            .by_id(model_id)
            .ok_or_else(|| Error::NotFound(model_id.to_owned()))?;

        let segment_duration = clamp_segment_duration(options.segment_duration);
        let mut segmenter = Segmenter::new(reader, segment_duration, SAMPLE_RATE)?;

        // The sink is shared across segment runs; each run gets its own
        // boxed handle onto it.
        let sink = on_segment.map(|s| Arc::new(Mutex::new(s)));

        self.with_model(&model, |ctx| {
            ctx.set_task(options.task.into());
            match options.task {
                Task::Translate => {
                    if !ctx.can_translate() {
                        return Err(Error::bad_parameter(
                            "model is not multilingual, cannot translate".to_owned(),
                        ));
                    }
                    ctx.set_language("en")?;
                }
                Task::Transcribe | Task::Diarize => {
                    if let Some(language) = options.language.as_deref() {
                        ctx.set_language(language)?;
                    }
                }
            }
            if let Some(temperature) = options.temperature {
                ctx.set_temperature(temperature);
            }
            if let Some(prompt) = options.initial_prompt.as_deref() {
                ctx.set_initial_prompt(prompt);
            }

            segmenter.decode(cancel, |ts, samples| {
                if let Some(vad) = &self.vad {
                    let p = vad.lock().unwrap().probability(SAMPLE_RATE, samples)?;
                    if p < self.config.vad_threshold {
                        tracing::debug!(ts = ts.as_secs_f64(), p, "skipping silent segment");
                        return Ok(());
                    }
                }

                let run_sink = sink.as_ref().map(|s| {
                    let s = Arc::clone(s);
                    Box::new(move |segment| (*s.lock().unwrap())(segment)) as SegmentSink
                });
                ctx.transcribe(cancel, ts, samples, options.emit_segments, run_sink)
            })?;

            ctx.set_duration(segmenter.duration());
            Ok(ctx.result())
        })
    }

    /// Stop handing out contexts and free everything idle. Callers drain
    /// in-flight requests first.
    pub fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;
    use std::sync::atomic::Ordering;

    use crate::engine::mock::{MockEngine, MockState};
    use crate::schema::Segment;
    use crate::store::MIN_MODEL_SIZE;
    use crate::testutil::wav_bytes;

    fn service_with(
        engine: MockEngine,
        max_concurrent: usize,
    ) -> (Service, Arc<MockState>, tempfile::TempDir) {
        let state = engine.state();
        let dir = tempfile::tempdir().expect("tempdir");
        let model_path = dir.path().join("ggml-tiny.bin");
        let file = fs::File::create(&model_path).expect("model file");
        file.set_len(MIN_MODEL_SIZE).expect("grow model file");

        let config = Config {
            store_dir: dir.path().to_owned(),
            max_concurrent,
            gpu: -1,
            ..Config::default()
        };
        let service = Service::new(config, Arc::new(engine)).expect("service");
        (service, state, dir)
    }

    fn ten_seconds_wav() -> Cursor<Vec<u8>> {
        Cursor::new(wav_bytes(&vec![0.05; 160_000], 16_000))
    }

    #[test]
    fn unknown_model_is_not_found() {
        let (service, _, _dir) = service_with(MockEngine::new(), 1);
        let err = service
            .transcribe(
                "missing",
                ten_seconds_wav(),
                &TranscribeOptions::default(),
                &CancelToken::new(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn transcribe_runs_one_pass_per_segment() -> anyhow::Result<()> {
        let (service, state, _dir) = service_with(MockEngine::new(), 1);

        let options = TranscribeOptions {
            segment_duration: Some(Duration::from_secs(5)),
            emit_segments: true,
            ..TranscribeOptions::default()
        };
        let delivered: Arc<Mutex<Vec<Segment>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);

        let result = service.transcribe(
            "ggml-tiny",
            ten_seconds_wav(),
            &options,
            &CancelToken::new(),
            Some(Box::new(move |seg| sink.lock().unwrap().push(seg))),
        )?;

        // 10 s of audio at a 5 s segment size: two inference passes.
        assert_eq!(state.runs.load(Ordering::SeqCst), 2);
        assert_eq!(result.task, TaskKind::Transcribe);
        assert_eq!(result.language, "en");
        assert!((result.duration - 10.0).abs() < 0.1);
        assert_eq!(result.text, " segment 0. segment 1.");

        // The cumulative text is exactly what the sink observed, in order,
        // and stream timestamps never go backwards.
        let delivered = delivered.lock().unwrap();
        let streamed: String = delivered.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(result.text, streamed);
        assert!(delivered.windows(2).all(|w| w[0].start <= w[1].start));

        let segments = result.segments.expect("segments kept");
        assert_eq!(segments[1].start, 5.0);
        Ok(())
    }

    #[test]
    fn json_format_keeps_result_lean() -> anyhow::Result<()> {
        let (service, _, _dir) = service_with(MockEngine::new(), 1);
        let result = service.transcribe(
            "ggml-tiny",
            ten_seconds_wav(),
            &TranscribeOptions::default(),
            &CancelToken::new(),
            None,
        )?;
        assert!(result.segments.is_none());
        Ok(())
    }

    #[test]
    fn sequential_requests_reuse_the_loaded_context() -> anyhow::Result<()> {
        let (service, state, _dir) = service_with(MockEngine::new(), 2);

        for _ in 0..2 {
            service.transcribe(
                "ggml-tiny",
                ten_seconds_wav(),
                &TranscribeOptions::default(),
                &CancelToken::new(),
                None,
            )?;
        }
        assert_eq!(state.loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn translate_requires_a_multilingual_model() {
        let (service, _, _dir) = service_with(MockEngine::new(), 1);
        let options = TranscribeOptions {
            task: Task::Translate,
            ..TranscribeOptions::default()
        };
        let err = service
            .transcribe(
                "ggml-tiny",
                ten_seconds_wav(),
                &options,
                &CancelToken::new(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
    }

    #[test]
    fn translate_forces_english_and_reports_its_task() -> anyhow::Result<()> {
        let engine = MockEngine::multilingual();
        *engine.state().detected_language.lock().unwrap() = "en".to_owned();
        let (service, _, _dir) = service_with(engine, 1);

        let options = TranscribeOptions {
            task: Task::Translate,
            language: Some("de".to_owned()),
            ..TranscribeOptions::default()
        };
        let result = service.transcribe(
            "ggml-tiny",
            ten_seconds_wav(),
            &options,
            &CancelToken::new(),
            None,
        )?;
        assert_eq!(result.task, TaskKind::Translate);
        assert_eq!(result.language, "en");
        Ok(())
    }

    #[test]
    fn invalid_language_is_rejected_up_front() {
        let (service, state, _dir) = service_with(MockEngine::new(), 1);
        let options = TranscribeOptions {
            language: Some("klingon".to_owned()),
            ..TranscribeOptions::default()
        };
        let err = service
            .transcribe(
                "ggml-tiny",
                ten_seconds_wav(),
                &options,
                &CancelToken::new(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
        assert_eq!(state.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_before_decode_surfaces_as_aborted() {
        let (service, _, _dir) = service_with(MockEngine::new(), 1);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = service
            .transcribe(
                "ggml-tiny",
                ten_seconds_wav(),
                &TranscribeOptions::default(),
                &cancel,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::RunAborted));
    }

    #[test]
    fn capacity_overflow_fails_exactly_one_of_three() {
        let engine = MockEngine::new();
        *engine.state().run_delay.lock().unwrap() = Duration::from_millis(300);
        let (service, _, _dir) = service_with(engine, 2);

        let results: Vec<Result<Transcription>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    scope.spawn(|| {
                        service.transcribe(
                            "ggml-tiny",
                            ten_seconds_wav(),
                            &TranscribeOptions::default(),
                            &CancelToken::new(),
                            None,
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(Error::PoolExhausted)))
            .count();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(exhausted, 1, "exactly one request is turned away");
        assert_eq!(succeeded, 2);
    }

    #[test]
    fn delete_model_drains_idle_contexts() -> anyhow::Result<()> {
        let (service, state, _dir) = service_with(MockEngine::new(), 1);

        service.transcribe(
            "ggml-tiny",
            ten_seconds_wav(),
            &TranscribeOptions::default(),
            &CancelToken::new(),
            None,
        )?;
        assert_eq!(state.frees.load(Ordering::SeqCst), 0);

        service.delete_model("ggml-tiny")?;
        assert_eq!(state.frees.load(Ordering::SeqCst), 1);
        assert!(service.model_by_id("ggml-tiny").is_none());
        Ok(())
    }

    #[test]
    fn close_rejects_further_requests() -> anyhow::Result<()> {
        let (service, _, _dir) = service_with(MockEngine::new(), 1);
        service.close();
        let err = service
            .transcribe(
                "ggml-tiny",
                ten_seconds_wav(),
                &TranscribeOptions::default(),
                &CancelToken::new(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
        Ok(())
    }
}
