//! One transcription task: a pooled model context driving inference passes
//! over successive audio segments while accumulating a cumulative result.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::engine::{
    ContextOptions, Engine, EngineContext, EngineSegment, InferenceParams, RunHooks,
    SamplingStrategy,
};
use crate::error::{Error, Result};
use crate::schema::{Model, Segment, TaskKind, Transcription};

/// Receives segments as they are finalised, already offset into
/// source-absolute time.
pub type SegmentSink = Box<dyn FnMut(Segment) + Send>;

/// A reusable inference context: a loaded model handle plus the parameters
/// and cumulative result of the current borrow.
///
/// Contexts live in the pool and are exclusively owned by one task at a
/// time. Reuse is the point: rebinding only happens when the requested model
/// differs from the one already loaded.
pub struct TaskContext {
    engine: Arc<dyn Engine>,
    model_id: String,
    handle: Option<Box<dyn EngineContext>>,
    params: InferenceParams,
    result: Transcription,
}

impl TaskContext {
    /// A context with no model loaded yet.
    pub(crate) fn unbound(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            model_id: String::new(),
            handle: None,
            params: InferenceParams::default_params(SamplingStrategy::Greedy),
            result: Transcription::new(TaskKind::Transcribe),
        }
    }

    /// Whether this context already holds the given model.
    pub(crate) fn is_for(&self, model: &Model) -> bool {
        self.handle.is_some() && self.model_id == model.id
    }

    /// Free any current handle and load `model` instead.
    pub(crate) fn bind(&mut self, root: &Path, model: &Model, options: &ContextOptions) -> Result<()> {
        // Dropping the old handle releases its native resources before the
        // new model is loaded, so rebinding never holds two models at once.
        self.handle = None;
        self.model_id.clear();

        let handle = self.engine.load(&root.join(&model.path), options)?;
        self.handle = Some(handle);
        self.model_id = model.id.clone();
        Ok(())
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Reset run parameters to library defaults (language `"auto"`) and
    /// clear the accumulated result. Called on every borrow.
    pub(crate) fn reset(&mut self) {
        self.params = InferenceParams::default_params(SamplingStrategy::Greedy);
        self.result = Transcription::new(TaskKind::Transcribe);
    }

    /// Select the task variant: adjusts the translate/diarize parameters and
    /// the reported task kind together.
    pub fn set_task(&mut self, task: TaskKind) {
        self.params.translate = task == TaskKind::Translate;
        self.params.diarize = task == TaskKind::Diarize;
        self.result.task = task;
    }

    /// Set the transcription language.
    ///
    /// Empty or `"auto"` selects detection; anything else must resolve in
    /// the model vocabulary, otherwise the previous value is preserved and
    /// the call fails.
    pub fn set_language(&mut self, language: &str) -> Result<()> {
        if language.is_empty() || language == "auto" {
            self.params.language = "auto".to_owned();
            return Ok(());
        }
        if self.engine.language_id(language) < 0 {
            return Err(Error::bad_parameter(format!(
                "unknown language: {language:?}"
            )));
        }
        self.params.language = language.to_owned();
        Ok(())
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.params.temperature = temperature;
    }

    pub fn set_initial_prompt(&mut self, prompt: impl Into<String>) {
        self.params.initial_prompt = Some(prompt.into());
    }

    /// Whether the loaded model can translate (is multilingual).
    pub fn can_translate(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_multilingual())
    }

    /// Run one inference pass over `samples`, a segment starting at `offset`
    /// within the source stream.
    ///
    /// While the run is in flight, newly finalised segments are offset into
    /// source-absolute time and forwarded to `on_segment`. On success every
    /// segment's text is appended to the cumulative result, and segment
    /// detail is kept when `emit_segments` is set. A tripped `cancel` token
    /// surfaces as the cancellation kind with nothing accumulated.
    pub fn transcribe(
        &mut self,
        cancel: &CancelToken,
        offset: Duration,
        samples: &[f32],
        emit_segments: bool,
        on_segment: Option<SegmentSink>,
    ) -> Result<()> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| Error::bad_parameter("context has no model loaded".to_owned()))?;

        let offset_secs = offset.as_secs_f64();

        let mut hooks = RunHooks::none();
        let abort_token = cancel.clone();
        hooks.on_abort = Some(Box::new(move || abort_token.is_cancelled()));
        if let Some(mut sink) = on_segment {
            hooks.on_new_segment = Some(Box::new(move |segment: EngineSegment| {
                sink(offset_segment(&segment, offset_secs));
            }));
        }

        match handle.run(&self.params, samples, hooks) {
            Ok(()) => {}
            // Only a tripped token is a cancellation; an abort the caller
            // never asked for is a native failure.
            Err(Error::RunAborted) if cancel.is_cancelled() => return Err(Error::RunAborted),
            Err(Error::RunAborted) => {
                return Err(Error::RunFailed("run aborted unexpectedly".to_owned()));
            }
            Err(err) => return Err(err),
        }

        let segments = handle.segments()?;
        for segment in &segments {
            self.result.text.push_str(&segment.text);
            if emit_segments {
                self.result
                    .segments
                    .get_or_insert_with(Vec::new)
                    .push(offset_segment(segment, offset_secs));
            }
        }

        // The first run fixes the reported language, reflecting detection
        // when the request asked for "auto".
        if self.result.language.is_empty() {
            self.result.language = handle
                .detected_language()
                .unwrap_or_else(|| self.params.language.clone());
        }

        Ok(())
    }

    pub(crate) fn set_duration(&mut self, duration: Duration) {
        self.result.duration = duration.as_secs_f64();
    }

    /// Snapshot of the accumulated result.
    pub fn result(&self) -> Transcription {
        self.result.clone()
    }
}

fn offset_segment(segment: &EngineSegment, offset_secs: f64) -> Segment {
    Segment {
        id: segment.id,
        start: segment.start + offset_secs,
        end: segment.end + offset_secs,
        text: segment.text.clone(),
        speaker_turn: segment.speaker_turn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::engine::mock::MockEngine;

    fn model(id: &str) -> Model {
        Model {
            id: id.to_owned(),
            object: "model".to_owned(),
            path: format!("{id}.bin"),
            created: 0,
            size: 0,
            owned_by: String::new(),
        }
    }

    fn bound_context(engine: MockEngine) -> TaskContext {
        let engine = Arc::new(engine);
        let mut ctx = TaskContext::unbound(engine);
        ctx.bind(Path::new("/tmp"), &model("m1"), &ContextOptions::default())
            .expect("bind succeeds");
        ctx.reset();
        ctx
    }

    #[test]
    fn set_language_validates_and_preserves_previous_value() {
        let mut ctx = bound_context(MockEngine::new());

        ctx.set_language("de").unwrap();
        assert_eq!(ctx.params.language, "de");

        let err = ctx.set_language("klingon").unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
        assert_eq!(ctx.params.language, "de");

        ctx.set_language("").unwrap();
        assert_eq!(ctx.params.language, "auto");
        ctx.set_language("auto").unwrap();
        assert_eq!(ctx.params.language, "auto");
    }

    #[test]
    fn set_task_adjusts_params_and_result_kind() {
        let mut ctx = bound_context(MockEngine::new());

        ctx.set_task(TaskKind::Translate);
        assert!(ctx.params.translate);
        assert!(!ctx.params.diarize);
        assert_eq!(ctx.result.task, TaskKind::Translate);

        ctx.set_task(TaskKind::Diarize);
        assert!(!ctx.params.translate);
        assert!(ctx.params.diarize);
        assert_eq!(ctx.result.task, TaskKind::Diarize);
    }

    #[test]
    fn transcribe_accumulates_text_across_segments() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        engine.push_run(vec![
            EngineSegment {
                id: 0,
                start: 0.0,
                end: 1.0,
                text: " Hello".to_owned(),
                speaker_turn: false,
            },
            EngineSegment {
                id: 1,
                start: 1.0,
                end: 2.0,
                text: " world.".to_owned(),
                speaker_turn: false,
            },
        ]);
        engine.push_run(vec![EngineSegment {
            id: 0,
            start: 0.0,
            end: 1.5,
            text: " Again.".to_owned(),
            speaker_turn: true,
        }]);

        let mut ctx = bound_context(engine);
        let cancel = CancelToken::new();
        let delivered: Arc<Mutex<Vec<Segment>>> = Arc::new(Mutex::new(Vec::new()));

        for offset in [Duration::ZERO, Duration::from_secs(30)] {
            let sink = Arc::clone(&delivered);
            ctx.transcribe(
                &cancel,
                offset,
                &vec![0.0; 16_000],
                true,
                Some(Box::new(move |seg| sink.lock().unwrap().push(seg))),
            )?;
        }

        let result = ctx.result();
        assert_eq!(result.text, " Hello world. Again.");
        assert_eq!(result.language, "en");

        // Cumulative text equals the concatenation of everything delivered
        // through the sink, in order.
        let delivered = delivered.lock().unwrap();
        let streamed: String = delivered.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(result.text, streamed);

        // Offsets land in source-absolute time, in both the stream and the
        // cumulative segments.
        assert_eq!(delivered[2].start, 30.0);
        assert_eq!(delivered[2].end, 31.5);
        let segments = result.segments.expect("segments kept");
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].start, 30.0);
        assert!(segments.windows(2).all(|w| w[0].end <= w[1].start));
        Ok(())
    }

    #[test]
    fn cancelled_before_first_sample_emits_nothing() {
        let mut ctx = bound_context(MockEngine::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let delivered: Arc<Mutex<Vec<Segment>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let err = ctx
            .transcribe(
                &cancel,
                Duration::ZERO,
                &vec![0.0; 16_000],
                false,
                Some(Box::new(move |seg| sink.lock().unwrap().push(seg))),
            )
            .unwrap_err();

        assert!(matches!(err, Error::RunAborted));
        assert!(delivered.lock().unwrap().is_empty());
        assert!(ctx.result().text.is_empty());
    }

    #[test]
    fn transcribe_without_sink_still_accumulates() -> anyhow::Result<()> {
        let mut ctx = bound_context(MockEngine::new());
        ctx.transcribe(
            &CancelToken::new(),
            Duration::ZERO,
            &vec![0.0; 32_000],
            false,
            None,
        )?;
        let result = ctx.result();
        assert!(!result.text.is_empty());
        assert!(result.segments.is_none());
        Ok(())
    }
}
