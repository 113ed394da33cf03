//! Production engine backed by `whisper-rs` / whisper.cpp.

use std::path::Path;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use whisper_rs::{
    FullParams, SamplingStrategy as WhisperSampling, SegmentCallbackData, WhisperContext,
    WhisperContextParameters, WhisperState,
};

use crate::engine::{
    ContextOptions, Engine, EngineContext, EngineSegment, InferenceParams, RunHooks,
    SamplingStrategy, Token, TokenKind,
};
use crate::error::{Error, Result};

/// Beam width used for the beam-search strategy.
const BEAM_SIZE: i32 = 5;

/// The whisper.cpp engine.
///
/// Construction installs the native log trampoline so every whisper.cpp log
/// line reaches `tracing` with its level intact. The trampoline is a
/// process-wide singleton; callers never touch the native log sink directly.
pub struct WhisperEngine {
    _private: (),
}

impl WhisperEngine {
    pub fn new() -> Self {
        install_native_logging();
        Self { _private: () }
    }
}

impl Default for WhisperEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Route whisper.cpp's log output into `tracing` exactly once for the
/// lifetime of the process.
fn install_native_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(whisper_rs::install_whisper_tracing_trampoline);
}

impl Engine for WhisperEngine {
    fn load(&self, path: &Path, options: &ContextOptions) -> Result<Box<dyn EngineContext>> {
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::bad_parameter(format!("model path is not valid UTF-8: {path:?}")))?;

        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu(options.use_gpu);
        ctx_params.gpu_device(options.gpu_device);
        ctx_params.flash_attn(options.flash_attn);

        let ctx = WhisperContext::new_with_params(path_str, ctx_params)
            .map_err(|err| Error::ModelLoad(format!("{}: {err}", path.display())))?;

        tracing::info!(model = %path.display(), gpu = options.use_gpu, "loaded model");

        Ok(Box::new(WhisperModelContext {
            ctx,
            state: None,
            token_timestamps: options.token_timestamps,
        }))
    }

    fn language_id(&self, name: &str) -> i32 {
        for id in 0..=whisper_rs::get_lang_max_id() {
            if whisper_rs::get_lang_str(id) == Some(name) {
                return id;
            }
        }
        -1
    }

    fn language_name(&self, id: i32) -> Option<String> {
        whisper_rs::get_lang_str(id).map(str::to_owned)
    }

    fn num_languages(&self) -> i32 {
        whisper_rs::get_lang_max_id() + 1
    }
}

struct WhisperModelContext {
    ctx: WhisperContext,

    /// State of the most recent successful run; segment and token read-back
    /// goes through here.
    state: Option<WhisperState>,

    /// Context-level default, OR-ed with the per-run parameter.
    token_timestamps: bool,
}

impl WhisperModelContext {
    fn build_full_params<'a>(&self, params: &'a InferenceParams) -> FullParams<'a, 'a> {
        let mut full = FullParams::new(match params.strategy {
            SamplingStrategy::Greedy => WhisperSampling::Greedy { best_of: 1 },
            SamplingStrategy::BeamSearch => WhisperSampling::BeamSearch {
                beam_size: BEAM_SIZE,
                patience: 1.0,
            },
        });

        full.set_n_threads(params.n_threads);
        full.set_translate(params.translate);
        full.set_tdrz_enable(params.diarize);

        // whisper.cpp treats "auto" as detect; an empty string means the
        // same, so normalise to the explicit spelling.
        if params.language.is_empty() {
            full.set_language(Some("auto"));
        } else {
            full.set_language(Some(params.language.as_str()));
        }

        full.set_no_context(true);
        full.set_single_segment(params.single_segment);
        full.set_token_timestamps(params.token_timestamps || self.token_timestamps);
        full.set_max_len(params.max_len);
        full.set_max_tokens(params.max_tokens);
        full.set_temperature(params.temperature);
        full.set_suppress_blank(params.suppress_blank);
        if let Some(prompt) = params.initial_prompt.as_deref() {
            full.set_initial_prompt(prompt);
        }

        full.set_print_special(false);
        full.set_print_progress(false);
        full.set_print_realtime(false);
        full.set_print_timestamps(false);

        full
    }
}

impl EngineContext for WhisperModelContext {
    fn is_multilingual(&self) -> bool {
        self.ctx.is_multilingual()
    }

    fn run(&mut self, params: &InferenceParams, samples: &[f32], hooks: RunHooks) -> Result<()> {
        // A new run invalidates whatever the previous one produced.
        self.state = None;

        let mut full = self.build_full_params(params);

        // The abort callback is the only way to distinguish a cancelled run
        // from a genuinely failed one: whisper.cpp reports both as a
        // non-zero status, so remember whether we asked it to stop.
        let tripped = Arc::new(AtomicBool::new(false));
        if let Some(mut on_abort) = hooks.on_abort {
            let tripped = Arc::clone(&tripped);
            full.set_abort_callback_safe(move || {
                let stop = on_abort();
                if stop {
                    tripped.store(true, Ordering::Relaxed);
                }
                stop
            });
        }

        if let Some(mut on_new_segment) = hooks.on_new_segment {
            full.set_segment_callback_safe(move |data: SegmentCallbackData| {
                // The safe callback hands over centisecond timestamps and no
                // speaker-turn flag; the flag is only available on read-back.
                on_new_segment(EngineSegment {
                    id: data.segment,
                    start: data.start_timestamp as f64 / 100.0,
                    end: data.end_timestamp as f64 / 100.0,
                    text: data.text,
                    speaker_turn: false,
                });
            });
        }

        if let Some(mut on_progress) = hooks.on_progress {
            full.set_progress_callback_safe(move |progress: i32| on_progress(progress));
        }

        let mut state = self
            .ctx
            .create_state()
            .map_err(|err| Error::RunFailed(format!("failed to create state: {err}")))?;

        match state.full(full, samples) {
            Ok(_) => {
                self.state = Some(state);
                Ok(())
            }
            Err(err) if tripped.load(Ordering::Relaxed) => {
                tracing::debug!(%err, "run aborted by cancellation");
                Err(Error::RunAborted)
            }
            Err(err) => Err(Error::RunFailed(err.to_string())),
        }
    }

    fn segments(&mut self) -> Result<Vec<EngineSegment>> {
        let Some(state) = self.state.as_mut() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for (index, segment) in state.as_iter().enumerate() {
            let text = segment
                .to_str()
                .map_err(|err| Error::RunFailed(format!("failed to read segment text: {err}")))?
                .to_owned();

            out.push(EngineSegment {
                id: index as i32,
                start: centiseconds_to_seconds(segment.start_timestamp()),
                end: centiseconds_to_seconds(segment.end_timestamp()),
                text,
                speaker_turn: segment.next_segment_speaker_turn(),
            });
        }
        Ok(out)
    }

    fn tokens(&mut self, segment: usize) -> Result<Vec<Token>> {
        let Some(state) = self.state.as_mut() else {
            return Ok(Vec::new());
        };

        let Some(segment) = state.as_iter().nth(segment) else {
            return Ok(Vec::new());
        };

        let count = usize::try_from(segment.n_tokens()).unwrap_or(0);
        let mut tokens = Vec::with_capacity(count);
        for j in 0..count {
            let Some(token) = segment.get_token(j as i32) else {
                continue;
            };
            let data = token.token_data();
            let text = token
                .to_str()
                .map_err(|err| Error::RunFailed(format!("failed to read token text: {err}")))?
                .to_owned();

            tokens.push(Token {
                id: data.id,
                probability: data.p,
                start: centiseconds_to_seconds(data.t0),
                end: centiseconds_to_seconds(data.t1),
                kind: TokenKind::classify(&text),
                text,
            });
        }
        Ok(tokens)
    }

    fn detected_language(&mut self) -> Option<String> {
        let state = self.state.as_mut()?;
        let id = state.full_lang_id_from_state().ok()?;
        whisper_rs::get_lang_str(id).map(str::to_owned)
    }
}

/// whisper reports centiseconds, with -1 for unknown; clamp to zero.
fn centiseconds_to_seconds(value: i64) -> f64 {
    if value < 0 { 0.0 } else { value as f64 / 100.0 }
}
