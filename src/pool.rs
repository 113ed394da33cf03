//! A bounded cache of reusable model contexts.
//!
//! Loading a model is expensive; the pool keeps idle contexts around keyed
//! by model identity so back-to-back requests for the same model skip the
//! load entirely. Capacity is a hard ceiling: once `max_concurrent` contexts
//! exist, further acquisitions fail fast instead of queueing, leaving retry
//! policy to the caller.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::engine::{ContextOptions, Engine};
use crate::error::{Error, Result};
use crate::schema::Model;
use crate::task::TaskContext;

pub struct ContextPool {
    engine: Arc<dyn Engine>,
    root: PathBuf,
    options: ContextOptions,
    max_concurrent: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    free: Vec<TaskContext>,
    in_flight: usize,
    empty: bool,
}

impl ContextPool {
    /// Create a pool of up to `max_concurrent` contexts for models under
    /// `root`, loaded with the given GPU policy (`-1` disabled, `0` default
    /// device, `>0` device index).
    pub fn new(
        engine: Arc<dyn Engine>,
        root: impl Into<PathBuf>,
        max_concurrent: usize,
        gpu: i32,
    ) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(Error::bad_parameter(
                "max_concurrent must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            engine,
            root: root.into(),
            options: ContextOptions::for_gpu_policy(gpu),
            max_concurrent,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Borrow a context loaded with `model`.
    ///
    /// Prefers an idle context already holding the model, then any idle
    /// context, then lazily constructs one while under capacity; otherwise
    /// fails with the pool-exhausted kind. A context holding a different
    /// model is freed and re-initialised, with the load happening outside
    /// the pool lock.
    pub fn acquire(&self, model: &Model) -> Result<TaskContext> {
        let mut ctx = {
            let mut state = self.state.lock().unwrap();
            if state.empty {
                return Err(Error::PoolExhausted);
            }
            let matching = state.free.iter().rposition(|ctx| ctx.is_for(model));
            if let Some(i) = matching {
                state.in_flight += 1;
                state.free.swap_remove(i)
            } else if let Some(ctx) = state.free.pop() {
                state.in_flight += 1;
                ctx
            } else if state.in_flight < self.max_concurrent {
                state.in_flight += 1;
                TaskContext::unbound(Arc::clone(&self.engine))
            } else {
                return Err(Error::PoolExhausted);
            }
        };

        if ctx.is_for(model) {
            return Ok(ctx);
        }

        match ctx.bind(&self.root, model, &self.options) {
            Ok(()) => Ok(ctx),
            Err(err) => {
                // The slot this context occupied becomes available again.
                self.state.lock().unwrap().in_flight -= 1;
                Err(err)
            }
        }
    }

    /// Return a borrowed context to the free list.
    ///
    /// Initialised contexts are never destroyed here; keeping them loaded is
    /// the cache's value. After [`ContextPool::close`] the context is
    /// dropped instead.
    pub fn release(&self, ctx: TaskContext) {
        let mut state = self.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
        if !state.empty {
            state.free.push(ctx);
        }
    }

    /// Free every idle context currently holding `model_id`. Contexts
    /// checked out stay untouched; they re-initialise on their next
    /// mismatched acquire.
    pub fn drain(&self, model_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.free.retain(|ctx| ctx.model_id() != model_id);
    }

    /// Shut the pool down: no new contexts are handed out and every idle
    /// context is freed. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.empty = true;
        state.free.clear();
    }

    /// Number of idle contexts.
    pub fn idle(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Number of contexts currently checked out.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }
}
