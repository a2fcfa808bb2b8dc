//! HuggingFace Hub downloads.
//!
//! Fetches tokenizer files through `hf-hub`, surfacing download progress as
//! `modelLoadProgress` events on the same channel the engine uses.

use std::path::PathBuf;

use hf_hub::api::sync::Api;
use hf_hub::api::Progress;
use hf_hub::{Cache, Repo, RepoType};
use tracing::{debug, info};

use crate::engine::protocol::{Event, EventKind, EventSink};
use crate::error::{Error, Result};

/// Tokenizer file name in a model repository.
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Adapts `hf-hub` download callbacks into `modelLoadProgress` events.
///
/// Emits at most one event per whole percent, plus a final 100.
pub struct LoadProgress<S> {
    sink: S,
    component: String,
    total: usize,
    done: usize,
    last_percent: Option<u32>,
}

impl<S: EventSink> LoadProgress<S> {
    pub fn new(component: impl Into<String>, sink: S) -> Self {
        Self {
            sink,
            component: component.into(),
            total: 0,
            done: 0,
            last_percent: None,
        }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn report(&mut self, percent: f32) {
        let whole = percent.floor() as u32;
        if self.last_percent == Some(whole) {
            return;
        }
        self.last_percent = Some(whole);
        self.sink.emit(Event::global(EventKind::ModelLoadProgress {
            component: self.component.clone(),
            percent,
        }));
    }
}

impl<S: EventSink> Progress for LoadProgress<S> {
    fn init(&mut self, size: usize, filename: &str) {
        debug!(component = %self.component, filename, size, "download started");
        self.total = size;
        self.done = 0;
        self.last_percent = None;
        self.report(0.0);
    }

    fn update(&mut self, size: usize) {
        self.done = self.done.saturating_add(size);
        if self.total == 0 {
            return;
        }
        let percent = (self.done as f64 / self.total as f64 * 100.0).min(100.0) as f32;
        self.report(percent);
    }

    fn finish(&mut self) {
        self.report(100.0);
    }
}

/// Download (or find in the local cache) `tokenizer.json` for `model_id`.
///
/// A cache hit reports a single 100% progress event.
pub fn fetch_tokenizer<S: EventSink>(model_id: &str, revision: &str, sink: S) -> Result<PathBuf> {
    let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
    let mut progress = LoadProgress::new(model_id, sink);

    if let Some(path) = Cache::default().repo(repo.clone()).get(TOKENIZER_FILE) {
        info!(model_id, path = %path.display(), "tokenizer found in cache");
        progress.finish();
        return Ok(path);
    }

    let api = Api::new().map_err(|e| Error::ModelLoad(format!("Failed to create HF API: {e}")))?;
    let path = api
        .repo(repo)
        .download_with_progress(TOKENIZER_FILE, progress)
        .map_err(|e| {
            Error::ModelLoad(format!("Failed to download {TOKENIZER_FILE} for {model_id}: {e}"))
        })?;
    info!(model_id, path = %path.display(), "tokenizer downloaded");
    Ok(path)
}
