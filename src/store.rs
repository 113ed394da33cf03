//! File-system-backed index of installed model artifacts.
//!
//! The filesystem is the ground truth: no metadata files, no lockfile. A
//! scan walks the root, admits regular files carrying the configured
//! extension and at least [`MIN_MODEL_SIZE`] bytes, and replaces the index
//! atomically under the write guard. Downloads stream into place and are
//! deleted again on any failure.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::time::UNIX_EPOCH;

use reqwest::Url;
use reqwest::blocking::Client;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::schema::Model;

/// Files smaller than this are never models; the scan ignores them.
pub const MIN_MODEL_SIZE: u64 = 8 * 1024 * 1024;

/// Read granularity while streaming a download to disk.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

pub struct ModelStore {
    root: PathBuf,
    ext: String,
    base_url: Url,
    client: Client,
    index: RwLock<Vec<Model>>,
}

impl ModelStore {
    /// Open a store rooted at `root`, indexing it immediately.
    ///
    /// `ext` is the admitted file extension (with the leading dot, empty to
    /// admit everything); `base_url` is where relative download paths
    /// resolve, its query string preserved.
    pub fn new(root: impl Into<PathBuf>, ext: impl Into<String>, base_url: &str) -> Result<Self> {
        let root = root.into();
        let info = fs::metadata(&root)?;
        if !info.is_dir() {
            return Err(Error::bad_parameter(format!(
                "not a directory: {}",
                root.display()
            )));
        }

        let base_url = Url::parse(base_url)
            .map_err(|err| Error::bad_parameter(format!("invalid model url {base_url:?}: {err}")))?;

        let client = Client::builder()
            .user_agent(concat!("murmur/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| Error::Upstream(err.to_string()))?;

        let store = Self {
            root,
            ext: ext.into(),
            base_url,
            client,
            index: RwLock::new(Vec::new()),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of every indexed model.
    pub fn list(&self) -> Vec<Model> {
        self.index.read().unwrap().clone()
    }

    pub fn by_id(&self, id: &str) -> Option<Model> {
        self.index
            .read()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn by_path(&self, path: &str) -> Option<Model> {
        self.index
            .read()
            .unwrap()
            .iter()
            .find(|m| m.path == path)
            .cloned()
    }

    /// Walk the root and replace the index with what is actually on disk.
    pub fn rescan(&self) -> Result<()> {
        let mut models = Vec::new();
        scan_dir(&self.root, &self.root, &self.ext, &mut models)?;
        models.sort_by(|a, b| a.path.cmp(&b.path));
        *self.index.write().unwrap() = models;
        Ok(())
    }

    /// Remove a model's file and re-index.
    pub fn delete(&self, id: &str) -> Result<()> {
        let model = self
            .by_id(id)
            .ok_or_else(|| Error::NotFound(id.to_owned()))?;
        fs::remove_file(self.root.join(&model.path))?;
        tracing::info!(id = %model.id, path = %model.path, "deleted model");
        self.rescan()
    }

    /// Download the artifact at `rel_path` (relative to the store root) from
    /// the remote, reporting `(current, total)` bytes as it streams; `total`
    /// is zero when the remote did not say.
    ///
    /// If a model already exists at that path it is returned unchanged. On
    /// any failure the partial file is deleted before the error is returned,
    /// with cleanup failures recorded alongside the original error.
    pub fn download(
        &self,
        cancel: &CancelToken,
        rel_path: &str,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<Model> {
        let rel = clean_relative(rel_path)?;
        let rel_str = path_to_rel_string(&rel);

        if let Some(model) = self.by_path(&rel_str) {
            return Ok(model);
        }

        if !self.ext.is_empty() && !rel_str.ends_with(&self.ext) {
            return Err(Error::bad_parameter(format!(
                "bad file extension: {rel_str:?} (expected {:?})",
                self.ext
            )));
        }

        let dest = self.root.join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let url = self.resolve(&rel)?;
        tracing::info!(%url, path = %rel_str, "downloading model");

        let mut file = fs::File::create(&dest)?;
        let result = (|| -> Result<()> {
            let response = self
                .client
                .get(url)
                .send()
                .map_err(|err| Error::Upstream(err.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(Error::NotFound(rel_str.clone()));
            }
            if !status.is_success() {
                return Err(Error::Upstream(format!(
                    "unexpected status {status} for {rel_str:?}"
                )));
            }

            let total = response.content_length().unwrap_or(0);
            let mut reader = response;
            let mut current = 0u64;
            let mut buf = vec![0u8; DOWNLOAD_CHUNK];
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::RunAborted);
                }
                let n = reader
                    .read(&mut buf)
                    .map_err(|err| Error::Upstream(err.to_string()))?;
                if n == 0 {
                    break;
                }
                std::io::Write::write_all(&mut file, &buf[..n])?;
                current += n as u64;
                progress(current, total);
            }
            file.sync_all()?;
            Ok(())
        })();

        drop(file);
        if let Err(err) = result {
            return Err(match fs::remove_file(&dest) {
                Ok(()) => err,
                Err(rm) => err.join(rm.into()),
            });
        }

        self.rescan()?;
        self.by_path(&rel_str)
            .ok_or_else(|| Error::NotFound(rel_str))
    }

    /// Resolve a cleaned relative path against the base URL, keeping the
    /// base's query string.
    fn resolve(&self, rel: &Path) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::bad_parameter("model url cannot carry paths".to_owned()))?;
            segments.pop_if_empty();
            for component in rel.components() {
                if let Component::Normal(part) = component {
                    segments.push(&part.to_string_lossy());
                }
            }
        }
        Ok(url)
    }
}

/// Normalise a requested relative path, rejecting anything that would land
/// outside the store root: absolute paths, drive prefixes, or `..` runs that
/// climb past the top.
fn clean_relative(path: &str) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(Error::bad_parameter(format!("path escapes root: {path:?}")));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::bad_parameter(format!("path must be relative: {path:?}")));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(Error::bad_parameter(format!("empty path: {path:?}")));
    }
    Ok(clean)
}

fn path_to_rel_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn scan_dir(root: &Path, dir: &Path, ext: &str, out: &mut Vec<Model>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        // Hidden files and directories are never part of the store.
        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            scan_dir(root, &entry.path(), ext, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        if !ext.is_empty() && !name.ends_with(ext) {
            continue;
        }

        // Files we cannot stat are skipped rather than failing the scan.
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.len() < MIN_MODEL_SIZE {
            continue;
        }

        let created = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let rel = entry
            .path()
            .strip_prefix(root)
            .map(path_to_rel_string)
            .unwrap_or_else(|_| name.to_string());

        out.push(Model {
            id: model_name_to_id(&name),
            object: "model".to_owned(),
            path: rel,
            created,
            size: meta.len(),
            owned_by: String::new(),
        });
    }
    Ok(())
}

/// Derive a stable id from a model filename: lowercase, extension dropped,
/// anything outside `[a-z0-9.-]` mapped to `_`.
fn model_name_to_id(name: &str) -> String {
    let name = name.to_lowercase();
    let stem = match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name.as_str(),
    };
    stem.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        })
        .collect()
}
