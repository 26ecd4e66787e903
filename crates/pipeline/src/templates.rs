//! Template Store: named workflow templates loaded from disk.
//!
//! Templates are `<name>.json` files in one directory, in either workflow
//! encoding. Each is decoded once and cached; [`TemplateStore::get`] hands
//! out an owned deep copy, so a caller mutating its graph can never affect
//! another caller or the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::workflow::{self, node_types, Input, WorkflowGraph};
use tokio::sync::RwLock;

use crate::error::TemplateError;

const TEMPLATE_EXTENSION: &str = "json";

pub struct TemplateStore {
    dir: PathBuf,
    /// Model name -> template name.
    aliases: HashMap<String, String>,
    cache: RwLock<HashMap<String, Arc<WorkflowGraph>>>,
}

impl TemplateStore {
    /// A store reading `<name>.json` files from `dir`. Nothing is loaded
    /// until the first `get` or `preload`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            aliases: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Map model names to template names for [`TemplateStore::resolve`].
    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Template name to use for `model`. Unmapped models use their own name.
    pub fn resolve(&self, model: &str) -> String {
        self.aliases
            .get(model)
            .or_else(|| self.aliases.get(&model.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// An isolated copy of template `name`, loading it on first use.
    pub async fn get(&self, name: &str) -> Result<WorkflowGraph, TemplateError> {
        if let Some(cached) = self.cache.read().await.get(name) {
            return Ok(WorkflowGraph::clone(cached));
        }

        let graph = Arc::new(self.load(name).await?);
        let mut cache = self.cache.write().await;
        // A concurrent loader may have won the race; either copy is equal.
        let entry = cache.entry(name.to_string()).or_insert(graph);
        Ok(WorkflowGraph::clone(entry))
    }

    pub async fn invalidate(&self, name: &str) {
        if self.cache.write().await.remove(name).is_some() {
            tracing::debug!(template = name, "Template cache entry invalidated");
        }
    }

    pub async fn invalidate_all(&self) {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        tracing::debug!(dropped, "Template cache cleared");
    }

    /// Load every template in the directory into the cache. Invalid files
    /// are logged and skipped. Returns the number loaded.
    pub async fn preload(&self) -> Result<usize, TemplateError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|source| TemplateError::Io {
            name: self.dir.display().to_string(),
            source,
        })?;

        let mut loaded = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(name).await {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(template = name, error = %e, "Skipping invalid template"),
            }
        }
        Ok(loaded)
    }

    // ---- private helpers ----

    async fn load(&self, name: &str) -> Result<WorkflowGraph, TemplateError> {
        if !is_safe_name(name) {
            return Err(TemplateError::NotFound(name.to_string()));
        }

        let path = self.dir.join(format!("{name}.{TEMPLATE_EXTENSION}"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound(name.to_string()));
            }
            Err(source) => {
                return Err(TemplateError::Io {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| TemplateError::invalid(name, e))?;
        let graph = workflow::decode(&json).map_err(|e| TemplateError::invalid(name, e))?;

        warn_placeholder_models(name, &graph);
        tracing::info!(
            template = name,
            nodes = graph.len(),
            format = ?graph.format(),
            "Loaded workflow template",
        );
        Ok(graph)
    }
}

/// Template names are plain file stems; anything that could escape the
/// directory is treated as unknown.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

fn warn_placeholder_models(name: &str, graph: &WorkflowGraph) {
    for node in graph.nodes() {
        let Some(field) = node_types::model_field(&node.class_type) else {
            continue;
        };
        let placeholder = match node.inputs.get(field) {
            Some(Input::Value(v)) => v
                .as_str()
                .map_or(true, |s| node_types::PLACEHOLDER_MODEL_NAMES.contains(&s.trim())),
            Some(Input::Link(_)) => false,
            None => true,
        };
        if placeholder {
            tracing::warn!(
                template = name,
                node_id = %node.id,
                class_type = %node.class_type,
                field,
                "Template loader has a placeholder model name",
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
