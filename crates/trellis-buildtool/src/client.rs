//! Build tool client: cached queries and build/test/run invocations

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};
use trellis_core::{
    BuildToolError, BuildToolSettings, CacheStats, CancelToken, QueryCache, expression_packages, normalize_query,
    package_of,
};

use crate::events::BuildEvent;
use crate::invocation::{self, InvocationReport, InvocationRequest};
use crate::query::{QueryAttribute, QueryResult, decode_query_output};

/// Kind and visibility of one target, as reported by the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetInfo {
    pub label: String,
    pub kind: String,
    pub visibility: Vec<String>,
}

/// One client per workspace. Concurrent calls run as independent
/// subprocesses; identical concurrent queries share one.
pub struct BuildToolClient {
    root: PathBuf,
    settings: BuildToolSettings,
    cache: QueryCache<Arc<QueryResult>>,
}

impl BuildToolClient {
    pub fn new(root: impl Into<PathBuf>, settings: BuildToolSettings) -> Self {
        let cache = QueryCache::new(settings.cache_ttl());
        BuildToolClient { root: root.into(), settings, cache }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &BuildToolSettings {
        &self.settings
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ── Queries ─────────────────────────────────────────────

    /// Run a structural query, serving it from the cache when fresh.
    /// Failures are returned to every waiter and never cached.
    pub async fn query(&self, expression: &str) -> Result<Arc<QueryResult>, BuildToolError> {
        let key = normalize_query(expression);
        if let Some(hit) = self.cache.get(&key) {
            debug!("Query cache hit: {}", key);
            return Ok(hit);
        }

        let lock = self.cache.in_flight_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            match self.cache.get(&key) {
                Some(hit) => Ok(hit),
                None => self.fetch(expression, &key).await,
            }
        };
        drop(lock);
        self.cache.release_in_flight(&key);
        result
    }

    async fn fetch(&self, expression: &str, key: &str) -> Result<Arc<QueryResult>, BuildToolError> {
        let generation = self.cache.generation();
        let mut command = Command::new(&self.settings.executable);
        command
            .arg("query")
            .arg(expression)
            .arg("--output=streamed_jsonproto")
            .args(&self.settings.query_flags)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!("Running query: {}", key);
        let output = command
            .output()
            .await
            .map_err(|e| invocation::spawn_error(&self.settings.executable, e))?;

        if !output.status.success() {
            return Err(BuildToolError::QueryFailed {
                expression: expression.to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let result = Arc::new(decode_query_output(&String::from_utf8_lossy(&output.stdout))?);
        let mut packages = expression_packages(key);
        packages.extend(result.packages());
        if self.cache.insert_since(key, Arc::clone(&result), packages, generation) {
            debug!("Cached {} targets for {}", result.targets.len(), key);
        }
        Ok(result)
    }

    /// Kind and visibility of `label`.
    pub async fn target_info(&self, label: &str) -> Result<TargetInfo, BuildToolError> {
        let result = self.query(label).await?;
        let target = result
            .targets
            .iter()
            .find(|t| t.label == label)
            .or_else(|| result.targets.first())
            .ok_or_else(|| BuildToolError::Decode(format!("query for {label} returned no targets")))?;
        let visibility = match target.attributes.get("visibility") {
            Some(QueryAttribute::StringList(list)) => list.clone(),
            Some(QueryAttribute::String(one)) => vec![one.clone()],
            _ => vec!["//visibility:private".to_string()],
        };
        Ok(TargetInfo { label: target.label.clone(), kind: target.kind.clone(), visibility })
    }

    /// Drop cached queries that could see a change to `path`.
    pub fn invalidate_path(&self, path: &Path) -> usize {
        let dir = if path.is_dir() { path } else { path.parent().unwrap_or(path) };
        match package_of(&self.root, dir) {
            Some(package) => self.cache.invalidate_package(&package),
            None => 0,
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    // ── build / test / run ──────────────────────────────────

    /// Run `request`, handing each decoded event to `on_event` in emission
    /// order. Resolves when the tool exits or `cancel` fires.
    pub async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancelToken,
        on_event: impl FnMut(BuildEvent) + Send,
    ) -> Result<InvocationReport, BuildToolError> {
        invocation::drive(&self.settings, &self.root, request, cancel, on_event).await
    }
}
