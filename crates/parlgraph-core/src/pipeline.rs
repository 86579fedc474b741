//! Extraction run for one video: windows, two-pass extraction, then
//! canonical storage.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use parlgraph_store::{EmbeddingProvider, GraphStore};
use serde::Serialize;

use crate::canonicalizer::{CanonicalizeStats, Canonicalizer};
use crate::extractor::{ExtractionResult, TwoPassExtractor};
use crate::known_nodes::{candidate_nodes, format_known_nodes, DEFAULT_KNOWN_NODES_TOP_K};
use crate::window::{build_windows, prepare_utterances, Window, DEFAULT_STRIDE, DEFAULT_WINDOW_SIZE};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub window_size: usize,
    pub stride: usize,
    pub filter_short: bool,
    pub known_nodes_top_k: usize,
    /// Windows extracted at once. Results keep window order regardless.
    pub concurrency: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            stride: DEFAULT_STRIDE,
            filter_short: true,
            known_nodes_top_k: DEFAULT_KNOWN_NODES_TOP_K,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub run_id: String,
    pub video_id: String,
    pub utterances: usize,
    pub windows: usize,
    pub second_passes: usize,
    pub edges_ranked: usize,
    #[serde(flatten)]
    pub canonical: CanonicalizeStats,
}

pub struct ExtractionRun {
    store: GraphStore,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: TwoPassExtractor,
    canonicalizer: Canonicalizer,
    settings: RunSettings,
}

impl ExtractionRun {
    pub fn new(
        store: GraphStore,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: TwoPassExtractor,
        canonicalizer: Canonicalizer,
        settings: RunSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            canonicalizer,
            settings,
        }
    }

    async fn known_nodes_table(&self, window: &Window<'_>, window_text: &str) -> String {
        let speakers = window.speaker_ids();
        match candidate_nodes(
            &self.store,
            self.embedder.as_ref(),
            window_text,
            &speakers,
            self.settings.known_nodes_top_k,
        )
        .await
        {
            Ok(candidates) => format_known_nodes(&candidates),
            Err(e) => {
                tracing::warn!(
                    "known nodes lookup failed for window {}: {e:#}",
                    window.window_index
                );
                format_known_nodes(&[])
            }
        }
    }

    async fn extract_window<'a>(&self, window: Window<'a>) -> ExtractionResult<'a> {
        let table = self.known_nodes_table(&window, &window.text()).await;
        let result = self.extractor.extract(window, &table).await;
        if !result.parse_success {
            tracing::warn!(
                "window {} failed: {}",
                window.window_index,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }

    /// Extracts and stores the graph for one video. Window failures are
    /// counted in the stats; only store errors abort the run.
    pub async fn run_video(&self, video_id: &str) -> Result<RunStats> {
        let utterances = self
            .store
            .fetch_utterances(video_id)
            .await
            .with_context(|| format!("loading utterances for {video_id}"))?;
        let prepared = prepare_utterances(&utterances, self.settings.filter_short);
        let windows = build_windows(&prepared, self.settings.window_size, self.settings.stride);
        let run_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            "run {run_id}: {} utterances, {} windows for {video_id} (two_pass={}, concurrency={})",
            utterances.len(),
            windows.len(),
            self.extractor.settings().two_pass,
            self.settings.concurrency.max(1)
        );
        if windows.is_empty() {
            tracing::warn!("no complete windows for {video_id}, nothing to extract");
        }

        let window_count = windows.len();
        let results: Vec<ExtractionResult<'_>> = futures::stream::iter(windows)
            .map(|window| self.extract_window(window))
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;
        let second_passes = results
            .iter()
            .filter(|r| r.diagnostics.pass2_kind.is_some())
            .count();

        let canonical = self
            .canonicalizer
            .canonicalize_and_store(&results, video_id, &run_id, self.extractor.model())
            .await?;
        let edges_ranked = self.store.refresh_edge_ranks().await?;

        tracing::info!(
            "run {run_id} finished: {second_passes} second passes, {} nodes embedded, {edges_ranked} edges ranked",
            canonical.nodes_embedded
        );

        Ok(RunStats {
            run_id,
            video_id: video_id.to_string(),
            utterances: utterances.len(),
            windows: window_count,
            second_passes,
            edges_ranked,
            canonical,
        })
    }
}
