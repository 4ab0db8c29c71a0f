//! Background parsing of uploaded files.
//!
//! Each registered record gets a parse task on the tokio runtime. The task
//! opens the document on a blocking thread, patches the record with the
//! document, then optionally renders a preview and patches that in as well.
//! Every patch is checked against the task's cancellation token under the
//! store lock, so a removed or superseded record is never written to by a
//! stale task.

use crate::{
    CancellationRegistry, CancellationToken, ParseFailurePolicy, PipelineConfig, UploadedFiles,
    UploadedFilesExt,
};
use parking_lot::Mutex;
use pdf_engine::{BlobStore, DocumentLoader, LopdfEngine, PdfDocument};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use upload_model::{reduce_upload_action, FileRecord, Preview, RecordId, UploadAction};

type OwnedUrls = Arc<Mutex<HashMap<RecordId, String>>>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("upload pipeline needs a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

pub struct UploadPipeline {
    files: UploadedFiles,
    loader: Arc<dyn DocumentLoader>,
    blobs: BlobStore,
    config: Arc<PipelineConfig>,
    cancellations: CancellationRegistry,
    owned_urls: OwnedUrls,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
}

impl UploadPipeline {
    /// Builds a pipeline on the current tokio runtime.
    ///
    /// `blobs` must be the store `loader` resolves `blob:` URLs against.
    pub fn new(
        files: UploadedFiles,
        loader: Arc<dyn DocumentLoader>,
        blobs: BlobStore,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_runtime(runtime, files, loader, blobs, config))
    }

    pub fn with_runtime(
        runtime: Handle,
        files: UploadedFiles,
        loader: Arc<dyn DocumentLoader>,
        blobs: BlobStore,
        config: PipelineConfig,
    ) -> Self {
        Self {
            files,
            loader,
            blobs,
            config: Arc::new(config),
            cancellations: CancellationRegistry::new(),
            owned_urls: Arc::default(),
            tasks: Mutex::new(Vec::new()),
            runtime,
        }
    }

    /// Pipeline backed by the default `lopdf` engine.
    pub fn with_lopdf(files: UploadedFiles, config: PipelineConfig) -> Result<Self, PipelineError> {
        let engine = LopdfEngine::new();
        let blobs = engine.blob_store().clone();
        Self::new(files, Arc::new(engine), blobs, config)
    }

    pub fn files(&self) -> &UploadedFiles {
        &self.files
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    /// Number of records with a parse still in flight.
    pub fn in_flight(&self) -> usize {
        self.cancellations.len()
    }

    /// Appends a record for `url` and starts parsing it.
    pub fn register(&self, name: impl Into<String>, url: impl Into<String>) -> RecordId {
        let record = FileRecord::new(name, url);
        let id = record.id;
        let url = record.url.clone();

        let token = self.cancellations.register(id);
        self.files.dispatch(UploadAction::Append(record));
        self.spawn_parse(id, url, token);
        id
    }

    /// Stores `bytes` under a new object URL owned by the pipeline, then
    /// registers it. The URL is revoked when the record goes away.
    pub fn register_bytes(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> RecordId {
        let url = self.blobs.create_object_url(bytes);
        let record = FileRecord::new(name, url.clone());
        let id = record.id;

        self.owned_urls.lock().insert(id, url.clone());
        let token = self.cancellations.register(id);
        self.files.dispatch(UploadAction::Append(record));
        self.spawn_parse(id, url, token);
        id
    }

    /// Cancels any parse for `id` and drops the record. Returns `false` if no
    /// such record existed.
    pub fn remove(&self, id: RecordId) -> bool {
        self.cancellations.cancel(id);
        let removed = self.files.dispatch_if_present(UploadAction::Remove { id });
        release_owned_url(&self.owned_urls, &self.blobs, id);

        debug!(record = %id, removed, "record removed");
        removed
    }

    /// Points an existing record at a new URL, cancelling the parse of the old
    /// one and starting a fresh parse.
    ///
    /// The new token is registered before observers hear about the reset, so a
    /// `replace` issued from an observer supersedes this one.
    pub fn replace(&self, id: RecordId, url: impl Into<String>) -> bool {
        let url = url.into();
        let token = self.cancellations.register(id);

        if !self.files.dispatch_if_present(UploadAction::Reset { id, url: url.clone() }) {
            self.cancellations.complete(id, &token);
            return false;
        }

        let previous = self.owned_urls.lock().remove(&id);
        if let Some(previous) = previous {
            if previous == url {
                self.owned_urls.lock().insert(id, previous);
            } else {
                self.blobs.revoke_object_url(&previous);
            }
        }

        debug!(record = %id, url = %url, "record superseded");
        self.spawn_parse(id, url, token);
        true
    }

    pub fn select_page(&self, id: RecordId, page: Option<u32>) -> bool {
        self.files.dispatch_if_present(UploadAction::SelectPage { id, page })
    }

    /// Cancels every parse, empties the registry and revokes owned URLs.
    pub fn clear(&self) {
        let cancelled = self.cancellations.cancel_all();
        self.files.dispatch(UploadAction::Clear);

        let urls: Vec<String> = self.owned_urls.lock().drain().map(|(_, url)| url).collect();
        for url in &urls {
            self.blobs.revoke_object_url(url);
        }

        debug!(cancelled, revoked = urls.len(), "registry cleared");
    }

    /// Waits until every parse task started so far, and any started while
    /// waiting, has finished.
    pub async fn settle(&self) {
        loop {
            let pending = std::mem::take(&mut *self.tasks.lock());
            if pending.is_empty() {
                return;
            }

            for handle in pending {
                if let Err(err) = handle.await {
                    warn!(error = %err, "parse task did not complete");
                }
            }
        }
    }

    fn spawn_parse(&self, id: RecordId, url: String, token: CancellationToken) {
        if token.is_cancelled() {
            debug!(record = %id, url = %url, "parse superseded before start");
            return;
        }

        let task = ParseTask {
            id,
            url,
            token,
            files: self.files.clone(),
            loader: Arc::clone(&self.loader),
            config: Arc::clone(&self.config),
            cancellations: self.cancellations.clone(),
            owned_urls: Arc::clone(&self.owned_urls),
            blobs: self.blobs.clone(),
        };

        debug!(record = %id, url = %task.url, "parse scheduled");
        let handle = self.runtime.spawn(task.run());

        let mut tasks = self.tasks.lock();
        tasks.retain(|existing| !existing.is_finished());
        tasks.push(handle);
    }
}

impl Drop for UploadPipeline {
    fn drop(&mut self) {
        self.cancellations.cancel_all();
    }
}

fn release_owned_url(owned_urls: &OwnedUrls, blobs: &BlobStore, id: RecordId) {
    let url = owned_urls.lock().remove(&id);
    if let Some(url) = url {
        blobs.revoke_object_url(&url);
    }
}

struct ParseTask {
    id: RecordId,
    url: String,
    token: CancellationToken,
    files: UploadedFiles,
    loader: Arc<dyn DocumentLoader>,
    config: Arc<PipelineConfig>,
    cancellations: CancellationRegistry,
    owned_urls: OwnedUrls,
    blobs: BlobStore,
}

impl ParseTask {
    async fn run(self) {
        self.execute().await;
        self.cancellations.complete(self.id, &self.token);
    }

    async fn execute(&self) {
        let loader = Arc::clone(&self.loader);
        let url = self.url.clone();

        let opened = tokio::select! {
            biased;
            () = self.token.cancelled() => {
                debug!(record = %self.id, "parse cancelled");
                return;
            }
            joined = tokio::task::spawn_blocking(move || loader.open(&url)) => joined,
        };

        let document = match opened {
            Ok(Ok(document)) => document,
            Ok(Err(err)) => return self.fail(err.to_string()),
            Err(err) => return self.fail(format!("parse task failed: {err}")),
        };

        let num_pages = document.page_count();
        if !self.patch(UploadAction::AttachDocument { id: self.id, document: document.clone() }) {
            debug!(record = %self.id, "parsed document discarded");
            return;
        }
        debug!(record = %self.id, num_pages, "document attached");

        if self.config.generate_previews {
            self.render_preview(document).await;
        }
    }

    async fn render_preview(&self, document: PdfDocument) {
        let page_index = self
            .config
            .preview_page
            .saturating_sub(1)
            .min(document.page_count().saturating_sub(1));
        let size = self.config.preview_size;

        let rendered = tokio::select! {
            biased;
            () = self.token.cancelled() => {
                debug!(record = %self.id, "preview cancelled");
                return;
            }
            joined = tokio::task::spawn_blocking(move || {
                document.render_preview(page_index, size)
            }) => joined,
        };

        match rendered {
            Ok(Ok(data_url)) => {
                let preview = Preview::new(data_url);
                if self.patch(UploadAction::AttachPreview { id: self.id, preview }) {
                    debug!(record = %self.id, page = page_index + 1, "preview attached");
                }
            }
            Ok(Err(err)) => warn!(record = %self.id, error = %err, "preview rendering failed"),
            Err(err) => warn!(record = %self.id, error = %err, "preview task failed"),
        }
    }

    fn fail(&self, reason: String) {
        warn!(record = %self.id, url = %self.url, reason = %reason, "document failed to open");

        match self.config.on_parse_failure {
            ParseFailurePolicy::MarkFailed => {
                self.patch(UploadAction::MarkFailed { id: self.id, reason });
            }
            ParseFailurePolicy::Remove => {
                if self.patch(UploadAction::Remove { id: self.id }) {
                    release_owned_url(&self.owned_urls, &self.blobs, self.id);
                }
            }
        }
    }

    /// Applies `action` unless this task was cancelled or its record is gone
    /// or now points at another URL.
    fn patch(&self, action: UploadAction) -> bool {
        let id = self.id;
        let url = self.url.as_str();
        let token = &self.token;

        self.files.try_update(|files| {
            let current = files.iter().any(|record| record.id == id && record.url == url);
            if token.is_cancelled() || !current {
                return None;
            }
            Some(reduce_upload_action(files, action))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdf_engine::{fixtures, OpenSource, PdfEngineError};
    use std::time::Duration;
    use upload_model::{RecordStage, StageKind};

    #[derive(Clone, Copy)]
    enum Outcome {
        Pages(u32),
        Invalid,
    }

    /// Loader that answers from a fixed table after an artificial delay.
    struct ScriptedLoader {
        engine: LopdfEngine,
        script: HashMap<&'static str, (Duration, Outcome)>,
    }

    impl ScriptedLoader {
        fn new(entries: &[(&'static str, u64, Outcome)]) -> Arc<Self> {
            let script = entries
                .iter()
                .map(|(url, delay_ms, outcome)| {
                    (*url, (Duration::from_millis(*delay_ms), *outcome))
                })
                .collect();
            Arc::new(Self { engine: LopdfEngine::new(), script })
        }
    }

    impl DocumentLoader for ScriptedLoader {
        fn open(&self, url: &str) -> Result<PdfDocument, PdfEngineError> {
            let (delay, outcome) = self
                .script
                .get(url)
                .copied()
                .ok_or_else(|| PdfEngineError::UnsupportedUrl(url.to_owned()))?;
            std::thread::sleep(delay);

            let bytes = match outcome {
                Outcome::Pages(pages) => fixtures::pdf_with_pages(pages),
                Outcome::Invalid => fixtures::invalid_pdf(),
            };
            self.engine.open_source(OpenSource::from(bytes))
        }
    }

    fn scripted_pipeline(
        entries: &[(&'static str, u64, Outcome)],
        config: PipelineConfig,
    ) -> UploadPipeline {
        let loader = ScriptedLoader::new(entries);
        UploadPipeline::new(crate::uploaded_files(), loader, BlobStore::new(), config)
            .expect("tokio runtime should be available")
    }

    type StageHistory = Arc<Mutex<Vec<Vec<StageKind>>>>;

    fn stage_history(files: &UploadedFiles) -> (StageHistory, crate::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = files.subscribe(move |list: &Vec<FileRecord>| {
            sink.lock().push(list.iter().map(|record| record.stage.kind()).collect());
        });
        (seen, subscription)
    }

    fn lopdf_pipeline() -> UploadPipeline {
        UploadPipeline::with_lopdf(crate::uploaded_files(), PipelineConfig::default())
            .expect("runtime available")
    }

    #[tokio::test]
    async fn uploaded_bytes_progress_to_previewed() {
        let pipeline = lopdf_pipeline();
        let (history, _subscription) = stage_history(pipeline.files());

        let id = pipeline.register_bytes("a.pdf", fixtures::pdf_with_pages(3));
        pipeline.settle().await;

        let record = pipeline.files().record(id).expect("record should exist");
        assert_eq!(record.name, "a.pdf");
        assert!(record.url.starts_with("blob:"));
        assert_eq!(record.num_pages(), Some(3));
        let preview = record.preview().expect("preview should be attached");
        assert!(preview.as_str().starts_with("data:image/png;base64,"));

        assert_eq!(
            *history.lock(),
            vec![
                vec![],
                vec![StageKind::Registered],
                vec![StageKind::Parsed],
                vec![StageKind::Previewed],
            ]
        );
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn insertion_order_survives_out_of_order_completion() {
        let pipeline = scripted_pipeline(
            &[("slow", 150, Outcome::Pages(2)), ("fast", 0, Outcome::Pages(1))],
            PipelineConfig::default().with_previews(false),
        );
        let (history, _subscription) = stage_history(pipeline.files());

        pipeline.register("a.pdf", "slow");
        pipeline.register("b.pdf", "fast");
        pipeline.settle().await;

        let files = pipeline.files().get();
        let names: Vec<_> = files.iter().map(|record| record.name.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf"]);
        assert_eq!(files[0].num_pages(), Some(2));
        assert_eq!(files[1].num_pages(), Some(1));

        let history = history.lock();
        assert!(history.contains(&vec![StageKind::Registered, StageKind::Parsed]));
        assert_eq!(history.last(), Some(&vec![StageKind::Parsed, StageKind::Parsed]));
    }

    #[tokio::test]
    async fn parse_failure_marks_record_failed_by_default() {
        let pipeline = lopdf_pipeline();

        let id = pipeline.register_bytes("broken.pdf", fixtures::invalid_pdf());
        pipeline.settle().await;

        let record = pipeline.files().record(id).expect("failed record is kept");
        let reason = record.failure().expect("record should be failed");
        assert!(reason.contains("PDF parse error"), "unexpected reason: {reason}");
        assert!(record.document().is_none());
        assert_eq!(pipeline.blob_store().len(), 1);
    }

    #[tokio::test]
    async fn parse_failure_can_remove_record_and_revoke_url() {
        let pipeline = UploadPipeline::with_lopdf(
            crate::uploaded_files(),
            PipelineConfig::default().with_failure_policy(ParseFailurePolicy::Remove),
        )
        .expect("runtime available");

        pipeline.register_bytes("good.pdf", fixtures::pdf_with_pages(1));
        pipeline.register_bytes("broken.pdf", fixtures::invalid_pdf());
        pipeline.settle().await;

        let files = pipeline.files().get();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "good.pdf");
        assert_eq!(pipeline.blob_store().len(), 1);
    }

    #[tokio::test]
    async fn unsupported_url_is_reported_as_failure() {
        let pipeline = lopdf_pipeline();

        let id = pipeline.register("remote.pdf", "https://example.com/remote.pdf");
        pipeline.settle().await;

        let record = pipeline.files().record(id).expect("record is kept");
        assert!(matches!(record.stage, RecordStage::Failed { .. }));
    }

    #[tokio::test]
    async fn removing_record_cancels_inflight_parse() {
        let pipeline = scripted_pipeline(
            &[("slow", 300, Outcome::Pages(4))],
            PipelineConfig::default(),
        );
        let (history, _subscription) = stage_history(pipeline.files());

        let id = pipeline.register("slow.pdf", "slow");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pipeline.in_flight(), 1);

        assert!(pipeline.remove(id));
        tokio::time::timeout(Duration::from_millis(200), pipeline.settle())
            .await
            .expect("cancelled parse should finish without waiting for the loader");

        assert!(pipeline.files().get().is_empty());
        assert_eq!(pipeline.in_flight(), 0);
        assert!(history.lock().iter().flatten().all(|kind| *kind == StageKind::Registered));
        assert!(!pipeline.remove(id));
    }

    #[tokio::test]
    async fn removing_record_revokes_owned_url() {
        let pipeline = lopdf_pipeline();

        let id = pipeline.register_bytes("a.pdf", fixtures::pdf_with_pages(1));
        pipeline.settle().await;
        let url = pipeline.files().record(id).expect("record exists").url;

        assert!(pipeline.remove(id));
        assert!(!pipeline.blob_store().contains(&url));
    }

    #[tokio::test]
    async fn replace_supersedes_pending_parse() {
        let pipeline = scripted_pipeline(
            &[("v1", 200, Outcome::Pages(5)), ("v2", 0, Outcome::Pages(2))],
            PipelineConfig::default().with_previews(false),
        );

        let id = pipeline.register("doc.pdf", "v1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pipeline.replace(id, "v2"));
        pipeline.settle().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let record = pipeline.files().record(id).expect("record should exist");
        assert_eq!(record.url, "v2");
        assert_eq!(record.num_pages(), Some(2));
        assert_eq!(pipeline.files().get().len(), 1);
    }

    #[tokio::test]
    async fn replace_from_observer_wins_over_outer_replace() {
        let pipeline = Arc::new(scripted_pipeline(
            &[
                ("v1", 200, Outcome::Pages(5)),
                ("v1b", 100, Outcome::Pages(3)),
                ("v2", 0, Outcome::Pages(2)),
            ],
            PipelineConfig::default().with_previews(false),
        ));

        let id = pipeline.register("doc.pdf", "v1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let weak = Arc::downgrade(&pipeline);
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let once = Arc::clone(&fired);
        let _subscription = pipeline.files().subscribe(move |list: &Vec<FileRecord>| {
            let saw_v1b = list.iter().any(|record| record.id == id && record.url == "v1b");
            if saw_v1b && !once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.replace(id, "v2");
                }
            }
        });

        assert!(pipeline.replace(id, "v1b"));
        pipeline.settle().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let record = pipeline.files().record(id).expect("record should exist");
        assert_eq!(record.url, "v2");
        assert_eq!(record.num_pages(), Some(2));
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn replace_unknown_record_is_rejected() {
        let pipeline = scripted_pipeline(&[], PipelineConfig::default());

        assert!(!pipeline.replace(RecordId::new(), "v2"));
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn select_page_is_clamped_after_parse() {
        let pipeline = UploadPipeline::with_lopdf(
            crate::uploaded_files(),
            PipelineConfig::default().with_previews(false),
        )
        .expect("runtime available");

        let id = pipeline.register_bytes("a.pdf", fixtures::pdf_with_pages(4));
        pipeline.settle().await;

        assert!(pipeline.select_page(id, Some(9)));
        assert_eq!(pipeline.files().record(id).and_then(|record| record.selected_page), Some(4));
        assert!(!pipeline.select_page(RecordId::new(), Some(1)));
    }

    #[tokio::test]
    async fn preview_page_is_clamped_to_document() {
        let pipeline = UploadPipeline::with_lopdf(
            crate::uploaded_files(),
            PipelineConfig::default().with_preview_page(10),
        )
        .expect("runtime available");

        let id = pipeline.register_bytes("a.pdf", fixtures::pdf_with_pages(2));
        pipeline.settle().await;

        let record = pipeline.files().record(id).expect("record should exist");
        assert_eq!(record.stage.kind(), StageKind::Previewed);
    }

    #[tokio::test]
    async fn previews_can_be_disabled() {
        let pipeline = UploadPipeline::with_lopdf(
            crate::uploaded_files(),
            PipelineConfig::default().with_previews(false),
        )
        .expect("runtime available");

        let id = pipeline.register_bytes("a.pdf", fixtures::pdf_with_pages(1));
        pipeline.settle().await;

        let record = pipeline.files().record(id).expect("record should exist");
        assert_eq!(record.stage.kind(), StageKind::Parsed);
        assert!(record.preview().is_none());
    }

    #[tokio::test]
    async fn clear_cancels_everything_and_revokes_urls() {
        let pipeline = lopdf_pipeline();

        pipeline.register_bytes("a.pdf", fixtures::pdf_with_pages(1));
        pipeline.register_bytes("b.pdf", fixtures::pdf_with_pages(2));
        pipeline.clear();
        pipeline.settle().await;

        assert!(pipeline.files().get().is_empty());
        assert!(pipeline.blob_store().is_empty());
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[test]
    fn pipeline_requires_a_runtime() {
        let result = UploadPipeline::with_lopdf(crate::uploaded_files(), PipelineConfig::default());

        assert!(matches!(result, Err(PipelineError::NoRuntime(_))));
    }
}
