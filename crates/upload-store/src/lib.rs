//! Uploaded files registry
//!
//! Observable, ordered list of uploaded PDF records plus the pipeline that
//! opens each upload in the background and patches its record as parsing and
//! preview rendering complete.
//!
//! # Example
//!
//! ```
//! use upload_model::{FileRecord, UploadAction};
//! use upload_store::{uploaded_files, UploadedFilesExt};
//!
//! let files = uploaded_files();
//! let subscription = files.subscribe(|list| println!("{} file(s)", list.len()));
//!
//! files.dispatch(UploadAction::Append(FileRecord::new("a.pdf", "blob:1")));
//! assert_eq!(files.get().len(), 1);
//!
//! subscription.unsubscribe();
//! ```

mod cancel;
mod config;
mod pipeline;
mod writable;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use config::{
    ConfigError, ParseFailurePolicy, PipelineConfig, ENV_ON_PARSE_FAILURE, ENV_PREVIEWS,
    ENV_PREVIEW_PAGE, ENV_PREVIEW_SIZE, MAX_PREVIEW_DIMENSION,
};
pub use pipeline::{PipelineError, UploadPipeline};
pub use writable::{Subscription, Writable};

use upload_model::{reduce_upload_action, FileRecord, RecordId, UploadAction};

/// The registry of uploaded files, in upload order.
pub type UploadedFiles = Writable<Vec<FileRecord>>;

/// Creates an empty registry. Construct one at startup and hand clones to
/// whatever needs it.
pub fn uploaded_files() -> UploadedFiles {
    Writable::new(Vec::new())
}

pub trait UploadedFilesExt {
    /// Applies `action` through `update`. Always notifies.
    fn dispatch(&self, action: UploadAction);

    /// Applies `action` only if the record it targets is still in the list.
    /// Returns whether anything was published.
    fn dispatch_if_present(&self, action: UploadAction) -> bool;

    fn record(&self, id: RecordId) -> Option<FileRecord>;
}

impl UploadedFilesExt for UploadedFiles {
    fn dispatch(&self, action: UploadAction) {
        self.update(|files| reduce_upload_action(files, action));
    }

    fn dispatch_if_present(&self, action: UploadAction) -> bool {
        self.try_update(|files| {
            if let Some(id) = action.target() {
                if !files.iter().any(|record| record.id == id) {
                    return None;
                }
            }
            Some(reduce_upload_action(files, action))
        })
    }

    fn record(&self, id: RecordId) -> Option<FileRecord> {
        self.get().iter().find(|record| record.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pdf_engine::{fixtures, LopdfEngine, OpenSource};
    use std::sync::Arc;

    fn snapshots(files: &UploadedFiles) -> (Arc<Mutex<Vec<Vec<FileRecord>>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription =
            files.subscribe(move |list: &Vec<FileRecord>| sink.lock().push(list.clone()));
        (seen, subscription)
    }

    #[test]
    fn registry_starts_empty() {
        let files = uploaded_files();
        let (seen, _subscription) = snapshots(&files);

        assert!(files.get().is_empty());
        assert_eq!(*seen.lock(), vec![Vec::<FileRecord>::new()]);
    }

    #[test]
    fn append_then_attach_document() {
        let files = uploaded_files();
        let (seen, _subscription) = snapshots(&files);

        let record = FileRecord::new("a.pdf", "blob:1");
        let id = record.id;
        files.dispatch(UploadAction::Append(record));

        {
            let seen = seen.lock();
            let latest = seen.last().expect("append should notify");
            assert_eq!(latest.len(), 1);
            assert_eq!(latest[0].name, "a.pdf");
            assert_eq!(latest[0].url, "blob:1");
            assert!(latest[0].document().is_none());
        }

        let document = LopdfEngine::new()
            .open_source(OpenSource::from(fixtures::pdf_with_pages(3)))
            .expect("fixture should open");
        files.dispatch(UploadAction::AttachDocument { id, document });

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        let latest = seen.last().expect("attach should notify");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].name, "a.pdf");
        assert_eq!(latest[0].url, "blob:1");
        assert_eq!(latest[0].num_pages(), Some(3));
        assert!(latest[0].document().is_some());
    }

    #[test]
    fn set_replaces_whole_list_without_validation() {
        let files = uploaded_files();
        let (seen, _subscription) = snapshots(&files);

        let duplicate = FileRecord::new("a.pdf", "blob:1");
        files.set(vec![duplicate.clone(), duplicate.clone()]);
        files.set(Vec::new());

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], vec![duplicate.clone(), duplicate]);
        assert!(seen[2].is_empty());
    }

    #[test]
    fn dispatch_notifies_even_when_target_is_missing() {
        let files = uploaded_files();
        let (seen, _subscription) = snapshots(&files);

        files.dispatch(UploadAction::Remove { id: RecordId::new() });

        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn dispatch_if_present_skips_missing_target() {
        let files = uploaded_files();
        let (seen, _subscription) = snapshots(&files);

        assert!(!files.dispatch_if_present(UploadAction::Remove { id: RecordId::new() }));
        assert!(files.dispatch_if_present(UploadAction::Append(FileRecord::new("a.pdf", "u"))));

        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn record_lookup_by_id() {
        let files = uploaded_files();
        let record = FileRecord::new("a.pdf", "blob:1");
        let id = record.id;
        files.dispatch(UploadAction::Append(record));

        assert_eq!(files.record(id).map(|record| record.name), Some("a.pdf".to_owned()));
        assert!(files.record(RecordId::new()).is_none());
    }
}
