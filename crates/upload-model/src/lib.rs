use pdf_engine::PdfDocument;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Rendered thumbnail of a file, usually a PNG `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview(String);

impl Preview {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Where a record is in its registered -> parsed -> previewed progression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStage {
    Registered,
    Parsed { document: PdfDocument, num_pages: u32 },
    Previewed { document: PdfDocument, num_pages: u32, preview: Preview },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Registered,
    Parsed,
    Previewed,
    Failed,
}

impl RecordStage {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Registered => StageKind::Registered,
            Self::Parsed { .. } => StageKind::Parsed,
            Self::Previewed { .. } => StageKind::Previewed,
            Self::Failed { .. } => StageKind::Failed,
        }
    }

    fn parsed(document: PdfDocument) -> Self {
        let num_pages = document.page_count();
        Self::Parsed { document, num_pages }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: RecordId,
    pub name: String,
    pub url: String,
    pub stage: RecordStage,
    /// 1-based page highlighted in the UI.
    pub selected_page: Option<u32>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            url: url.into(),
            stage: RecordStage::Registered,
            selected_page: None,
        }
    }

    pub fn num_pages(&self) -> Option<u32> {
        match &self.stage {
            RecordStage::Parsed { num_pages, .. } | RecordStage::Previewed { num_pages, .. } => {
                Some(*num_pages)
            }
            RecordStage::Registered | RecordStage::Failed { .. } => None,
        }
    }

    pub fn document(&self) -> Option<&PdfDocument> {
        match &self.stage {
            RecordStage::Parsed { document, .. } | RecordStage::Previewed { document, .. } => {
                Some(document)
            }
            RecordStage::Registered | RecordStage::Failed { .. } => None,
        }
    }

    pub fn preview(&self) -> Option<&Preview> {
        match &self.stage {
            RecordStage::Previewed { preview, .. } => Some(preview),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.stage {
            RecordStage::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.document().is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadAction {
    Append(FileRecord),
    AttachDocument { id: RecordId, document: PdfDocument },
    AttachPreview { id: RecordId, preview: Preview },
    MarkFailed { id: RecordId, reason: String },
    Reset { id: RecordId, url: String },
    SelectPage { id: RecordId, page: Option<u32> },
    Remove { id: RecordId },
    Clear,
}

impl UploadAction {
    /// Record the action patches, if it targets a single existing record.
    pub fn target(&self) -> Option<RecordId> {
        match self {
            Self::AttachDocument { id, .. }
            | Self::AttachPreview { id, .. }
            | Self::MarkFailed { id, .. }
            | Self::Reset { id, .. }
            | Self::SelectPage { id, .. }
            | Self::Remove { id } => Some(*id),
            Self::Append(_) | Self::Clear => None,
        }
    }
}

/// Pure form of [`apply_upload_action`], suitable for a store `update`.
pub fn reduce_upload_action(files: &[FileRecord], action: UploadAction) -> Vec<FileRecord> {
    let mut next = files.to_vec();
    apply_upload_action(&mut next, action);
    next
}

pub fn apply_upload_action(files: &mut Vec<FileRecord>, action: UploadAction) {
    match action {
        UploadAction::Append(record) => files.push(record),
        UploadAction::AttachDocument { id, document } => {
            if let Some(record) = find_mut(files, id) {
                record.stage = RecordStage::parsed(document);
                if let (Some(page), Some(count)) = (record.selected_page, record.num_pages()) {
                    record.selected_page = Some(page.clamp(1, count.max(1)));
                }
            }
        }
        UploadAction::AttachPreview { id, preview } => {
            let Some(record) = find_mut(files, id) else {
                return;
            };

            let stage = std::mem::replace(&mut record.stage, RecordStage::Registered);
            record.stage = match stage {
                RecordStage::Parsed { document, num_pages }
                | RecordStage::Previewed { document, num_pages, .. } => {
                    RecordStage::Previewed { document, num_pages, preview }
                }
                other => other,
            };
        }
        UploadAction::MarkFailed { id, reason } => {
            if let Some(record) = find_mut(files, id) {
                record.stage = RecordStage::Failed { reason };
                record.selected_page = None;
            }
        }
        UploadAction::Reset { id, url } => {
            if let Some(record) = find_mut(files, id) {
                record.url = url;
                record.stage = RecordStage::Registered;
                record.selected_page = None;
            }
        }
        UploadAction::SelectPage { id, page } => {
            let Some(record) = find_mut(files, id) else {
                return;
            };

            match (page, record.num_pages()) {
                (None, _) => record.selected_page = None,
                (Some(page), Some(count)) => {
                    record.selected_page = Some(page.clamp(1, count.max(1)));
                }
                (Some(_), None) => {}
            }
        }
        UploadAction::Remove { id } => files.retain(|record| record.id != id),
        UploadAction::Clear => files.clear(),
    }
}

fn find_mut(files: &mut [FileRecord], id: RecordId) -> Option<&mut FileRecord> {
    files.iter_mut().find(|record| record.id == id)
}
