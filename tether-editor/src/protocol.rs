use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Global topics, shared by every editor instance.
pub mod global {
    /// Editor content → host: the page has booted and wants its model.
    pub const CREATE_EDITOR: &str = "_createEditor";
    /// Host → editor content: create the editor with this data.
    pub const DO_CREATE_EDITOR: &str = "_doCreateEditor";
}

/// Actions namespaced per editor instance (`<namespace>_<action>`).
pub mod action {
    // Host → editor content
    pub const DO_REINITIALIZATION: &str = "doReinitialization";
    pub const SET_CONTENT: &str = "setContent";
    pub const GET_CONTENTS: &str = "getContents";
    pub const SELECT_AND_REVEAL: &str = "selectAndReveal";
    pub const SUBSCRIBE_MODEL_CHANGES: &str = "subscribeModelChanges";
    pub const UNDO: &str = "undo";
    pub const REDO: &str = "redo";
    pub const COPY: &str = "doCopy";
    pub const CUT: &str = "doCut";
    pub const FIND: &str = "doFind";
    pub const PASTE: &str = "doPaste";
    pub const SELECT_ALL: &str = "doSelectAll";
    pub const FILE_PATH_CHANGED: &str = "filePathChanged";
    pub const DID_SAVE: &str = "didSave";
    pub const REPORT_CHANGES: &str = "reportChanges";
    pub const RELOAD: &str = "reload";
    pub const MODEL_RESOLVED: &str = "modelResolved";

    // Editor content → host
    pub const DO_GET_CONTENTS: &str = "doGetContents";
    pub const SELECTION: &str = "selection";
    pub const CHANGES_NOTIFICATION: &str = "changesNotification";
    pub const DISPOSE_EDITOR: &str = "disposeEditor";
    pub const DO_SAVE_AS: &str = "doSaveAs";
    pub const DO_SAVE: &str = "doSave";
    pub const DO_RELOAD: &str = "doReload";
    pub const MAKE_RENAME: &str = "makeRename";
    pub const FIND_ALL_REFERENCES: &str = "findAllReferences";
    pub const GET_CONTENT_OF: &str = "getContentOf";
}

// ---------------------------------------------------------------------------
// Host → editor content payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEditorPayload {
    pub text: String,
    pub name: String,
    pub namespace: String,
    /// `null` when no language server is bound.
    pub lsp_path: Option<String>,
    /// True when the language server belongs to the host rather than to a
    /// proxy this bridge launched.
    pub bind_eclipse_lsp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinitializePayload {
    pub text: String,
    pub name: String,
    pub lsp_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetContentPayload {
    pub content: String,
    /// False replaces the text without leaving an undo entry.
    pub as_edit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectAndRevealPayload {
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePathChangedPayload {
    pub file_path: String,
    pub file_name: String,
}

// ---------------------------------------------------------------------------
// Editor content → host payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEditorRequest {
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentsReply {
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesNotification {
    pub is_dirty: bool,
    pub can_undo: bool,
    pub can_redo: bool,
    #[serde(default)]
    pub content: Option<String>,
}

/// Selection as reported by the editor: either a flat offset range or a
/// 1-based line/column range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    Offset {
        offset: u32,
        length: u32,
    },
    #[serde(rename_all = "camelCase")]
    Range {
        start_line_number: u32,
        start_column: u32,
        end_line_number: u32,
        end_column: u32,
    },
}

impl Selection {
    /// Resolve to `(offset, length)` against `text`. Line/column ranges are
    /// clamped to the text.
    pub fn to_offset_length(&self, text: &str) -> (u32, u32) {
        match *self {
            Selection::Offset { offset, length } => (offset, length),
            Selection::Range {
                start_line_number,
                start_column,
                end_line_number,
                end_column,
            } => {
                let start = line_column_to_offset(text, start_line_number, start_column);
                let end = line_column_to_offset(text, end_line_number, end_column);
                let (start, end) = if end < start { (end, start) } else { (start, end) };
                (start, end - start)
            }
        }
    }
}

/// Character offset for a 1-based line/column position.
fn line_column_to_offset(text: &str, line: u32, column: u32) -> u32 {
    let mut offset = 0u32;
    let mut lines = text.split_inclusive('\n');
    for _ in 1..line.max(1) {
        match lines.next() {
            Some(l) => offset += l.chars().count() as u32,
            None => return offset,
        }
    }
    let current = lines
        .next()
        .map(|l| l.trim_end_matches('\n').chars().count() as u32)
        .unwrap_or(0);
    offset + column.saturating_sub(1).min(current)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetContentOfRequest {
    pub path: String,
}
