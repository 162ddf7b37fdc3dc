use serde::{Deserialize, Serialize};

/// The action that produced a file record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum Action {
    /// A large file upload has been started and not yet finished.
    Start,
    /// A file was uploaded.
    Upload,
    /// A file was copied from another file.
    Copy,
    /// A hide marker: the file name is hidden from listings.
    Hide,
    /// A virtual folder, returned when listing with a delimiter.
    Folder,
}

impl Action {
    /// True for records that carry stored content.
    pub fn is_file(self) -> bool {
        matches!(self, Action::Upload | Action::Copy)
    }
}
