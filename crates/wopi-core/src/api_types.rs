use serde::{Deserialize, Serialize};

/// Response body for the WOPI CheckFileInfo call.
/// See: https://wopi.readthedocs.io/projects/wopirest/en/latest/files/CheckFileInfo.html
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CheckFileInfo {
    /// File name including extension, without a path.
    pub base_file_name: String,
    /// File size in bytes.
    pub size: i64,
    /// Uniquely identifies the owner of the file.
    pub owner_id: String,
    /// Uniquely identifies the user currently accessing the file.
    pub user_id: String,
    /// Name shown to other users while editing collaboratively.
    pub user_friendly_name: String,
    pub user_can_write: bool,
    /// Disables "Save As" in the editor; saves go back to the original file.
    pub user_can_not_write_relative: bool,
}

/// Discovery action resolved for one file extension.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExtensionAction {
    /// URL template used to open the editor for this extension.
    pub url: String,
    /// "edit" or "view".
    pub action: String,
}

/// Per-file info returned to the host UI for rendering attachment previews.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientFileInfo {
    pub id: String,
    pub name: String,
    pub extension: String,
    pub action: String,
}

/// URL + bearer credential the host UI passes to the editor iframe.
#[derive(Serialize, Deserialize, Debug)]
pub struct EditorUrl {
    pub url: String,
    pub access_token: String,
}
