use async_trait::async_trait;
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("host API error: {0}")]
    Api(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Metadata the host keeps for a stored file attachment. The bridge never
/// mutates it; only file content bytes change on save.
#[derive(Deserialize, Debug, Clone)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub extension: String,
    pub size: i64,
    /// Post (message) the file was attached to; the post owns the channel
    /// membership that gates access.
    pub post_id: String,
    /// Storage path, relative to the host's data directory.
    pub path: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Post {
    pub id: String,
    pub channel_id: String,
    /// Author of the post; reported as the file owner to the editor.
    pub user_id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl User {
    /// Name shown to collaborators in the editor, falling back to the
    /// username when no full name is set.
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string();
        if full.is_empty() {
            self.username.clone()
        } else {
            full
        }
    }
}

/// Narrow capability surface the bridge needs from the host platform.
/// Injected into the protocol handler so tests can substitute fakes.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn get_file(&self, file_id: &str) -> Result<Vec<u8>>;
    async fn get_file_info(&self, file_id: &str) -> Result<FileDescriptor>;
    async fn get_user(&self, user_id: &str) -> Result<User>;
    async fn get_post(&self, post_id: &str) -> Result<Post>;
    async fn is_channel_member(&self, channel_id: &str, user_id: &str) -> Result<bool>;
    /// Replace the file's stored content in full. Last writer wins; the
    /// editor server serializes saves per document.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;
}
