use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use wopi_core::host::{self, FileDescriptor, HostApi, HostError, Post, User};

fn api_err(err: reqwest::Error) -> HostError {
    HostError::Api(err.to_string())
}

/// `HostApi` over the messaging platform's REST API, authenticated with a
/// service bearer token. Saved file contents are written under the data
/// directory, which is where the platform reads attachments from.
pub struct PlatformClient {
    client: reqwest::Client,
    base_url: String,
    service_token: String,
    data_dir: PathBuf,
}

impl PlatformClient {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        service_token: &str,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_token: service_token.to_string(),
            data_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> host::Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.service_token)
            .send()
            .await
            .map_err(api_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(HostError::NotFound(path.to_string()));
        }
        response
            .error_for_status()
            .map_err(api_err)?
            .json()
            .await
            .map_err(api_err)
    }
}

#[async_trait]
impl HostApi for PlatformClient {
    async fn get_file(&self, file_id: &str) -> host::Result<Vec<u8>> {
        let response = self
            .client
            .get(self.url(&format!("/api/v4/files/{file_id}")))
            .bearer_auth(&self.service_token)
            .send()
            .await
            .map_err(api_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(HostError::NotFound(file_id.to_string()));
        }
        let bytes = response
            .error_for_status()
            .map_err(api_err)?
            .bytes()
            .await
            .map_err(api_err)?;
        Ok(bytes.to_vec())
    }

    async fn get_file_info(&self, file_id: &str) -> host::Result<FileDescriptor> {
        self.get_json(&format!("/api/v4/files/{file_id}/info")).await
    }

    async fn get_user(&self, user_id: &str) -> host::Result<User> {
        self.get_json(&format!("/api/v4/users/{user_id}")).await
    }

    async fn get_post(&self, post_id: &str) -> host::Result<Post> {
        self.get_json(&format!("/api/v4/posts/{post_id}")).await
    }

    async fn is_channel_member(&self, channel_id: &str, user_id: &str) -> host::Result<bool> {
        // 404 from the membership endpoint means "not a member", not a failure.
        let response = self
            .client
            .get(self.url(&format!("/api/v4/channels/{channel_id}/members/{user_id}")))
            .bearer_auth(&self.service_token)
            .send()
            .await
            .map_err(api_err)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(HostError::Api(format!(
                "membership lookup returned {status}"
            ))),
        }
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> host::Result<()> {
        let target = self.data_dir.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }
}
