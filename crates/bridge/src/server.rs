use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, OriginalUri, Path, Query, Request, State},
    http::{StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use wopi_core::{
    api_types::{CheckFileInfo, ClientFileInfo, EditorUrl, ExtensionAction},
    auth::{AccessToken, Authenticator},
    discovery::DiscoveryRegistry,
    host::{self, FileDescriptor, HostApi},
};

/// Trusted header a fronting host proxy injects after authenticating its own
/// user. Requests to the helper endpoints without it are rejected.
const TRUSTED_USER_HEADER: &str = "x-host-user-id";

/// Documents routinely exceed axum's default 2 MiB body limit.
const MAX_SAVE_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug)]
pub struct AppError(StatusCode, anyhow::Error);
impl std::error::Error for AppError {}
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, format!("Something went wrong: {}", self.1)).into_response()
    }
}
impl<E> From<(StatusCode, E)> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from((status_code, err): (StatusCode, E)) -> Self {
        Self(status_code, err.into())
    }
}
impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Status code: {} {}", self.0, self.1)?;
        Ok(())
    }
}

/// WOPI convention: authentication and authorization failures answer with an
/// empty body and no error detail, deliberately indistinguishable from one
/// another so a rejected caller learns nothing about channel membership.
/// The absence of a valid body is itself the error signal to the editor.
fn silent_abort() -> Response {
    ().into_response()
}

/// Extract the `access_token` query parameter from the raw request URI.
/// A fronting layer may strip recognized credentials before ordinary query
/// parsing, so the raw URI is authoritative here.
fn access_token_from_uri(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "access_token")
        .map(|(_, value)| value.into_owned())
}

/// Collapse a host lookup into an `Option`, logging the failure. The caller
/// answers with a silent abort, so the log line is the only trace left.
fn ok_or_log<T>(result: host::Result<T>, file_id: &str, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(%err, file_id, what, "host lookup failed");
            None
        }
    }
}

pub struct Server {
    host: Arc<dyn HostApi>,
    authenticator: Arc<Authenticator>,
    registry: Arc<DiscoveryRegistry>,
    client: reqwest::Client,
    /// Base URL of the editor server's discovery endpoint.
    wopi_address: String,
    /// Public base URL of this bridge, as reachable by the editor server.
    url_prefix: String,
}

impl Server {
    pub fn new(
        host: Arc<dyn HostApi>,
        authenticator: Arc<Authenticator>,
        registry: Arc<DiscoveryRegistry>,
        client: reqwest::Client,
        wopi_address: impl Into<String>,
        url_prefix: impl Into<String>,
    ) -> Self {
        Self {
            host,
            authenticator,
            registry,
            client,
            wopi_address: wopi_address.into(),
            url_prefix: url_prefix.into(),
        }
    }

    fn base_api_url(&self) -> String {
        format!("{}/api/v1", self.url_prefix.trim_end_matches('/'))
    }

    /// Decode the bearer token and bind it to the file named in the request
    /// path. A token minted for one file must never open another, even
    /// though it decodes validly.
    async fn verify_file_token(&self, file_id: &str, uri: &Uri) -> Option<AccessToken> {
        let Some(token) = access_token_from_uri(uri) else {
            tracing::warn!(file_id, "request is missing the access_token parameter");
            return None;
        };
        let token = match self.authenticator.decode_token(&token).await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(%err, file_id, "rejecting invalid access token");
                return None;
            }
        };
        if token.file_id != file_id {
            tracing::warn!(
                file_id,
                token_file_id = %token.file_id,
                "access token is bound to a different file"
            );
            return None;
        }
        Some(token)
    }

    /// Shared gate for both content operations: decode, bind to the file,
    /// then confirm the token's user is still a member of the channel the
    /// file was posted to. GET and POST go through this one path so they can
    /// never diverge in strictness. Any inconclusive lookup denies access.
    /// Returns the file descriptor the operation acts on.
    async fn authorize_contents(&self, file_id: &str, uri: &Uri) -> Option<FileDescriptor> {
        let token = self.verify_file_token(file_id, uri).await?;

        let file = ok_or_log(self.host.get_file_info(file_id).await, file_id, "file info")?;
        let post = ok_or_log(self.host.get_post(&file.post_id).await, file_id, "owning post")?;
        match self
            .host
            .is_channel_member(&post.channel_id, &token.user_id)
            .await
        {
            Ok(true) => Some(file),
            Ok(false) => {
                tracing::warn!(
                    file_id,
                    user_id = %token.user_id,
                    "user is not a member of the channel that owns the file"
                );
                None
            }
            Err(err) => {
                tracing::error!(%err, file_id, "membership lookup failed, denying access");
                None
            }
        }
    }

    pub fn routes(self: &Arc<Self>) -> Router {
        let api = Router::new()
            .route("/wopi/files/:file_id", get(check_file_info))
            .route(
                "/wopi/files/:file_id/contents",
                get(get_file_contents).post(put_file_contents),
            )
            .layer(DefaultBodyLimit::max(MAX_SAVE_BYTES))
            .merge(
                Router::new()
                    .route("/extensions", get(list_extensions))
                    .route("/editor_url", get(editor_url))
                    .route("/file_info", post(file_info))
                    .route("/reload_discovery", post(reload_discovery))
                    .layer(middleware::from_fn(require_host_user)),
            );

        Router::new()
            .route("/ready", get(ready))
            .nest("/api/v1", api)
            .with_state(self.clone())
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.routes();
        tracing::info!("Starting HTTP server...");
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received, stopping HTTP server");
            })
            .await?;
        Ok(())
    }
}

async fn ready() -> &'static str {
    "OK"
}

/// Helper endpoints are for the host's own UI; the host proxy authenticates
/// the user and injects the trusted header before the request reaches us.
async fn require_host_user(req: Request, next: Next) -> Response {
    if req.headers().get(TRUSTED_USER_HEADER).is_none() {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(req).await
}

/// GET /api/v1/wopi/files/:file_id — WOPI CheckFileInfo. Queried by the
/// editor server before it renders the document.
async fn check_file_info(
    State(server): State<Arc<Server>>,
    Path(file_id): Path<String>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let Some(token) = server.verify_file_token(&file_id, &uri).await else {
        return silent_abort();
    };

    let Some(user) = ok_or_log(server.host.get_user(&token.user_id).await, &file_id, "token user")
    else {
        return silent_abort();
    };
    let Some(file) = ok_or_log(server.host.get_file_info(&file_id).await, &file_id, "file info")
    else {
        return silent_abort();
    };
    let Some(post) = ok_or_log(server.host.get_post(&file.post_id).await, &file_id, "owning post")
    else {
        return silent_abort();
    };

    Json(CheckFileInfo {
        base_file_name: file.name,
        size: file.size,
        owner_id: post.user_id,
        user_friendly_name: user.display_name(),
        user_id: user.id,
        user_can_write: true,
        // In-place save only; "Save As" would create files outside the post.
        user_can_not_write_relative: true,
    })
    .into_response()
}

/// GET /api/v1/wopi/files/:file_id/contents — the editor fetches the raw
/// file bytes to open the document.
async fn get_file_contents(
    State(server): State<Arc<Server>>,
    Path(file_id): Path<String>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    if server.authorize_contents(&file_id, &uri).await.is_none() {
        return silent_abort();
    }

    match server.host.get_file(&file_id).await {
        Ok(content) => content.into_response(),
        Err(err) => {
            tracing::error!(%err, file_id, "failed to read file contents");
            silent_abort()
        }
    }
}

/// POST /api/v1/wopi/files/:file_id/contents — the editor saves the
/// document; the body replaces the stored content in full. I/O errors abort
/// and are never retried here, the editor owns its retry policy.
async fn put_file_contents(
    State(server): State<Arc<Server>>,
    Path(file_id): Path<String>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Response {
    let Some(file) = server.authorize_contents(&file_id, &uri).await else {
        return silent_abort();
    };

    match server.host.write_file(&file.path, &body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(%err, file_id, path = %file.path, "failed to save file contents");
            silent_abort()
        }
    }
}

/// GET /api/v1/extensions — the extensions the editor can open, keyed by
/// lowercase extension, with their action kind.
async fn list_extensions(
    State(server): State<Arc<Server>>,
) -> Json<HashMap<String, ExtensionAction>> {
    Json(server.registry.snapshot().as_ref().clone())
}

#[derive(Deserialize)]
struct EditorUrlParams {
    file_id: String,
}

/// GET /api/v1/editor_url?file_id=… — the URL + token pair the host UI
/// hands to the editor iframe. The WOPISrc parameter points the editor back
/// at this bridge's own file endpoint.
async fn editor_url(
    State(server): State<Arc<Server>>,
    headers: axum::http::HeaderMap,
    Query(params): Query<EditorUrlParams>,
) -> Result<Json<EditorUrl>, AppError> {
    let user_id = headers
        .get(TRUSTED_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError(StatusCode::UNAUTHORIZED, anyhow!("missing user header")))?;

    let file = server
        .host
        .get_file_info(&params.file_id)
        .await
        .map_err(|err| AppError(StatusCode::BAD_REQUEST, anyhow!("unknown file: {err}")))?;

    let action = server.registry.lookup(&file.extension).ok_or_else(|| {
        AppError(
            StatusCode::NOT_FOUND,
            anyhow!("no editor action for extension {:?}", file.extension),
        )
    })?;

    let url = format!(
        "{}WOPISrc={}/wopi/files/{}",
        action.url,
        server.base_api_url(),
        file.id
    );
    let access_token = server
        .authenticator
        .encode_token(user_id, &file.id)
        .await
        .map_err(|err| {
            AppError(
                StatusCode::INTERNAL_SERVER_ERROR,
                anyhow!("failed to mint access token: {err}"),
            )
        })?;

    Ok(Json(EditorUrl { url, access_token }))
}

/// POST /api/v1/file_info, body = JSON array of file ids — detailed info for
/// each file whose extension has a discovery action. Unknown files and
/// extensions without an action are skipped, not errors.
async fn file_info(
    State(server): State<Arc<Server>>,
    Json(file_ids): Json<Vec<String>>,
) -> Json<Vec<ClientFileInfo>> {
    let mut files = Vec::with_capacity(file_ids.len());
    for file_id in &file_ids {
        let info = match server.host.get_file_info(file_id).await {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(%err, file_id, "skipping file with no info");
                continue;
            }
        };
        if let Some(action) = server.registry.lookup(&info.extension) {
            files.push(ClientFileInfo {
                id: info.id,
                name: info.name,
                extension: info.extension,
                action: action.action,
            });
        }
    }
    Json(files)
}

/// POST /api/v1/reload_discovery — re-fetch the discovery document after an
/// editor-server upgrade or configuration change. On failure the previous
/// table stays in effect.
async fn reload_discovery(State(server): State<Arc<Server>>) -> Result<&'static str, AppError> {
    server
        .registry
        .load(&server.client, &server.wopi_address)
        .await
        .map_err(|err| {
            AppError(
                StatusCode::BAD_GATEWAY,
                anyhow!("discovery reload failed: {err}"),
            )
        })?;
    Ok("reloaded")
}
