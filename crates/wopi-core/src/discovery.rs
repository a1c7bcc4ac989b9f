use crate::api_types::ExtensionAction;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Extensions the host already renders inline; never offered to the editor.
const NATIVE_PREVIEW_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to parse discovery XML: {0}")]
    Parse(#[from] quick_xml::de::DeError),
}

// Shape of <WOPI>/hosting/discovery: zones -> apps -> actions.
#[derive(Deserialize, Debug)]
struct WopiDiscovery {
    #[serde(rename = "net-zone", default)]
    net_zones: Vec<NetZone>,
}

#[derive(Deserialize, Debug)]
struct NetZone {
    #[serde(rename = "app", default)]
    apps: Vec<App>,
}

#[derive(Deserialize, Debug)]
struct App {
    #[serde(rename = "action", default)]
    actions: Vec<Action>,
}

#[derive(Deserialize, Debug)]
struct Action {
    #[serde(rename = "@ext", default)]
    ext: String,
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@urlsrc", default)]
    urlsrc: String,
}

/// Parse a discovery document into the extension lookup table. Actions with
/// an empty extension or one the host previews natively are skipped; when
/// the same extension appears more than once, the later entry in document
/// order wins.
pub fn build_table(xml: &str) -> Result<HashMap<String, ExtensionAction>, DiscoveryError> {
    let discovery: WopiDiscovery = quick_xml::de::from_str(xml)?;
    let mut table = HashMap::new();
    for zone in &discovery.net_zones {
        for app in &zone.apps {
            for action in &app.actions {
                let ext = action.ext.to_lowercase();
                if ext.is_empty() || NATIVE_PREVIEW_EXTENSIONS.contains(&ext.as_str()) {
                    continue;
                }
                table.insert(
                    ext,
                    ExtensionAction {
                        url: action.urlsrc.clone(),
                        action: action.name.clone(),
                    },
                );
            }
        }
    }
    Ok(table)
}

/// Read-mostly mapping from lowercase file extension to the editor action
/// that opens it. The table is rebuilt wholesale and swapped in as one unit
/// on every (re)load, so concurrent readers never observe a partial update.
pub struct DiscoveryRegistry {
    table: RwLock<Arc<HashMap<String, ExtensionAction>>>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Fetch `<wopi_address>/hosting/discovery` and rebuild the table.
    /// On failure the previous table is left untouched; the caller decides
    /// whether that is fatal (at startup it is not).
    pub async fn load(
        &self,
        client: &reqwest::Client,
        wopi_address: &str,
    ) -> Result<(), DiscoveryError> {
        let url = format!("{}/hosting/discovery", wopi_address.trim_end_matches('/'));
        let body = client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        self.ingest(&body)
    }

    /// Parse and swap in a new table. Split from [`Self::load`] so the parse
    /// path is testable without a live editor server.
    pub fn ingest(&self, xml: &str) -> Result<(), DiscoveryError> {
        let table = build_table(xml)?;
        tracing::info!(extensions = table.len(), "discovery document loaded");
        self.swap(table);
        Ok(())
    }

    pub fn swap(&self, table: HashMap<String, ExtensionAction>) {
        *self.table.write().unwrap() = Arc::new(table);
    }

    pub fn lookup(&self, extension: &str) -> Option<ExtensionAction> {
        self.snapshot().get(&extension.to_lowercase()).cloned()
    }

    /// Consistent point-in-time view of the whole table.
    pub fn snapshot(&self) -> Arc<HashMap<String, ExtensionAction>> {
        self.table.read().unwrap().clone()
    }
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
