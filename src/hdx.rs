//! HDX catalog client.
//!
//! Thin surface over the CKAN-style package and resource actions on the
//! Humanitarian Data Exchange, just enough for one dataset carrying one
//! file resource. Every action POSTs to `/api/3/action/<name>` and gets a
//! `{ "success": true, "result": ... }` envelope back; auth is the HDX API
//! key in the Authorization header.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

const REQUEST_TIMEOUT_SECS: u64 = 120;

const HDX_SITES: &[(&str, &str)] = &[
    ("prod", "https://data.humdata.org"),
    ("demo", "https://demo.data-humdata-org.ahconu.org"),
    ("stage", "https://stage.data-humdata-org.ahconu.org"),
    ("dev", "https://dev.data-humdata-org.ahconu.org"),
];

/// Base URL for a site selector, or `None` if the selector is unknown.
pub fn site_base_url(site: &str) -> Option<&'static str> {
    HDX_SITES
        .iter()
        .find(|(name, _)| *name == site)
        .map(|(_, url)| *url)
}

/// Catalog rejection or transport failure. Fatal for the run.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("catalog API returned {status} for {action}: {body}")]
    Api {
        action: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("catalog request {action} failed")]
    Transport {
        action: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("catalog response for {action} was not the expected envelope: {detail}")]
    Envelope {
        action: &'static str,
        detail: String,
    },
    #[error("could not read resource file {path}")]
    ResourceFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Dataset-level metadata sent on create and update. Everything except
/// `dataset_date` is fixed from run to run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetMeta {
    pub name: String,
    pub title: String,
    pub notes: String,
    pub dataset_date: String,
    pub dataset_source: String,
    pub license_id: String,
    pub methodology: String,
    pub caveats: String,
    pub data_update_frequency: i32,
    pub maintainer: String,
    pub owner_org: String,
    pub subnational: bool,
    pub private: bool,
    pub groups: Vec<GroupRef>,
    pub tags: Vec<TagRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagRef {
    pub name: String,
}

/// Resource-level metadata for the uploaded table file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMeta {
    pub name: String,
    pub description: String,
    pub format: String,
    pub last_modified: String,
}

/// A dataset as the catalog reports it: id plus attached resources.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DatasetRef {
    pub id: String,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Narrow interface the publisher drives; the in-memory fake in the tests
/// implements it alongside the real client.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Look up a dataset by slug. `Ok(None)` means it does not exist.
    async fn dataset_show(&self, name: &str) -> Result<Option<DatasetRef>, PublishError>;

    async fn dataset_create(&self, meta: &DatasetMeta) -> Result<DatasetRef, PublishError>;

    async fn dataset_update(&self, meta: &DatasetMeta) -> Result<DatasetRef, PublishError>;

    async fn resource_create(
        &self,
        dataset_id: &str,
        meta: &ResourceMeta,
        file: &Path,
    ) -> Result<(), PublishError>;

    async fn resource_update(
        &self,
        resource_id: &str,
        meta: &ResourceMeta,
        file: &Path,
    ) -> Result<(), PublishError>;
}

/// reqwest implementation of [`CatalogApi`].
pub struct HdxClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HdxClient {
    pub fn new(base_url: &str, api_key: &str, user_agent: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(user_agent)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{}", self.base_url, action)
    }

    /// POST a JSON action and unwrap the success envelope.
    async fn json_action(
        &self,
        action: &'static str,
        payload: &Value,
    ) -> Result<Value, PublishError> {
        let response = self
            .client
            .post(self.action_url(action))
            .header("Authorization", self.api_key.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|source| PublishError::Transport { action, source })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| PublishError::Transport { action, source })?;
        unwrap_envelope(action, status, body)
    }

    async fn upload_action(
        &self,
        action: &'static str,
        form: Form,
    ) -> Result<Value, PublishError> {
        let response = self
            .client
            .post(self.action_url(action))
            .header("Authorization", self.api_key.as_str())
            .multipart(form)
            .send()
            .await
            .map_err(|source| PublishError::Transport { action, source })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| PublishError::Transport { action, source })?;
        unwrap_envelope(action, status, body)
    }

    /// Multipart form carrying the resource metadata and the file bytes.
    async fn resource_form(
        &self,
        action: &'static str,
        id_field: (&'static str, &str),
        meta: &ResourceMeta,
        file: &Path,
    ) -> Result<Form, PublishError> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|source| PublishError::ResourceFile {
                path: file.display().to_string(),
                source,
            })?;
        debug!(action, bytes = bytes.len(), "uploading resource file");

        let part = Part::bytes(bytes).file_name(meta.name.clone());
        Ok(Form::new()
            .text(id_field.0, id_field.1.to_string())
            .text("name", meta.name.clone())
            .text("description", meta.description.clone())
            .text("format", meta.format.clone())
            .text("last_modified", meta.last_modified.clone())
            .part("upload", part))
    }
}

/// Check the HTTP status and the CKAN `success` flag, returning `result`.
fn unwrap_envelope(
    action: &'static str,
    status: StatusCode,
    body: String,
) -> Result<Value, PublishError> {
    if !status.is_success() {
        return Err(PublishError::Api { action, status, body });
    }

    let envelope: Value = serde_json::from_str(&body).map_err(|e| PublishError::Envelope {
        action,
        detail: e.to_string(),
    })?;

    if envelope.get("success").and_then(Value::as_bool) != Some(true) {
        let detail = envelope
            .get("error")
            .map(Value::to_string)
            .unwrap_or(body);
        return Err(PublishError::Envelope { action, detail });
    }

    envelope
        .get("result")
        .cloned()
        .ok_or_else(|| PublishError::Envelope {
            action,
            detail: "missing result".to_string(),
        })
}

fn dataset_from_result(action: &'static str, result: Value) -> Result<DatasetRef, PublishError> {
    serde_json::from_value(result).map_err(|e| PublishError::Envelope {
        action,
        detail: e.to_string(),
    })
}

#[async_trait]
impl CatalogApi for HdxClient {
    async fn dataset_show(&self, name: &str) -> Result<Option<DatasetRef>, PublishError> {
        let action = "package_show";
        let response = self
            .client
            .get(self.action_url(action))
            .header("Authorization", self.api_key.as_str())
            .query(&[("id", name)])
            .send()
            .await
            .map_err(|source| PublishError::Transport { action, source })?;

        // CKAN answers 404 for an unknown slug.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| PublishError::Transport { action, source })?;
        let result = unwrap_envelope(action, status, body)?;
        dataset_from_result(action, result).map(Some)
    }

    async fn dataset_create(&self, meta: &DatasetMeta) -> Result<DatasetRef, PublishError> {
        let action = "package_create";
        let payload = serde_json::to_value(meta).map_err(|e| PublishError::Envelope {
            action,
            detail: e.to_string(),
        })?;
        let result = self.json_action(action, &payload).await?;
        let dataset = dataset_from_result(action, result)?;
        info!(name = %meta.name, id = %dataset.id, "created dataset");
        Ok(dataset)
    }

    async fn dataset_update(&self, meta: &DatasetMeta) -> Result<DatasetRef, PublishError> {
        let action = "package_update";
        let payload = serde_json::to_value(meta).map_err(|e| PublishError::Envelope {
            action,
            detail: e.to_string(),
        })?;
        let result = self.json_action(action, &payload).await?;
        let dataset = dataset_from_result(action, result)?;
        info!(name = %meta.name, id = %dataset.id, "updated dataset");
        Ok(dataset)
    }

    async fn resource_create(
        &self,
        dataset_id: &str,
        meta: &ResourceMeta,
        file: &Path,
    ) -> Result<(), PublishError> {
        let action = "resource_create";
        let form = self
            .resource_form(action, ("package_id", dataset_id), meta, file)
            .await?;
        self.upload_action(action, form).await?;
        info!(name = %meta.name, dataset_id, "created resource");
        Ok(())
    }

    async fn resource_update(
        &self,
        resource_id: &str,
        meta: &ResourceMeta,
        file: &Path,
    ) -> Result<(), PublishError> {
        let action = "resource_update";
        let form = self
            .resource_form(action, ("id", resource_id), meta, file)
            .await?;
        self.upload_action(action, form).await?;
        info!(name = %meta.name, resource_id, "updated resource");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn site_selectors_map_to_base_urls() {
        assert_eq!(site_base_url("prod"), Some("https://data.humdata.org"));
        assert_eq!(
            site_base_url("dev"),
            Some("https://dev.data-humdata-org.ahconu.org")
        );
        assert!(site_base_url("stage").is_some());
        assert!(site_base_url("demo").is_some());
        assert_eq!(site_base_url("production"), None);
        assert_eq!(site_base_url(""), None);
    }

    #[test]
    fn envelope_success_returns_result() {
        let body = json!({ "success": true, "result": { "id": "abc" } }).to_string();
        let result = unwrap_envelope("package_show", StatusCode::OK, body).unwrap();
        assert_eq!(result["id"], "abc");
    }

    #[test]
    fn envelope_failure_surfaces_the_error_field() {
        let body = json!({
            "success": false,
            "error": { "message": "Access denied", "__type": "Authorization Error" }
        })
        .to_string();
        let err = unwrap_envelope("package_create", StatusCode::OK, body).unwrap_err();
        match err {
            PublishError::Envelope { action, detail } => {
                assert_eq!(action, "package_create");
                assert!(detail.contains("Access denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_success_status_is_an_api_error() {
        let err = unwrap_envelope("package_update", StatusCode::FORBIDDEN, "denied".to_string())
            .unwrap_err();
        assert!(
            matches!(err, PublishError::Api { status, .. } if status == StatusCode::FORBIDDEN)
        );
    }

    #[test]
    fn missing_result_is_an_envelope_error() {
        let body = json!({ "success": true }).to_string();
        let err = unwrap_envelope("package_show", StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, PublishError::Envelope { .. }));
    }

    #[test]
    fn dataset_meta_serializes_catalog_field_names() {
        let meta = DatasetMeta {
            name: "cesa-disaster-reports-for-idn".to_string(),
            title: "Indonesia: CESA Disaster Reports".to_string(),
            notes: "notes".to_string(),
            dataset_date: "[2024-07-23T00:00:00 TO 2024-07-30T23:59:59]".to_string(),
            dataset_source: "The Climate Emergency Software Alliance".to_string(),
            license_id: "cc-by".to_string(),
            methodology: "Direct Observational Data/Anecdotal Data".to_string(),
            caveats: "None".to_string(),
            data_update_frequency: 1,
            maintainer: "maintainer-id".to_string(),
            owner_org: "org-id".to_string(),
            subnational: true,
            private: false,
            groups: vec![GroupRef { name: "idn".to_string() }],
            tags: vec![TagRef { name: "natural disasters".to_string() }],
        };

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["name"], "cesa-disaster-reports-for-idn");
        assert_eq!(value["data_update_frequency"], 1);
        assert_eq!(value["subnational"], true);
        assert_eq!(value["groups"][0]["name"], "idn");
        assert_eq!(value["tags"][0]["name"], "natural disasters");
        assert_eq!(value["license_id"], "cc-by");
    }

    #[test]
    fn dataset_ref_decodes_with_and_without_resources() {
        let with: DatasetRef = serde_json::from_value(json!({
            "id": "ds-1",
            "resources": [{ "id": "res-1", "name": "cesa_disaster_reports_idn.csv" }]
        }))
        .unwrap();
        assert_eq!(with.resources.len(), 1);
        assert_eq!(with.resources[0].name, "cesa_disaster_reports_idn.csv");

        let without: DatasetRef = serde_json::from_value(json!({ "id": "ds-2" })).unwrap();
        assert!(without.resources.is_empty());
    }
}
