use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{FieldMap, RecordRef, RecordStore};
use crate::core::config::StoreConfig;

#[derive(Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    records: Vec<FieldMap>,
}

#[derive(Serialize)]
struct InitUploadRequest<'a> {
    filename: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    block_ids: &'a [String],
    filename: &'a str,
    mime_type: &'a str,
}

/// REST binding of the record-store capability contract. One endpoint per
/// operation, no retry loop — transient-failure policy belongs to the
/// remote service and its gateway.
pub struct RestStore {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn create(&self, entity: &str, fields: FieldMap) -> Result<String> {
        let resp: CreatedResponse = self
            .request(reqwest::Method::POST, format!("records/{}", entity))
            .json(&fields)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("create {} record", entity))?
            .json()
            .await?;
        Ok(resp.id)
    }

    async fn update(&self, entity: &str, id: &str, fields: FieldMap) -> Result<()> {
        self.request(reqwest::Method::PATCH, format!("records/{}/{}", entity, id))
            .json(&fields)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("update {} record {}", entity, id))?;
        Ok(())
    }

    async fn retrieve(&self, entity: &str, id: &str, columns: &[&str]) -> Result<FieldMap> {
        let fields: FieldMap = self
            .request(reqwest::Method::GET, format!("records/{}/{}", entity, id))
            .query(&[("columns", columns.join(","))])
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("retrieve {} record {}", entity, id))?
            .json()
            .await?;
        Ok(fields)
    }

    async fn query(
        &self,
        entity: &str,
        field: &str,
        value: &str,
        columns: &[&str],
    ) -> Result<Vec<FieldMap>> {
        let columns = columns.join(",");
        let resp: QueryResponse = self
            .request(reqwest::Method::GET, format!("records/{}", entity))
            .query(&[
                ("field", field),
                ("value", value),
                ("columns", columns.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("query {} by {}", entity, field))?
            .json()
            .await?;
        Ok(resp.records)
    }

    async fn init_upload(
        &self,
        target: &RecordRef,
        attribute: &str,
        filename: &str,
    ) -> Result<String> {
        let resp: SessionResponse = self
            .request(
                reqwest::Method::POST,
                format!(
                    "files/{}/{}/{}/upload-sessions",
                    target.entity, target.id, attribute
                ),
            )
            .json(&InitUploadRequest { filename })
            .send()
            .await?
            .error_for_status()
            .context("open upload session")?
            .json()
            .await?;
        Ok(resp.token)
    }

    async fn upload_block(&self, token: &str, block_id: &str, bytes: &[u8]) -> Result<()> {
        self.request(
            reqwest::Method::PUT,
            format!("upload-sessions/{}/blocks/{}", token, block_id),
        )
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(bytes.to_vec())
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("transmit block {}", block_id))?;
        Ok(())
    }

    async fn commit_upload(
        &self,
        token: &str,
        block_ids: &[String],
        filename: &str,
        mime_type: &str,
    ) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            format!("upload-sessions/{}/commit", token),
        )
        .json(&CommitRequest {
            block_ids,
            filename,
            mime_type,
        })
        .send()
        .await?
        .error_for_status()
        .context("commit upload session")?;
        Ok(())
    }

    async fn init_download(&self, target: &RecordRef, attribute: &str) -> Result<String> {
        let resp: SessionResponse = self
            .request(
                reqwest::Method::POST,
                format!(
                    "files/{}/{}/{}/download-sessions",
                    target.entity, target.id, attribute
                ),
            )
            .send()
            .await?
            .error_for_status()
            .context("open download session")?
            .json()
            .await?;
        Ok(resp.token)
    }

    async fn download_range(&self, token: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let bytes = self
            .request(
                reqwest::Method::GET,
                format!("download-sessions/{}", token),
            )
            .query(&[("offset", offset), ("length", length)])
            .send()
            .await?
            .error_for_status()
            .context("read download range")?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}
