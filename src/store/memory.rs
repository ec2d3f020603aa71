use std::collections::HashMap;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{FieldMap, NOTE_ENTITY, RecordRef, RecordStore};

/// Fault-injection knobs for exercising the upload tiers and the
/// best-effort write paths. All off by default.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub fail_init_upload: bool,
    pub fail_upload_block: bool,
    pub fail_commit_upload: bool,
    /// Reject any `update` whose field bag contains this key.
    pub fail_update_field: Option<String>,
    pub fail_retrieve: bool,
    pub fail_note_create: bool,
}

/// One sealed upload, with block payloads kept in commit order.
#[derive(Debug, Clone)]
pub struct CommittedUpload {
    pub target: RecordRef,
    pub attribute: String,
    pub filename: String,
    pub mime_type: String,
    pub blocks: Vec<Vec<u8>>,
}

/// Journal entry for one `update` call.
#[derive(Debug, Clone)]
pub struct UpdateOp {
    pub entity: String,
    pub id: String,
    pub fields: FieldMap,
}

struct UploadSession {
    target: RecordRef,
    attribute: String,
    filename: String,
    blocks: HashMap<String, Vec<u8>>,
}

struct StoredFile {
    bytes: Vec<u8>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<FieldMap>>,
    files: HashMap<String, StoredFile>,
    uploads: HashMap<String, UploadSession>,
    downloads: HashMap<String, String>,
    commits: Vec<CommittedUpload>,
    updates: Vec<UpdateOp>,
    faults: Faults,
    next_id: u64,
}

/// In-memory record store. Backs `--dry-run` and the test suite; every
/// capability of the remote store is modeled, including upload/download
/// sessions and the commit-order semantics of the block protocol.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<State>,
}

fn file_key(target: &RecordRef, attribute: &str) -> String {
    format!("{}/{}/{}", target.entity, target.id, attribute)
}

fn project(row: &FieldMap, columns: &[&str]) -> FieldMap {
    if columns.is_empty() {
        return row.clone();
    }
    let mut out = FieldMap::new();
    if let Some(id) = row.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    for col in columns {
        if let Some(value) = row.get(*col) {
            out.insert((*col).to_string(), value.clone());
        }
    }
    out
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_faults(&self, faults: Faults) {
        self.inner.lock().await.faults = faults;
    }

    /// Insert a row directly, bypassing fault injection. Returns the id.
    pub async fn seed(&self, entity: &str, mut fields: FieldMap) -> String {
        let mut state = self.inner.lock().await;
        state.next_id += 1;
        let id = format!("{}-{}", entity, state.next_id);
        fields.insert("id".to_string(), Value::String(id.clone()));
        state.tables.entry(entity.to_string()).or_default().push(fields);
        id
    }

    pub async fn rows(&self, entity: &str) -> Vec<FieldMap> {
        let state = self.inner.lock().await;
        state.tables.get(entity).cloned().unwrap_or_default()
    }

    pub async fn updates(&self) -> Vec<UpdateOp> {
        self.inner.lock().await.updates.clone()
    }

    pub async fn commits(&self) -> Vec<CommittedUpload> {
        self.inner.lock().await.commits.clone()
    }

    pub async fn file_bytes(&self, target: &RecordRef, attribute: &str) -> Option<Vec<u8>> {
        let state = self.inner.lock().await;
        state
            .files
            .get(&file_key(target, attribute))
            .map(|f| f.bytes.clone())
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.inner.lock().await;
        state.tables.values().all(|rows| rows.is_empty())
            && state.files.is_empty()
            && state.updates.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create(&self, entity: &str, mut fields: FieldMap) -> Result<String> {
        let mut state = self.inner.lock().await;
        if entity == NOTE_ENTITY && state.faults.fail_note_create {
            bail!("note create rejected");
        }
        state.next_id += 1;
        let id = format!("{}-{}", entity, state.next_id);
        fields.insert("id".to_string(), Value::String(id.clone()));
        state.tables.entry(entity.to_string()).or_default().push(fields);
        Ok(id)
    }

    async fn update(&self, entity: &str, id: &str, fields: FieldMap) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some(poisoned) = state.faults.fail_update_field.clone()
            && fields.contains_key(&poisoned)
        {
            bail!("update of field '{}' rejected", poisoned);
        }
        state.updates.push(UpdateOp {
            entity: entity.to_string(),
            id: id.to_string(),
            fields: fields.clone(),
        });
        let row = state
            .tables
            .get_mut(entity)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            })
            .ok_or_else(|| anyhow!("no {} record with id {}", entity, id))?;
        for (key, value) in fields {
            row.insert(key, value);
        }
        Ok(())
    }

    async fn retrieve(&self, entity: &str, id: &str, columns: &[&str]) -> Result<FieldMap> {
        let state = self.inner.lock().await;
        if state.faults.fail_retrieve {
            bail!("retrieve rejected");
        }
        state
            .tables
            .get(entity)
            .and_then(|rows| {
                rows.iter()
                    .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            })
            .map(|row| project(row, columns))
            .ok_or_else(|| anyhow!("no {} record with id {}", entity, id))
    }

    async fn query(
        &self,
        entity: &str,
        field: &str,
        value: &str,
        columns: &[&str],
    ) -> Result<Vec<FieldMap>> {
        let state = self.inner.lock().await;
        let rows = state
            .tables
            .get(entity)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.get(field).and_then(Value::as_str) == Some(value))
                    .map(|r| project(r, columns))
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn init_upload(
        &self,
        target: &RecordRef,
        attribute: &str,
        filename: &str,
    ) -> Result<String> {
        let mut state = self.inner.lock().await;
        if state.faults.fail_init_upload {
            bail!("upload session rejected");
        }
        let token = Uuid::new_v4().simple().to_string();
        state.uploads.insert(
            token.clone(),
            UploadSession {
                target: target.clone(),
                attribute: attribute.to_string(),
                filename: filename.to_string(),
                blocks: HashMap::new(),
            },
        );
        Ok(token)
    }

    async fn upload_block(&self, token: &str, block_id: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.faults.fail_upload_block {
            bail!("block upload rejected");
        }
        let session = state
            .uploads
            .get_mut(token)
            .ok_or_else(|| anyhow!("unknown upload session"))?;
        session.blocks.insert(block_id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn commit_upload(
        &self,
        token: &str,
        block_ids: &[String],
        filename: &str,
        mime_type: &str,
    ) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.faults.fail_commit_upload {
            bail!("upload commit rejected");
        }
        let session = state
            .uploads
            .remove(token)
            .ok_or_else(|| anyhow!("unknown upload session"))?;
        let mut ordered = Vec::with_capacity(block_ids.len());
        for block_id in block_ids {
            let block = session
                .blocks
                .get(block_id)
                .ok_or_else(|| anyhow!("commit references unknown block {}", block_id))?;
            ordered.push(block.clone());
        }
        let bytes: Vec<u8> = ordered.iter().flatten().copied().collect();
        let key = file_key(&session.target, &session.attribute);
        state.files.insert(key, StoredFile { bytes });
        // Commit filename wins; empty falls back to the session one.
        let filename = if filename.is_empty() {
            session.filename
        } else {
            filename.to_string()
        };
        state.commits.push(CommittedUpload {
            target: session.target,
            attribute: session.attribute,
            filename,
            mime_type: mime_type.to_string(),
            blocks: ordered,
        });
        Ok(())
    }

    async fn init_download(&self, target: &RecordRef, attribute: &str) -> Result<String> {
        let mut state = self.inner.lock().await;
        let key = file_key(target, attribute);
        if !state.files.contains_key(&key) {
            bail!("no file content at {}", key);
        }
        let token = Uuid::new_v4().simple().to_string();
        state.downloads.insert(token.clone(), key);
        Ok(token)
    }

    async fn download_range(&self, token: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let state = self.inner.lock().await;
        let key = state
            .downloads
            .get(token)
            .ok_or_else(|| anyhow!("unknown download session"))?;
        let file = state
            .files
            .get(key)
            .ok_or_else(|| anyhow!("file content gone for session"))?;
        let start = (offset as usize).min(file.bytes.len());
        let end = (start + length as usize).min(file.bytes.len());
        Ok(file.bytes[start..end].to_vec())
    }
}
