//! Optimistic-concurrency guard for record editors.
//!
//! An editor captures the record's version when editing starts. Before a
//! save, the guard compares that base version with the server's current one
//! and refuses to overwrite a newer record unless the save is forced.
//! Conflicts are reported to the caller and never merged.

use crate::client::SyncClient;
use crate::error::{SyncError, SyncResult};
use crate::transport::HttpRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Monotonically increasing record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMarker(pub u64);

impl VersionMarker {
    /// Reads a version from a JSON number or numeric string.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(VersionMarker),
            Value::String(s) => s.trim().parse().ok().map(VersionMarker),
            _ => None,
        }
    }
}

impl fmt::Display for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A server record as seen by an editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record id.
    pub id: String,
    /// Version at read time.
    pub version: VersionMarker,
    /// Record content.
    pub content: Value,
}

/// Editing state for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorSession {
    /// Record being edited.
    pub record_id: String,
    /// Version the edit started from.
    pub base_version: VersionMarker,
    /// Latest local content.
    pub draft: Value,
    /// Set when a save saw a newer server version.
    pub conflict: bool,
}

impl EditorSession {
    /// Returns true while an unresolved conflict is pending.
    pub fn has_conflict(&self) -> bool {
        self.conflict
    }
}

/// Result of a save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The draft was written; `version` is the new base.
    Saved {
        /// Version returned by the write.
        version: VersionMarker,
    },
    /// The server holds a newer version; nothing was written.
    Conflict {
        /// Version the edit started from.
        base: VersionMarker,
        /// Version currently on the server.
        authoritative: VersionMarker,
    },
}

/// Reads and writes records for the guard.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Reads the current server copy of a record.
    async fn fetch(&self, id: &str) -> SyncResult<Record>;

    /// Writes a record and returns its new version.
    async fn write(&self, id: &str, content: &Value) -> SyncResult<VersionMarker>;
}

/// Guards editor saves against lost updates.
#[derive(Debug)]
pub struct ConcurrencyGuard<S: RecordSource> {
    source: S,
}

impl<S: RecordSource> ConcurrencyGuard<S> {
    /// Creates a guard over a record source.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Returns the record source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Starts editing `record`.
    pub fn begin_edit(&self, record: &Record) -> EditorSession {
        EditorSession {
            record_id: record.id.clone(),
            base_version: record.version,
            draft: record.content.clone(),
            conflict: false,
        }
    }

    /// Saves `draft`, fetching the authoritative version first unless
    /// `force` is set.
    ///
    /// # Errors
    ///
    /// Returns the source's error if the fetch or write fails. A version
    /// mismatch is not an error.
    pub async fn try_save(
        &self,
        session: &mut EditorSession,
        draft: Value,
        force: bool,
    ) -> SyncResult<SaveOutcome> {
        let authoritative = if force {
            session.base_version
        } else {
            self.source.fetch(&session.record_id).await?.version
        };
        self.try_save_against(session, draft, authoritative, force)
            .await
    }

    /// Saves `draft` against an authoritative version the caller already
    /// knows.
    ///
    /// # Errors
    ///
    /// Returns the source's error if the write fails.
    pub async fn try_save_against(
        &self,
        session: &mut EditorSession,
        draft: Value,
        authoritative: VersionMarker,
        force: bool,
    ) -> SyncResult<SaveOutcome> {
        session.draft = draft;

        if !force && authoritative != session.base_version {
            debug!(
                record = %session.record_id,
                base = %session.base_version,
                %authoritative,
                "save conflict"
            );
            session.conflict = true;
            return Ok(SaveOutcome::Conflict {
                base: session.base_version,
                authoritative,
            });
        }

        let version = self
            .source
            .write(&session.record_id, &session.draft)
            .await?;
        session.base_version = version;
        session.conflict = false;
        Ok(SaveOutcome::Saved { version })
    }

    /// Drops local changes and rebases on `record`.
    pub fn discard(&self, session: &mut EditorSession, record: &Record) {
        session.record_id = record.id.clone();
        session.base_version = record.version;
        session.draft = record.content.clone();
        session.conflict = false;
    }
}

/// A [`RecordSource`] over the authenticated HTTP client.
///
/// Reads `GET <collection>/<id>` and writes `PUT <collection>/<id>`. The
/// version is read from the `version` field of each response unless
/// configured otherwise.
#[derive(Debug, Clone)]
pub struct HttpRecordSource {
    client: SyncClient,
    collection: String,
    version_field: String,
}

impl HttpRecordSource {
    /// Creates a source for `collection`, e.g. `/api/memos`.
    pub fn new(client: SyncClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into().trim_end_matches('/').to_string(),
            version_field: "version".to_string(),
        }
    }

    /// Reads versions from another response field.
    pub fn with_version_field(mut self, field: impl Into<String>) -> Self {
        self.version_field = field.into();
        self
    }

    fn path(&self, id: &str) -> String {
        format!("{}/{}", self.collection, id)
    }

    fn version_of(&self, body: &Value) -> SyncResult<VersionMarker> {
        body.get(&self.version_field)
            .and_then(VersionMarker::from_json)
            .ok_or_else(|| {
                SyncError::Decode(format!("response has no `{}` version", self.version_field))
            })
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn fetch(&self, id: &str) -> SyncResult<Record> {
        let body = self.client.request(HttpRequest::get(self.path(id))).await?;
        let version = self.version_of(&body)?;
        Ok(Record {
            id: id.to_string(),
            version,
            content: body,
        })
    }

    async fn write(&self, id: &str, content: &Value) -> SyncResult<VersionMarker> {
        let body = self
            .client
            .request(HttpRequest::put(self.path(id), content.clone()))
            .await?;
        self.version_of(&body)
    }
}
