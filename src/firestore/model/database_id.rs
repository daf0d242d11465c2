use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{BasePath, DocumentKey, ResourcePath};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Project/database pair used to build fully qualified document names for
/// reference values and encoded targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `projects/{p}/databases/{d}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// `projects/{p}/databases/{d}/documents/{key}`
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!("{}/documents/{}", self.database_name(), key.path())
    }

    /// Extracts the key from a fully qualified document name, checking that it
    /// belongs to this database.
    pub fn key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let path = ResourcePath::from_string(name)?;
        if path.get(1) != Some(self.project_id.as_str())
            || path.get(3) != Some(self.database.as_str())
        {
            return Err(invalid_argument(format!(
                "Document name {name} does not belong to {}",
                self.database_name()
            )));
        }
        DocumentKey::from_name(name)
    }
}
