//! Student records and partial updates.

use serde::{Deserialize, Serialize};

/// A replicated student record.
///
/// `deleted` is a tombstone: deleting a student never removes its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub age: i32,
    #[serde(default)]
    pub deleted: bool,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, age: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            age,
            deleted: false,
        }
    }

    /// Checks the fields a new record must carry.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("student's id is necessary".to_string());
        }
        if self.name.is_empty() {
            return Err("student's name is necessary".to_string());
        }
        Ok(())
    }

    /// Applies `patch` over this record, keeping every field the patch leaves unset.
    pub fn merged(&self, patch: &EntityPatch) -> Entity {
        Entity {
            id: non_empty(&patch.id).unwrap_or(&self.id).to_string(),
            name: non_empty(&patch.name).unwrap_or(&self.name).to_string(),
            age: patch.age.unwrap_or(self.age),
            deleted: self.deleted,
        }
    }
}

/// Fields supplied by an update. Empty strings and `None` mean "unchanged".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityPatch {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Option<i32>,
}

impl EntityPatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// The id this patch moves the record to, if it re-keys it.
    pub fn new_id<'a>(&'a self, current: &str) -> Option<&'a str> {
        non_empty(&self.id).filter(|id| *id != current)
    }

    pub fn is_empty(&self) -> bool {
        non_empty(&self.id).is_none() && non_empty(&self.name).is_none() && self.age.is_none()
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}
