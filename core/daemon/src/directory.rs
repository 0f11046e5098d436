//! Member directory: resolves scanned tags and external ids to identities.
//!
//! The `members` table is the source of truth. Lookups go through an
//! in-memory cache keyed by `tag_id` that is rebuilt after every mutation, so
//! the scan path never touches SQLite.

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{AttendanceError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    #[serde(rename = "name")]
    pub display_name: String,
    pub tag_id: String,
    pub external_id: String,
}

pub struct Directory {
    db: Arc<Db>,
    by_tag: RwLock<HashMap<String, Identity>>,
    /// Serializes read-and-swap so an older read never replaces a newer cache.
    refresh_lock: Mutex<()>,
}

impl Directory {
    /// Builds the directory and primes the cache. A failure here is fatal
    /// for the daemon: without identities no scan can be resolved.
    pub fn load(db: Arc<Db>) -> Result<Self> {
        let directory = Self {
            db,
            by_tag: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        };
        let count = directory.refresh()?;
        info!(members = count, "Member directory loaded");
        Ok(directory)
    }

    pub fn refresh(&self) -> Result<usize> {
        let _refreshing = self
            .refresh_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let members = self.db.list_members()?;
        let cache: HashMap<String, Identity> = members
            .into_iter()
            .map(|member| (member.tag_id.clone(), member))
            .collect();
        let count = cache.len();

        let mut by_tag = self
            .by_tag
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *by_tag = cache;
        Ok(count)
    }

    pub fn resolve(&self, tag_id: &str) -> Option<Identity> {
        self.by_tag
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(tag_id)
            .cloned()
    }

    pub fn resolve_by_external_id(&self, external_id: &str) -> Option<Identity> {
        self.by_tag
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .find(|member| member.external_id == external_id)
            .cloned()
    }

    pub fn member_count(&self) -> usize {
        self.by_tag
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn list(&self) -> Result<Vec<Identity>> {
        self.db.list_members()
    }

    pub fn get(&self, id: i64) -> Result<Identity> {
        self.db
            .get_member(id)?
            .ok_or(AttendanceError::MemberNotFound(id))
    }

    pub fn create(&self, name: &str, tag_id: &str, external_id: &str) -> Result<Identity> {
        let (name, tag_id, external_id) = validate_member(name, tag_id, external_id)?;
        let member = self.db.insert_member(name, tag_id, external_id)?;
        info!(member_id = member.id, tag_id = %member.tag_id, "Member created");
        self.refresh_after_write();
        Ok(member)
    }

    pub fn update(&self, id: i64, name: &str, tag_id: &str, external_id: &str) -> Result<Identity> {
        let (name, tag_id, external_id) = validate_member(name, tag_id, external_id)?;
        let member = self.db.update_member(id, name, tag_id, external_id)?;
        info!(member_id = id, tag_id = %member.tag_id, "Member updated");
        self.refresh_after_write();
        Ok(member)
    }

    /// Removes the member row. Callers must check presence first; the
    /// sessions cascade is handled by the schema.
    pub fn delete(&self, id: i64) -> Result<()> {
        self.db.delete_member(id)?;
        info!(member_id = id, "Member deleted");
        self.refresh_after_write();
        Ok(())
    }

    /// Writes the full member list as pretty JSON. Returns the number exported.
    pub fn export_to(&self, path: &Path) -> Result<usize> {
        let members = self.db.list_members()?;
        let payload = serde_json::to_vec_pretty(&members)
            .map_err(|err| AttendanceError::storage("Failed to serialize members", err))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| AttendanceError::storage("Failed to create export dir", err))?;
        }
        fs::write(path, payload)
            .map_err(|err| AttendanceError::storage("Failed to write members export", err))?;
        info!(count = members.len(), path = %path.display(), "Exported members");
        Ok(members.len())
    }

    /// Imports members from a JSON export. Ids in the file are ignored and
    /// tags that are already registered are skipped.
    pub fn import_from(&self, path: &Path) -> Result<usize> {
        let data = fs::read(path)
            .map_err(|err| AttendanceError::storage("Failed to read members file", err))?;
        let members: Vec<ImportedMember> = serde_json::from_slice(&data)
            .map_err(|err| AttendanceError::storage("Failed to parse members file", err))?;

        let mut imported = 0;
        for member in &members {
            match self
                .db
                .insert_member_if_absent(&member.name, &member.tag_id, &member.external_id)
            {
                Ok(true) => imported += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(error = %err, tag_id = %member.tag_id, "Failed to import member");
                }
            }
        }

        self.refresh_after_write();
        info!(imported, total = members.len(), path = %path.display(), "Imported members");
        Ok(imported)
    }

    fn refresh_after_write(&self) {
        if let Err(err) = self.refresh() {
            warn!(error = %err, "Failed to reload member cache");
        }
    }
}

fn validate_member<'a>(
    name: &'a str,
    tag_id: &'a str,
    external_id: &'a str,
) -> Result<(&'a str, &'a str, &'a str)> {
    let fields = [
        ("name", name.trim()),
        ("tag_id", tag_id.trim()),
        ("external_id", external_id.trim()),
    ];
    if let Some((field, _)) = fields.iter().find(|(_, value)| value.is_empty()) {
        return Err(AttendanceError::InvalidMember(format!("{} is required", field)));
    }
    Ok((fields[0].1, fields[1].1, fields[2].1))
}

#[derive(Debug, Deserialize)]
struct ImportedMember {
    name: String,
    tag_id: String,
    external_id: String,
}
