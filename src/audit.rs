//! Append-only audit trail
//!
//! Every applied mutation is recorded as a field-level diff of the entity's
//! snapshot before and after the change. Records are keyed by a monotonic id
//! and are never updated or removed.
use std::collections::BTreeMap;

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};

use crate::error::{LimsError, Result};
use crate::types::{Actor, EntityKind, Role, TimeStamp};

/// Flat field view of an entity. A missing key means the field is null.
pub type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    fields: Snapshot,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }
    pub fn with_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }
    pub fn build(self) -> Snapshot {
        self.fields
    }
}

/// Keep only the fields whose values differ, over the union of both key sets.
pub fn diff(before: &Snapshot, after: &Snapshot) -> (Snapshot, Snapshot) {
    let mut old = Snapshot::new();
    let mut new = Snapshot::new();

    let keys = before.keys().chain(after.keys());
    for key in keys {
        let (b, a) = (before.get(key), after.get(key));
        if b == a {
            continue;
        }
        if let Some(b) = b {
            old.insert(key.clone(), b.clone());
        }
        if let Some(a) = a {
            new.insert(key.clone(), a.clone());
        }
    }
    (old, new)
}

/// Uppercase and cut to `max_len` characters. Never fails.
pub fn normalize_action(action: &str, max_len: usize) -> String {
    action
        .trim()
        .chars()
        .flat_map(char::to_uppercase)
        .take(max_len)
        .collect()
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub actor: String,
    #[n(2)]
    pub role: Role,
    #[n(3)]
    pub entity_kind: EntityKind,
    #[n(4)]
    pub entity_id: String,
    #[n(5)]
    pub action: String,
    #[n(6)]
    pub before: Snapshot,
    #[n(7)]
    pub after: Snapshot,
    #[n(8)]
    pub timestamp: TimeStamp,
}

/// Who is changing which entity, resolved once before the change is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Author {
    actor: String,
    role: Role,
    entity_kind: EntityKind,
    entity_id: String,
    action: String,
}

impl Author {
    fn seal(&self, id: u64, before: &Snapshot, after: &Snapshot) -> AuditRecord {
        let (before, after) = diff(before, after);
        AuditRecord {
            id,
            actor: self.actor.clone(),
            role: self.role,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id.clone(),
            action: self.action.clone(),
            before,
            after,
            timestamp: TimeStamp::new(),
        }
    }
}

/// An audit record waiting for the transaction that applies its change.
/// Appending inside that transaction makes the entity write and the record
/// land together or not at all.
pub struct PendingAudit {
    db: sled::Db,
    tree: sled::Tree,
    author: Option<Author>,
}

impl PendingAudit {
    pub fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    /// Append the record to `audit`, the transactional view of [`Self::tree`].
    /// Writes nothing and yields `None` when the author is unresolved.
    pub fn append(
        &self,
        audit: &TransactionalTree,
        before: &Snapshot,
        after: &Snapshot,
    ) -> ConflictableTransactionResult<Option<u64>, LimsError> {
        let Some(author) = &self.author else {
            return Ok(None);
        };
        let id = self
            .db
            .generate_id()
            .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
        let record = author.seal(id, before, after);
        let bytes =
            minicbor::to_vec(&record).map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
        audit.insert(id.to_be_bytes().to_vec(), bytes)?;
        Ok(Some(id))
    }
}

#[derive(Clone)]
pub struct AuditTrail {
    db: sled::Db,
    tree: sled::Tree,
    action_max_len: usize,
}

impl AuditTrail {
    pub fn new(db: sled::Db, action_max_len: usize) -> Result<Self> {
        let tree = db.open_tree("audit")?;
        Ok(Self {
            db,
            tree,
            action_max_len,
        })
    }

    fn author(
        &self,
        actor: &Actor,
        entity_kind: EntityKind,
        entity_id: Option<&str>,
        action: &str,
    ) -> Option<Author> {
        let (Some(actor_id), Some(entity_id)) = (actor.resolved_id(), entity_id) else {
            tracing::warn!(
                %entity_kind,
                entity_id = ?entity_id,
                action,
                "audit skipped: unresolved actor or entity"
            );
            return None;
        };
        Some(Author {
            actor: actor_id.to_string(),
            role: actor.role,
            entity_kind,
            entity_id: entity_id.to_string(),
            action: normalize_action(action, self.action_max_len),
        })
    }

    /// Prepare a record to be appended inside the transaction that applies
    /// the change it describes.
    pub fn pending(
        &self,
        actor: &Actor,
        entity_kind: EntityKind,
        entity_id: Option<&str>,
        action: &str,
    ) -> PendingAudit {
        PendingAudit {
            db: self.db.clone(),
            tree: self.tree.clone(),
            author: self.author(actor, entity_kind, entity_id, action),
        }
    }

    /// Append one record and return its id. Returns `Ok(None)` without writing
    /// when the actor or entity id is unresolved.
    pub fn record(
        &self,
        actor: &Actor,
        entity_kind: EntityKind,
        entity_id: Option<&str>,
        action: &str,
        before: &Snapshot,
        after: &Snapshot,
    ) -> Result<Option<u64>> {
        let Some(author) = self.author(actor, entity_kind, entity_id, action) else {
            return Ok(None);
        };
        let id = self.db.generate_id()?;
        let record = author.seal(id, before, after);
        self.tree.insert(id.to_be_bytes(), minicbor::to_vec(&record)?)?;
        tracing::debug!(audit_id = id, %entity_kind, action = %record.action, "audit recorded");
        Ok(Some(id))
    }

    pub fn get(&self, id: u64) -> Result<Option<AuditRecord>> {
        match self.tree.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Records for one entity, oldest first.
    pub fn history(&self, entity_id: &str) -> Result<Vec<AuditRecord>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let record: AuditRecord = minicbor::decode(&bytes)?;
            if record.entity_id == entity_id {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
