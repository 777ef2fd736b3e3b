//! sled-backed persistence for workflow entities
use std::cell::RefCell;
use std::path::Path;

use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult,
};

use crate::audit::{PendingAudit, Snapshot};
use crate::error::{LimsError, Result};
use crate::types::EntityKind;

/// An entity that lives in its own tree, keyed by id, encoded as CBOR.
pub trait Record: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Flat field view used for audit diffs.
    fn snapshot(&self) -> Snapshot;
}

/// The value before and after a read-modify-write. When `changed` is false
/// nothing was written and no audit record exists.
#[derive(Debug)]
pub struct Updated<T, R = ()> {
    pub before: T,
    pub after: T,
    pub value: R,
    pub changed: bool,
    pub audit_id: Option<u64>,
}

type TxResult<A> = ConflictableTransactionResult<A, LimsError>;

fn abort(e: LimsError) -> ConflictableTransactionError<LimsError> {
    ConflictableTransactionError::Abort(e)
}

fn finish<A>(outcome: TransactionResult<A, LimsError>) -> Result<A> {
    match outcome {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

fn already_exists<T: Record>(record: &T) -> LimsError {
    LimsError::precondition(format!("{} {} already exists", T::KIND, record.id()))
}

#[derive(Clone)]
pub struct Store {
    instance: sled::Db,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_db(sled::open(path)?))
    }

    /// In-memory database, removed on drop.
    pub fn temporary() -> Result<Self> {
        Ok(Self::from_db(sled::Config::new().temporary(true).open()?))
    }

    pub fn from_db(instance: sled::Db) -> Self {
        Self { instance }
    }

    pub fn db(&self) -> &sled::Db {
        &self.instance
    }

    fn tree<T: Record>(&self) -> Result<sled::Tree> {
        Ok(self.instance.open_tree(T::KIND.as_str())?)
    }

    /// Insert a new record together with its creation audit record. Fails if
    /// the id is already taken.
    pub fn insert<T: Record>(&self, record: &T, audit: &PendingAudit) -> Result<Option<u64>> {
        let tree = self.tree::<T>()?;
        let bytes = minicbor::to_vec(record)?;
        let (empty, after) = (Snapshot::new(), record.snapshot());

        finish((&tree, audit.tree()).transaction(
            |(entities, journal)| -> TxResult<Option<u64>> {
                if entities.get(record.id().as_bytes())?.is_some() {
                    return Err(abort(already_exists(record)));
                }
                entities.insert(record.id().as_bytes(), bytes.clone())?;
                audit.append(journal, &empty, &after)
            },
        ))
    }

    /// Insert `record` and rewrite every `U` named in `related` in a single
    /// transaction with the audit record for `record`. `rewrite` sees the
    /// stored value of each related record; if it fails for any of them
    /// nothing is written.
    pub fn insert_with<T, U>(
        &self,
        record: &T,
        related: &[String],
        audit: &PendingAudit,
        rewrite: impl Fn(&mut U) -> Result<()>,
    ) -> Result<(Vec<U>, Option<u64>)>
    where
        T: Record,
        U: Record,
    {
        let primary = self.tree::<T>()?;
        let secondary = self.tree::<U>()?;
        let bytes = minicbor::to_vec(record)?;
        let (empty, after) = (Snapshot::new(), record.snapshot());

        finish((&primary, &secondary, audit.tree()).transaction(
            |(primary, secondary, journal)| -> TxResult<(Vec<U>, Option<u64>)> {
                let mut rewritten = Vec::with_capacity(related.len());
                for id in related {
                    let raw = secondary.get(id.as_bytes())?.ok_or_else(|| {
                        abort(LimsError::NotFound {
                            kind: U::KIND.as_str(),
                            id: id.clone(),
                        })
                    })?;
                    let mut value: U = minicbor::decode(&raw).map_err(|e| abort(e.into()))?;
                    rewrite(&mut value).map_err(abort)?;
                    let encoded = minicbor::to_vec(&value).map_err(|e| abort(e.into()))?;
                    secondary.insert(id.as_bytes(), encoded)?;
                    rewritten.push(value);
                }

                if primary.get(record.id().as_bytes())?.is_some() {
                    return Err(abort(already_exists(record)));
                }
                primary.insert(record.id().as_bytes(), bytes.clone())?;
                let audit_id = audit.append(journal, &empty, &after)?;
                Ok((rewritten, audit_id))
            },
        ))
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        match self.tree::<T>()?.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load<T: Record>(&self, id: &str) -> Result<T> {
        self.get(id)?.ok_or_else(|| LimsError::NotFound {
            kind: T::KIND.as_str(),
            id: id.to_string(),
        })
    }

    /// Read-modify-write one record. `apply` runs against the freshly loaded
    /// value inside a transaction and is re-run if another writer got there
    /// first, so a guard like "only stamp if unset" is evaluated against what
    /// is actually stored. The new value and its audit record are written
    /// together. An error from `apply`, or a value that comes out unchanged,
    /// writes nothing.
    pub fn update<T, R>(
        &self,
        id: &str,
        audit: &PendingAudit,
        apply: impl FnMut(&mut T) -> Result<R>,
    ) -> Result<Updated<T, R>>
    where
        T: Record + Clone,
    {
        self.modify(id, None, audit, apply)
    }

    /// Like [`Store::update`], but a missing record starts out as `seed()`.
    pub fn update_or_seed<T, R>(
        &self,
        id: &str,
        seed: impl Fn() -> T,
        audit: &PendingAudit,
        apply: impl FnMut(&mut T) -> Result<R>,
    ) -> Result<Updated<T, R>>
    where
        T: Record + Clone,
    {
        self.modify(id, Some(&seed), audit, apply)
    }

    fn modify<T, R>(
        &self,
        id: &str,
        seed: Option<&dyn Fn() -> T>,
        audit: &PendingAudit,
        apply: impl FnMut(&mut T) -> Result<R>,
    ) -> Result<Updated<T, R>>
    where
        T: Record + Clone,
    {
        let tree = self.tree::<T>()?;
        let apply = RefCell::new(apply);

        let updated = finish((&tree, audit.tree()).transaction(
            |(entities, journal)| -> TxResult<Updated<T, R>> {
                let before: T = match (entities.get(id.as_bytes())?, seed) {
                    (Some(raw), _) => minicbor::decode(&raw).map_err(|e| abort(e.into()))?,
                    (None, Some(seed)) => seed(),
                    (None, None) => {
                        return Err(abort(LimsError::NotFound {
                            kind: T::KIND.as_str(),
                            id: id.to_string(),
                        }));
                    }
                };
                let mut after = before.clone();
                let value = {
                    let mut apply = apply.borrow_mut();
                    (*apply)(&mut after).map_err(abort)?
                };

                let old = minicbor::to_vec(&before).map_err(|e| abort(e.into()))?;
                let new = minicbor::to_vec(&after).map_err(|e| abort(e.into()))?;
                if old == new {
                    return Ok(Updated {
                        before,
                        after,
                        value,
                        changed: false,
                        audit_id: None,
                    });
                }

                entities.insert(id.as_bytes(), new)?;
                let audit_id = audit.append(journal, &before.snapshot(), &after.snapshot())?;
                Ok(Updated {
                    before,
                    after,
                    value,
                    changed: true,
                    audit_id,
                })
            },
        ))?;

        if !updated.changed {
            tracing::debug!(kind = %T::KIND, id, "value unchanged, nothing written");
        }
        Ok(updated)
    }

    /// Every record of kind `T` matching `keep`.
    pub fn scan<T: Record>(&self, keep: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        let mut found = Vec::new();
        for item in self.tree::<T>()?.iter() {
            let (_, bytes) = item?;
            let record: T = minicbor::decode(&bytes)?;
            if keep(&record) {
                found.push(record);
            }
        }
        Ok(found)
    }
}
