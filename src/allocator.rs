//! Sequential, human-readable lab code allocation
//!
//! Codes look like `BML 007`: a normalized prefix, a space and a zero-padded
//! per-prefix counter. Allocation for one prefix is serialized through a
//! per-prefix lock; different prefixes never contend.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{LimsError, Result};

const LOCK_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSync {
    pub before: u64,
    pub after: u64,
}

impl CounterSync {
    pub fn advanced(&self) -> bool {
        self.after > self.before
    }
}

#[derive(Clone)]
pub struct IdAllocator {
    tree: sled::Tree,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    width: usize,
    lock_timeout: Duration,
}

/// Uppercase and strip everything that is not ASCII alphanumeric.
pub fn normalize_prefix(raw: &str) -> Result<String> {
    let prefix: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if prefix.is_empty() {
        return Err(LimsError::InvalidInput(format!(
            "code prefix {raw:?} has no alphanumeric characters"
        )));
    }
    Ok(prefix)
}

/// Split `"ABC 007"` or `"ABC-007"` into its normalized prefix and number.
pub fn parse_code(code: &str) -> Result<(String, u64)> {
    let code = code.trim();
    let invalid = || LimsError::InvalidInput(format!("{code:?} is not a lab code"));

    let (prefix, number) = code.rsplit_once([' ', '-']).ok_or_else(invalid)?;
    let number: u64 = number.trim().parse().map_err(|_| invalid())?;
    Ok((normalize_prefix(prefix)?, number))
}

impl IdAllocator {
    pub fn new(db: &sled::Db, width: usize, lock_timeout: Duration) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("counters")?,
            locks: Arc::new(Mutex::new(HashMap::new())),
            width: width.max(1),
            lock_timeout,
        })
    }

    pub fn format(&self, prefix: &str, number: u64) -> String {
        format!("{prefix} {number:0width$}", width = self.width)
    }

    /// Last number handed out for `prefix`, zero if none.
    pub fn current(&self, prefix: &str) -> Result<u64> {
        let prefix = normalize_prefix(prefix)?;
        Ok(self.read(&prefix)?.0)
    }

    /// Mint the next code for `prefix`.
    pub fn next(&self, prefix: &str) -> Result<String> {
        self.next_with(prefix, |code| Ok(code.to_string()))
    }

    /// Mint the next code for `prefix` and hand it to `commit` while the
    /// prefix is still locked. If `commit` fails the counter is put back, so a
    /// refused caller never leaves a gap in the sequence.
    pub fn next_with<R>(
        &self,
        prefix: &str,
        commit: impl FnOnce(&str) -> Result<R>,
    ) -> Result<R> {
        let prefix = normalize_prefix(prefix)?;
        self.with_prefix_lock(&prefix, || {
            let (last, raw) = self.read(&prefix)?;
            let number = last
                .checked_add(1)
                .ok_or_else(|| LimsError::precondition(format!("counter {prefix} is exhausted")))?
                .max(1);
            let written = self.write(&prefix, raw.clone(), number)?;

            match commit(&self.format(&prefix, number)) {
                Ok(value) => {
                    tracing::debug!(%prefix, number, "lab code allocated");
                    Ok(value)
                }
                Err(e) => {
                    self.restore(&prefix, written, raw);
                    tracing::debug!(%prefix, number, error = %e, "lab code released");
                    Err(e)
                }
            }
        })
    }

    /// Advance the counter behind `code` to its number if that is higher.
    /// The stored value never goes down.
    pub fn sync_counter_from_code(&self, code: &str) -> Result<(String, CounterSync)> {
        let (prefix, sync, _) = self.sync_counter_with(code, |_, _| Ok(()))?;
        Ok((prefix, sync))
    }

    /// Like [`IdAllocator::sync_counter_from_code`], calling `on_advance`
    /// while the prefix is locked when the counter moved. If `on_advance`
    /// fails the counter is put back.
    pub fn sync_counter_with<R>(
        &self,
        code: &str,
        on_advance: impl FnOnce(&str, CounterSync) -> Result<R>,
    ) -> Result<(String, CounterSync, Option<R>)> {
        let (prefix, number) = parse_code(code)?;
        let (sync, value) = self.with_prefix_lock(&prefix, || {
            let (last, raw) = self.read(&prefix)?;
            if number <= last {
                let unchanged = CounterSync {
                    before: last,
                    after: last,
                };
                return Ok((unchanged, None));
            }
            let written = self.write(&prefix, raw.clone(), number)?;
            let sync = CounterSync {
                before: last,
                after: number,
            };
            match on_advance(&prefix, sync) {
                Ok(value) => Ok((sync, Some(value))),
                Err(e) => {
                    self.restore(&prefix, written, raw);
                    Err(e)
                }
            }
        })?;
        Ok((prefix, sync, value))
    }

    fn read(&self, prefix: &str) -> Result<(u64, Option<sled::IVec>)> {
        let raw = self.tree.get(prefix.as_bytes())?;
        let value = match &raw {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    LimsError::Codec(format!("counter {prefix} holds a malformed value"))
                })?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        Ok((value, raw))
    }

    // The prefix lock serializes writers in this process; the swap catches
    // anything that slipped past it.
    fn write(&self, prefix: &str, previous: Option<sled::IVec>, value: u64) -> Result<sled::IVec> {
        let bytes = sled::IVec::from(&value.to_be_bytes()[..]);
        self.tree
            .compare_and_swap(prefix.as_bytes(), previous, Some(bytes.clone()))?
            .map_err(|_| LimsError::AllocationConflict {
                prefix: prefix.to_string(),
            })?;
        Ok(bytes)
    }

    /// Put back `original` if the counter still holds what we wrote.
    fn restore(&self, prefix: &str, written: sled::IVec, original: Option<sled::IVec>) {
        match self
            .tree
            .compare_and_swap(prefix.as_bytes(), Some(written), original)
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::warn!(%prefix, "counter moved underneath us, not restored"),
            Err(e) => tracing::warn!(%prefix, error = %e, "counter restore failed"),
        }
    }

    fn slot(&self, prefix: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(prefix.to_string()).or_default().clone()
    }

    // Registry entries live only while some caller holds or waits on them.
    fn release(&self, prefix: &str, slot: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&slot) == 2 {
            locks.remove(prefix);
        }
    }

    fn with_prefix_lock<R>(&self, prefix: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let slot = self.slot(prefix);
        let result = self.locked(prefix, &slot, f);
        self.release(prefix, slot);
        result
    }

    fn locked<R>(
        &self,
        prefix: &str,
        slot: &Mutex<()>,
        f: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let _guard = match slot.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(%prefix, "counter lock timed out");
                        return Err(LimsError::AllocationConflict {
                            prefix: prefix.to_string(),
                        });
                    }
                    thread::sleep(LOCK_POLL);
                    continue;
                }
            };
            return f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> IdAllocator {
        let db = sled::Config::new().temporary(true).open().unwrap();
        IdAllocator::new(&db, 3, Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn prefix_is_normalized() {
        assert_eq!(normalize_prefix("b-m l").unwrap(), "BML");
        assert!(normalize_prefix(" -- ").is_err());
    }

    #[test]
    fn next_starts_at_one_and_pads() {
        let alloc = allocator();
        assert_eq!(alloc.next("bml").unwrap(), "BML 001");
        assert_eq!(alloc.next("BML").unwrap(), "BML 002");
        assert_eq!(alloc.next("xyz").unwrap(), "XYZ 001");
    }

    #[test]
    fn wide_numbers_are_not_truncated() {
        let alloc = allocator();
        alloc.sync_counter_from_code("BML 1233").unwrap();
        assert_eq!(alloc.next("BML").unwrap(), "BML 1234");
    }

    #[test]
    fn parse_accepts_space_and_dash() {
        assert_eq!(parse_code("ABC 007").unwrap(), ("ABC".to_string(), 7));
        assert_eq!(parse_code("abc-010").unwrap(), ("ABC".to_string(), 10));
        assert!(parse_code("ABC007").is_err());
        assert!(parse_code("ABC x7").is_err());
    }

    #[test]
    fn sync_never_regresses() {
        let alloc = allocator();
        alloc.sync_counter_from_code("BML 005").unwrap();
        let (_, sync) = alloc.sync_counter_from_code("BML 003").unwrap();
        assert!(!sync.advanced());
        assert_eq!(alloc.current("BML").unwrap(), 5);

        let (_, sync) = alloc.sync_counter_from_code("BML-009").unwrap();
        assert_eq!(sync, CounterSync { before: 5, after: 9 });
        assert_eq!(alloc.current("BML").unwrap(), 9);
    }

    #[test]
    fn held_lock_surfaces_as_retryable_conflict() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let alloc = IdAllocator::new(&db, 3, Duration::from_millis(20)).unwrap();
        let slot = alloc.slot("BML");
        let _held = slot.lock().unwrap();

        let err = alloc.next("bml").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(alloc.next("OTHER").unwrap(), "OTHER 001");
    }

    #[test]
    fn refused_commit_gives_the_number_back() {
        let alloc = allocator();
        alloc.next("bml").unwrap();

        let err = alloc
            .next_with("bml", |code| -> Result<()> {
                assert_eq!(code, "BML 002");
                Err(LimsError::AlreadyFinalized("sample s1".into()))
            })
            .unwrap_err();
        assert!(matches!(err, LimsError::AlreadyFinalized(_)));
        assert_eq!(alloc.current("BML").unwrap(), 1);
        assert_eq!(alloc.next("BML").unwrap(), "BML 002");
    }

    #[test]
    fn refused_first_commit_leaves_no_counter() {
        let alloc = allocator();
        let _ = alloc.next_with("xyz", |_| -> Result<()> { Err(LimsError::precondition("no")) });
        assert_eq!(alloc.current("XYZ").unwrap(), 0);
        assert!(alloc.tree.get("XYZ").unwrap().is_none());
    }

    #[test]
    fn refused_sync_is_rolled_back() {
        let alloc = allocator();
        alloc.sync_counter_from_code("BML 004").unwrap();
        let err = alloc
            .sync_counter_with("BML 010", |_, _| -> Result<()> {
                Err(LimsError::precondition("no"))
            })
            .unwrap_err();
        assert!(matches!(err, LimsError::PreconditionFailed(_)));
        assert_eq!(alloc.current("BML").unwrap(), 4);
    }

    #[test]
    fn idle_prefix_locks_are_dropped() {
        let alloc = allocator();
        alloc.next("bml").unwrap();
        alloc.sync_counter_from_code("XYZ 3").unwrap();
        assert!(alloc.locks.lock().unwrap().is_empty());
    }
}
