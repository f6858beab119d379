//! # Mock Bucket Store
//!
//! Purpose: Hold users, buckets and documents for the mock server, with the
//! access rules and CAS semantics both protocol front-ends share.
//!
//! ## Design Principles
//! 1. **Protocol Neutral**: Operations return `StoreError`; each front-end maps
//!    it onto its own status codes.
//! 2. **Coarse Locking**: One mutex around the bucket table, one around the
//!    ioctl table.
//! 3. **Per-Connection Session**: Authentication and bucket selection live in
//!    `Session`, owned by the connection task.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use mcd_common::{BucketType, EwbEngineMode, MutationType};
use parking_lot::Mutex;

/// Highest vbucket owned by the mock node.
pub const MAX_OWNED_VBUCKET: u16 = 511;

/// Administrator allowed to manage buckets and ioctls.
pub const ADMIN_USER: &str = "_admin";

/// Buckets present at startup.
pub const DEFAULT_BUCKETS: [&str; 3] = ["default", "bucket-1", "bucket-2"];

/// Credentials seeded into the mock server: `_admin`, `bucket-1`, `bucket-2`
/// and `mybucket_000` through `mybucket_099` (password equals the name).
pub fn default_users() -> Vec<(String, String)> {
    let mut users = vec![
        (ADMIN_USER.to_string(), "password".to_string()),
        ("bucket-1".to_string(), "1S|=,%#x1".to_string()),
        ("bucket-2".to_string(), "secret".to_string()),
    ];
    for idx in 0..100 {
        let name = format!("mybucket_{idx:03}");
        users.push((name.clone(), name));
    }
    users
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Exists,
    NotStored,
    NotMyVbucket,
    InvalidArguments,
    NoBucket,
    NoAccess,
    AuthFailed,
    NotSupported,
    /// Raw status injected by the ewouldblock engine.
    Injected(u16),
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Vec<u8>,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
}

/// Result of a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub cas: u64,
    pub seqno: u64,
    pub vbucket_uuid: u64,
}

/// A mutation request in protocol-neutral form.
#[derive(Debug, Clone)]
pub struct Mutation<'a> {
    pub operation: MutationType,
    pub key: &'a str,
    pub value: &'a [u8],
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
    pub vbucket: u16,
}

#[derive(Debug)]
struct Bucket {
    bucket_type: BucketType,
    uuid: u64,
    seqno: u64,
    items: HashMap<String, Item>,
}

impl Bucket {
    fn new(name: &str, bucket_type: BucketType) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Bucket {
            bucket_type,
            uuid: hasher.finish() | 1,
            seqno: 0,
            items: HashMap::new(),
        }
    }
}

/// Error injection configured through EWOULDBLOCK_CTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injection {
    pub mode: EwbEngineMode,
    pub remaining: u32,
    pub status: u16,
}

/// Per-connection state.
#[derive(Debug, Default)]
pub struct Session {
    pub user: Option<String>,
    pub bucket: Option<String>,
    pub mutation_seqno: bool,
    pub injection: Option<Injection>,
}

impl Session {
    fn require_user(&self) -> Result<&str, StoreError> {
        self.user.as_deref().ok_or(StoreError::NoAccess)
    }

    fn require_admin(&self) -> Result<(), StoreError> {
        match self.user.as_deref() {
            Some(ADMIN_USER) => Ok(()),
            _ => Err(StoreError::NoAccess),
        }
    }

    fn require_bucket(&self) -> Result<&str, StoreError> {
        self.require_user()?;
        self.bucket.as_deref().ok_or(StoreError::NoBucket)
    }

    /// Consumes one injected failure, if any is armed.
    fn take_injection(&mut self) -> Result<(), StoreError> {
        let Some(injection) = self.injection.as_mut() else {
            return Ok(());
        };
        match injection.mode {
            EwbEngineMode::NextN | EwbEngineMode::Sequence if injection.remaining > 0 => {
                injection.remaining -= 1;
                Err(StoreError::Injected(injection.status))
            }
            EwbEngineMode::First => {
                let status = injection.status;
                self.injection = None;
                Err(StoreError::Injected(status))
            }
            _ => Ok(()),
        }
    }
}

fn can_access(user: &str, bucket: &str) -> bool {
    user == ADMIN_USER || user == bucket
}

fn valid_bucket_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '%' | '.'))
}

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    users: HashMap<String, String>,
    buckets: Mutex<BTreeMap<String, Bucket>>,
    ioctls: Mutex<HashMap<String, String>>,
    next_cas: AtomicU64,
    audit_reloads: AtomicU64,
    connections: AtomicU64,
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState::new()
    }
}

impl ServerState {
    pub fn new() -> Self {
        let mut buckets = BTreeMap::new();
        for name in DEFAULT_BUCKETS {
            buckets.insert(name.to_string(), Bucket::new(name, BucketType::Memcached));
        }
        let ioctls = [
            ("release_free_memory", ""),
            ("tcmalloc.aggressive_memory_decommit", "0"),
            ("trace.config", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        ServerState {
            users: default_users().into_iter().collect(),
            buckets: Mutex::new(buckets),
            ioctls: Mutex::new(ioctls),
            next_cas: AtomicU64::new(1),
            audit_reloads: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audit_reloads(&self) -> u64 {
        self.audit_reloads.load(Ordering::Relaxed)
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }

    pub fn authenticate(
        &self,
        session: &mut Session,
        username: &str,
        password: &str,
    ) -> Result<(), StoreError> {
        match self.users.get(username) {
            Some(expected) if expected == password => {
                session.user = Some(username.to_string());
                session.bucket = None;
                Ok(())
            }
            _ => Err(StoreError::AuthFailed),
        }
    }

    pub fn create_bucket(
        &self,
        session: &Session,
        name: &str,
        bucket_type: BucketType,
    ) -> Result<(), StoreError> {
        session.require_admin()?;
        if !valid_bucket_name(name) {
            return Err(StoreError::InvalidArguments);
        }
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(name) {
            return Err(StoreError::Exists);
        }
        buckets.insert(name.to_string(), Bucket::new(name, bucket_type));
        Ok(())
    }

    pub fn delete_bucket(&self, session: &Session, name: &str) -> Result<(), StoreError> {
        session.require_admin()?;
        let mut buckets = self.buckets.lock();
        buckets.remove(name).map(|_| ()).ok_or(StoreError::NotFound)
    }

    pub fn select_bucket(&self, session: &mut Session, name: &str) -> Result<(), StoreError> {
        let user = session.require_user()?;
        let buckets = self.buckets.lock();
        if !buckets.contains_key(name) {
            return Err(StoreError::NotFound);
        }
        if !can_access(user, name) {
            return Err(StoreError::NoAccess);
        }
        session.bucket = Some(name.to_string());
        session.injection = None;
        Ok(())
    }

    pub fn list_buckets(&self, session: &Session) -> Result<Vec<String>, StoreError> {
        let user = session.require_user()?;
        let buckets = self.buckets.lock();
        Ok(buckets
            .keys()
            .filter(|name| can_access(user, name))
            .cloned()
            .collect())
    }

    pub fn get(&self, session: &mut Session, key: &str, vbucket: u16) -> Result<Item, StoreError> {
        let bucket = session.require_bucket()?.to_string();
        session.take_injection()?;
        if vbucket > MAX_OWNED_VBUCKET {
            return Err(StoreError::NotMyVbucket);
        }
        let buckets = self.buckets.lock();
        let bucket = buckets.get(&bucket).ok_or(StoreError::NoBucket)?;
        bucket.items.get(key).cloned().ok_or(StoreError::NotFound)
    }

    pub fn mutate(&self, session: &mut Session, m: &Mutation<'_>) -> Result<Stored, StoreError> {
        let bucket = session.require_bucket()?.to_string();
        session.take_injection()?;
        if m.vbucket > MAX_OWNED_VBUCKET {
            return Err(StoreError::NotMyVbucket);
        }
        if m.key.is_empty() {
            return Err(StoreError::InvalidArguments);
        }

        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_mut(&bucket).ok_or(StoreError::NoBucket)?;
        let existing = bucket.items.get(m.key);

        match (m.operation, existing) {
            (MutationType::Add, Some(_)) => return Err(StoreError::Exists),
            (MutationType::Replace | MutationType::Delete, None) => {
                return Err(StoreError::NotFound)
            }
            (MutationType::Append | MutationType::Prepend, None) => {
                return Err(StoreError::NotStored)
            }
            (MutationType::Set, None) if m.cas != 0 => return Err(StoreError::NotFound),
            (_, Some(item)) if m.cas != 0 && item.cas != m.cas => {
                return Err(StoreError::NotStored)
            }
            _ => {}
        }

        let cas = self.next_cas();
        match m.operation {
            MutationType::Delete => {
                bucket.items.remove(m.key);
            }
            MutationType::Append | MutationType::Prepend => {
                let item = bucket.items.get_mut(m.key).ok_or(StoreError::NotStored)?;
                if m.operation == MutationType::Append {
                    item.value.extend_from_slice(m.value);
                } else {
                    let mut value = m.value.to_vec();
                    value.extend_from_slice(&item.value);
                    item.value = value;
                }
                item.cas = cas;
            }
            MutationType::Add | MutationType::Set | MutationType::Replace => {
                bucket.items.insert(
                    m.key.to_string(),
                    Item {
                        value: m.value.to_vec(),
                        flags: m.flags,
                        datatype: m.datatype,
                        cas,
                    },
                );
            }
        }
        bucket.seqno += 1;
        Ok(Stored {
            cas,
            seqno: bucket.seqno,
            vbucket_uuid: bucket.uuid,
        })
    }

    /// Statistics for a group; `""` is the default group.
    pub fn stats(&self, group: &str) -> Result<Vec<(String, String)>, StoreError> {
        match group {
            "" => {
                let buckets = self.buckets.lock();
                let items: usize = buckets.values().map(|b| b.items.len()).sum();
                Ok(vec![
                    ("pid".to_string(), std::process::id().to_string()),
                    (
                        "total_connections".to_string(),
                        self.connections.load(Ordering::Relaxed).to_string(),
                    ),
                    ("curr_items".to_string(), items.to_string()),
                    ("buckets".to_string(), buckets.len().to_string()),
                ])
            }
            "audit" => Ok(vec![(
                "reloads".to_string(),
                self.audit_reloads().to_string(),
            )]),
            _ => Err(StoreError::NotFound),
        }
    }

    pub fn reload_audit(&self, session: &Session) -> Result<(), StoreError> {
        session.require_user()?;
        self.audit_reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn ioctl_get(&self, session: &Session, key: &str) -> Result<String, StoreError> {
        session.require_admin()?;
        let ioctls = self.ioctls.lock();
        ioctls.get(key).cloned().ok_or(StoreError::InvalidArguments)
    }

    pub fn ioctl_set(&self, session: &Session, key: &str, value: &str) -> Result<(), StoreError> {
        session.require_admin()?;
        let mut ioctls = self.ioctls.lock();
        match ioctls.get_mut(key) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(StoreError::InvalidArguments),
        }
    }

    /// Arms error injection; requires an ewouldblock bucket.
    pub fn configure_ewouldblock(
        &self,
        session: &mut Session,
        mode: u32,
        value: u32,
        status: u16,
    ) -> Result<(), StoreError> {
        let bucket = session.require_bucket()?.to_string();
        let buckets = self.buckets.lock();
        match buckets.get(&bucket) {
            Some(b) if b.bucket_type == BucketType::EWouldBlock => {}
            Some(_) => return Err(StoreError::NotSupported),
            None => return Err(StoreError::NoBucket),
        }
        let mode = match mode {
            0 => EwbEngineMode::NextN,
            1 => EwbEngineMode::Random,
            2 => EwbEngineMode::First,
            3 => EwbEngineMode::Sequence,
            4 => EwbEngineMode::NoNotify,
            5 => EwbEngineMode::CasMismatch,
            _ => return Err(StoreError::InvalidArguments),
        };
        session.injection = Some(Injection {
            mode,
            remaining: value,
            status,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_in(state: &ServerState, user: &str, password: &str) -> Session {
        let mut session = Session::default();
        state.authenticate(&mut session, user, password).unwrap();
        session
    }

    fn set<'a>(key: &'a str, value: &'a [u8]) -> Mutation<'a> {
        Mutation {
            operation: MutationType::Set,
            key,
            value,
            flags: 0,
            datatype: 0,
            cas: 0,
            vbucket: 0,
        }
    }

    #[test]
    fn seeded_credentials() {
        let state = ServerState::new();
        let mut session = Session::default();
        assert!(state.authenticate(&mut session, "bucket-1", "1S|=,%#x1").is_ok());
        assert!(state.authenticate(&mut session, "mybucket_042", "mybucket_042").is_ok());
        assert_eq!(
            state.authenticate(&mut session, "bucket-2", "wrong"),
            Err(StoreError::AuthFailed)
        );
        assert_eq!(default_users().len(), 103);
    }

    #[test]
    fn bucket_admin_is_restricted() {
        let state = ServerState::new();
        let user = logged_in(&state, "bucket-1", "1S|=,%#x1");
        assert_eq!(
            state.create_bucket(&user, "new", BucketType::Memcached),
            Err(StoreError::NoAccess)
        );

        let admin = logged_in(&state, ADMIN_USER, "password");
        state.create_bucket(&admin, "new", BucketType::Memcached).unwrap();
        assert_eq!(
            state.create_bucket(&admin, "new", BucketType::Memcached),
            Err(StoreError::Exists)
        );
        assert_eq!(
            state.create_bucket(&admin, "bad name", BucketType::Memcached),
            Err(StoreError::InvalidArguments)
        );
        state.delete_bucket(&admin, "new").unwrap();
        assert_eq!(state.delete_bucket(&admin, "new"), Err(StoreError::NotFound));
    }

    #[test]
    fn mutation_rules() {
        let state = ServerState::new();
        let mut session = logged_in(&state, "bucket-1", "1S|=,%#x1");
        state.select_bucket(&mut session, "bucket-1").unwrap();

        let first = state.mutate(&mut session, &set("k", b"v1")).unwrap();
        assert_ne!(first.cas, 0);
        assert_eq!(first.seqno, 1);

        let mut add = set("k", b"v2");
        add.operation = MutationType::Add;
        assert_eq!(state.mutate(&mut session, &add), Err(StoreError::Exists));

        let mut replace = set("missing", b"v");
        replace.operation = MutationType::Replace;
        assert_eq!(state.mutate(&mut session, &replace), Err(StoreError::NotFound));

        let mut stale = set("k", b"v3");
        stale.cas = first.cas + 1000;
        assert_eq!(state.mutate(&mut session, &stale), Err(StoreError::NotStored));

        let mut append = set("k", b"+");
        append.operation = MutationType::Append;
        state.mutate(&mut session, &append).unwrap();
        assert_eq!(state.get(&mut session, "k", 0).unwrap().value, b"v1+");

        assert_eq!(
            state.get(&mut session, "k", MAX_OWNED_VBUCKET + 1),
            Err(StoreError::NotMyVbucket)
        );
    }

    #[test]
    fn get_requires_bucket() {
        let state = ServerState::new();
        let mut anonymous = Session::default();
        assert_eq!(state.get(&mut anonymous, "k", 0), Err(StoreError::NoAccess));

        let mut session = logged_in(&state, "bucket-2", "secret");
        assert_eq!(state.get(&mut session, "k", 0), Err(StoreError::NoBucket));
        assert_eq!(
            state.select_bucket(&mut session, "bucket-1"),
            Err(StoreError::NoAccess)
        );
    }

    #[test]
    fn injection_fails_next_n_operations() {
        let state = ServerState::new();
        let mut admin = logged_in(&state, ADMIN_USER, "password");
        state
            .create_bucket(&admin, "ewb", BucketType::EWouldBlock)
            .unwrap();
        state.select_bucket(&mut admin, "ewb").unwrap();
        state.configure_ewouldblock(&mut admin, 0, 2, 0x86).unwrap();

        assert_eq!(state.get(&mut admin, "k", 0), Err(StoreError::Injected(0x86)));
        assert_eq!(state.get(&mut admin, "k", 0), Err(StoreError::Injected(0x86)));
        assert_eq!(state.get(&mut admin, "k", 0), Err(StoreError::NotFound));
    }
}
