use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, error};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::apply::{apply_change, ApplyError, ApplyOutcome};
use crate::conflict::{Change, Entry};
use crate::csn::Csn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_cbor::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

fn normalize_dn(dn: &str) -> String { dn.to_ascii_lowercase() }

/// Storage of replicated entries and of the RUV attributes. Entries are keyed by their unique
/// id, which never changes, while DNs may change through renames and naming conflicts.
pub trait EntryStore: Send + Sync {
    fn get_entry(&self, uniqueid: &str) -> Result<Option<Entry>, StorageError>;

    /// Inserts or replaces an entry.
    fn put_entry(&self, entry: &Entry) -> Result<(), StorageError>;

    /// Removes an entry for good. Returns the removed entry, if it existed.
    fn remove_entry(&self, uniqueid: &str) -> Result<Option<Entry>, StorageError>;

    /// Finds a live (non-tombstone) entry using a given DN. DNs are compared case-insensitively.
    fn find_by_dn(&self, dn: &str) -> Result<Option<Entry>, StorageError>;

    /// Returns all entries, tombstones and entries moved aside by naming conflicts included,
    /// which have been given `dn` by their last add or rename.
    fn entries_claiming(&self, dn: &str) -> Result<Vec<Entry>, StorageError>;

    fn tombstones(&self) -> Result<Vec<Entry>, StorageError>;

    /// Reads values of a RUV `attribute` stored for `replica`. Missing attribute yields no
    /// values.
    fn read_ruv_attribute(&self, replica: &str, attribute: &str) -> Result<Vec<String>, StorageError>;

    fn write_ruv_attribute(&self, replica: &str, attribute: &str, values: &[String]) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError> { Ok(()) }

    /// Applies a change of an entry, resolving conflicts with concurrent updates.
    fn apply_write(&self, uniqueid: &str, change: &Change, csn: &Csn) -> Result<ApplyOutcome, ApplyError> {
        apply_change(self, uniqueid, change, csn)
    }
}

/// In-memory store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    ruv: RwLock<BTreeMap<(String, String), Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.read().len() }

    pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }
}

impl EntryStore for MemoryStore {
    fn get_entry(&self, uniqueid: &str) -> Result<Option<Entry>, StorageError> {
        Ok(self.entries.read().get(uniqueid).cloned())
    }

    fn put_entry(&self, entry: &Entry) -> Result<(), StorageError> {
        self.entries.write().insert(entry.uniqueid().to_string(), entry.clone());
        Ok(())
    }

    fn remove_entry(&self, uniqueid: &str) -> Result<Option<Entry>, StorageError> {
        Ok(self.entries.write().remove(uniqueid))
    }

    fn find_by_dn(&self, dn: &str) -> Result<Option<Entry>, StorageError> {
        Ok(self
            .entries
            .read()
            .values()
            .find(|e| !e.is_tombstone() && e.dn().eq_ignore_ascii_case(dn))
            .cloned())
    }

    fn entries_claiming(&self, dn: &str) -> Result<Vec<Entry>, StorageError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.claimed_dn().eq_ignore_ascii_case(dn))
            .cloned()
            .collect())
    }

    fn tombstones(&self) -> Result<Vec<Entry>, StorageError> {
        Ok(self.entries.read().values().filter(|e| e.is_tombstone()).cloned().collect())
    }

    fn read_ruv_attribute(&self, replica: &str, attribute: &str) -> Result<Vec<String>, StorageError> {
        let key = (replica.to_string(), attribute.to_string());
        Ok(self.ruv.read().get(&key).cloned().unwrap_or_default())
    }

    fn write_ruv_attribute(&self, replica: &str, attribute: &str, values: &[String]) -> Result<(), StorageError> {
        let key = (replica.to_string(), attribute.to_string());
        self.ruv.write().insert(key, values.to_vec());
        Ok(())
    }
}

/// Store persisted in sled. Entries and RUV attributes live in separate trees, encoded with
/// CBOR. Two more trees index entries by normalized DN: `dn` maps the DN a live entry is
/// visible under to its unique id, `claims` holds a `<dn>\0<unique id>` key for the DN each
/// entry has been given.
pub struct SledStore {
    db: sled::Db,
    entries: sled::Tree,
    dns: sled::Tree,
    claims: sled::Tree,
    ruv: sled::Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self::with_db(db)?)
    }

    /// Opens a store which is removed once dropped.
    pub fn temporary() -> crate::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::with_db(db)?)
    }

    fn with_db(db: sled::Db) -> Result<Self, StorageError> {
        let entries = db.open_tree("entries")?;
        let dns = db.open_tree("dn")?;
        let claims = db.open_tree("claims")?;
        let ruv = db.open_tree("ruv")?;
        Ok(SledStore { db, entries, dns, claims, ruv })
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
        Ok(serde_cbor::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    fn ruv_key(replica: &str, attribute: &str) -> String { format!("{}/{}", replica, attribute) }

    fn claim_prefix(dn: &str) -> String { format!("{}\0", normalize_dn(dn)) }

    fn claim_key(entry: &Entry) -> String { format!("{}{}", Self::claim_prefix(entry.claimed_dn()), entry.uniqueid()) }

    /// Drops a DN index record, unless it has been taken over by another entry.
    fn unindex(&self, dn: &str, uniqueid: &str) -> Result<(), StorageError> {
        let key = normalize_dn(dn);
        if let Some(owner) = self.dns.get(&key)? {
            if owner.as_ref() == uniqueid.as_bytes() {
                self.dns.remove(&key)?;
            }
        }
        Ok(())
    }
}

impl EntryStore for SledStore {
    fn get_entry(&self, uniqueid: &str) -> Result<Option<Entry>, StorageError> {
        match self.entries.get(uniqueid)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_entry(&self, entry: &Entry) -> Result<(), StorageError> {
        let bytes = Self::encode(entry)?;
        if let Some(old) = self.entries.insert(entry.uniqueid(), bytes)? {
            let old: Entry = Self::decode(&old)?;
            if old.is_tombstone() != entry.is_tombstone() || !old.dn().eq_ignore_ascii_case(&entry.dn()) {
                self.unindex(&old.dn(), old.uniqueid())?;
            }
            if !old.claimed_dn().eq_ignore_ascii_case(entry.claimed_dn()) {
                self.claims.remove(Self::claim_key(&old))?;
            }
        }
        if !entry.is_tombstone() {
            self.dns.insert(normalize_dn(&entry.dn()), entry.uniqueid().as_bytes())?;
        }
        self.claims.insert(Self::claim_key(entry), Vec::<u8>::new())?;
        Ok(())
    }

    fn remove_entry(&self, uniqueid: &str) -> Result<Option<Entry>, StorageError> {
        match self.entries.remove(uniqueid)? {
            Some(bytes) => {
                let entry: Entry = Self::decode(&bytes)?;
                self.unindex(&entry.dn(), uniqueid)?;
                self.claims.remove(Self::claim_key(&entry))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn find_by_dn(&self, dn: &str) -> Result<Option<Entry>, StorageError> {
        let uniqueid = match self.dns.get(normalize_dn(dn))? {
            Some(id) => id,
            None => return Ok(None),
        };
        let uniqueid = std::str::from_utf8(&uniqueid)
            .map_err(|e| StorageError::Backend(format!("corrupted DN index for '{}': {}", dn, e)))?;
        match self.get_entry(uniqueid)? {
            Some(entry) if !entry.is_tombstone() && entry.dn().eq_ignore_ascii_case(dn) => Ok(Some(entry)),
            _ => {
                debug!("stale DN index record for '{}'", dn);
                Ok(None)
            }
        }
    }

    fn entries_claiming(&self, dn: &str) -> Result<Vec<Entry>, StorageError> {
        let prefix = Self::claim_prefix(dn);
        let mut result = Vec::new();
        for key in self.claims.scan_prefix(prefix.as_bytes()).keys() {
            let key = key?;
            let uniqueid = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| StorageError::Backend(format!("corrupted claims index for '{}': {}", dn, e)))?;
            match self.get_entry(uniqueid)? {
                Some(entry) if entry.claimed_dn().eq_ignore_ascii_case(dn) => result.push(entry),
                _ => debug!("stale claims index record for '{}'", dn),
            }
        }
        Ok(result)
    }

    fn tombstones(&self) -> Result<Vec<Entry>, StorageError> {
        let mut result = Vec::new();
        for kv in self.entries.iter() {
            let (_, bytes) = kv?;
            let entry: Entry = Self::decode(&bytes)?;
            if entry.is_tombstone() {
                result.push(entry);
            }
        }
        Ok(result)
    }

    fn read_ruv_attribute(&self, replica: &str, attribute: &str) -> Result<Vec<String>, StorageError> {
        match self.ruv.get(Self::ruv_key(replica, attribute))? {
            Some(bytes) => Self::decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn write_ruv_attribute(&self, replica: &str, attribute: &str, values: &[String]) -> Result<(), StorageError> {
        let bytes = Self::encode(&values)?;
        self.ruv.insert(Self::ruv_key(replica, attribute), bytes)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| {
            error!("failed to flush sled store: {}", e);
            StorageError::from(e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use crate::conflict::{Change, Entry};
    use crate::csn::Csn;
    use crate::ruv::wire::RUV_ATTRIBUTE;
    use crate::store::{EntryStore, MemoryStore, SledStore};

    fn entry(uid: &str, dn: &str, ts: u32) -> Entry {
        let mut attrs = BTreeMap::new();
        attrs.insert("cn".to_string(), vec![uid.to_string()]);
        Entry::new(uid, dn, Csn::new(ts, 0, 1, 0), &attrs)
    }

    fn exercise(store: &dyn EntryStore) {
        store.put_entry(&entry("u1", "cn=A,dc=x", 10)).unwrap();
        assert_eq!(store.find_by_dn("CN=a,DC=x").unwrap().unwrap().uniqueid(), "u1");
        assert_eq!(store.entries_claiming("cn=a,dc=x").unwrap().len(), 1);

        let mut renamed = store.get_entry("u1").unwrap().unwrap();
        assert!(renamed.rename("cn=b,dc=x", &Csn::new(20, 0, 1, 0)));
        store.put_entry(&renamed).unwrap();
        assert!(store.find_by_dn("cn=a,dc=x").unwrap().is_none());
        assert!(store.find_by_dn("cn=b,dc=x").unwrap().is_some());
        assert!(store.entries_claiming("cn=a,dc=x").unwrap().is_empty());

        renamed.delete(&Csn::new(30, 0, 1, 0));
        store.put_entry(&renamed).unwrap();
        assert!(store.find_by_dn("cn=b,dc=x").unwrap().is_none());
        assert_eq!(store.tombstones().unwrap().len(), 1);
        // tombstones keep their claim
        assert_eq!(store.entries_claiming("CN=B,dc=x").unwrap(), vec![renamed.clone()]);

        assert!(store.remove_entry("u1").unwrap().is_some());
        assert!(store.get_entry("u1").unwrap().is_none());
        assert!(store.remove_entry("u1").unwrap().is_none());
        assert!(store.entries_claiming("cn=b,dc=x").unwrap().is_empty());

        assert!(store.read_ruv_attribute("r1", RUV_ATTRIBUTE).unwrap().is_empty());
        let values = vec!["{replicageneration}:G1".to_string(), "1:ldap://a:389".to_string()];
        store.write_ruv_attribute("r1", RUV_ATTRIBUTE, &values).unwrap();
        assert_eq!(store.read_ruv_attribute("r1", RUV_ATTRIBUTE).unwrap(), values);
        assert!(store.read_ruv_attribute("r2", RUV_ATTRIBUTE).unwrap().is_empty());
    }

    #[test]
    fn memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sled_store() {
        exercise(&SledStore::temporary().unwrap());
    }

    #[test]
    fn sled_store_dn_index_follows_owner() {
        let store = SledStore::temporary().unwrap();
        store.put_entry(&entry("u1", "cn=same", 10)).unwrap();
        store
            .apply_write("u2", &Change::Add { dn: "cn=same".into(), attributes: BTreeMap::new() }, &Csn::new(20, 0, 2, 0))
            .unwrap();
        assert_eq!(store.find_by_dn("cn=same").unwrap().unwrap().uniqueid(), "u2");
        assert_eq!(store.find_by_dn("nsuniqueid=u1+cn=same").unwrap().unwrap().uniqueid(), "u1");

        let claims: Vec<_> = store.entries_claiming("cn=same").unwrap().iter().map(|e| e.uniqueid().to_string()).collect();
        assert_eq!(claims, vec!["u1", "u2"]);
        // a claim with the same prefix belongs to another DN
        store.put_entry(&entry("u3", "cn=same,dc=x", 30)).unwrap();
        assert_eq!(store.entries_claiming("cn=same").unwrap().len(), 2);
    }

    #[test]
    fn sled_store_persists() {
        let path = std::env::temp_dir().join(format!("repl-core-store-{:016x}", rand::random::<u64>()));
        {
            let store = SledStore::open(&path).unwrap();
            store.put_entry(&entry("u1", "cn=a", 10)).unwrap();
            store.write_ruv_attribute("r1", RUV_ATTRIBUTE, &["{replicageneration}:G1".to_string()]).unwrap();
            store.flush().unwrap();
        }
        {
            let store = SledStore::open(&path).unwrap();
            assert_eq!(store.get_entry("u1").unwrap(), Some(entry("u1", "cn=a", 10)));
            assert_eq!(store.find_by_dn("cn=a").unwrap().unwrap().uniqueid(), "u1");
            assert_eq!(store.read_ruv_attribute("r1", RUV_ATTRIBUTE).unwrap(), vec!["{replicageneration}:G1"]);
        }
        let _ = std::fs::remove_dir_all(&path);
    }
}
