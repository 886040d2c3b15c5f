//! RocksDB-backed `CollabStore`.
//!
//! Column families:
//! - `sharing`       : `PageSharingRecord` keyed by page_id (bincode)
//! - `journal`       : `JournalEntry` keyed by `page_id ‖ sequence` (bincode + LZ4)
//! - `comments`      : `Comment` keyed by comment_id (bincode)
//! - `notifications` : `Notification` keyed by `user_id ‖ notification_id` (bincode)
//!
//! Journal keys put the page first so that page and block reads are prefix
//! scans; user reads walk the whole family.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{decode, encode, CollabStore, JournalFilter, JournalScope, StoreError};
use crate::model::{
    BlockId, Comment, CommentId, JournalEntry, Notification, PageId, PageSharingRecord, UserId,
};

const CF_SHARING: &str = "sharing";
const CF_JOURNAL: &str = "journal";
const CF_COMMENTS: &str = "comments";
const CF_NOTIFICATIONS: &str = "notifications";

const COLUMN_FAMILIES: &[&str] = &[CF_SHARING, CF_JOURNAL, CF_COMMENTS, CF_NOTIFICATIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_pages_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next journal sequence number
    sequence: AtomicU64,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened page store at {} (next journal sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed.
            CF_JOURNAL => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }

        opts
    }

    /// One past the highest journal sequence on disk.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_JOURNAL)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_JOURNAL}' not found")))?;

        let mut next = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = journal_sequence(&key) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key, value, &write_opts)?;
        Ok(())
    }

    /// Decoded values of every key starting with `prefix`, in key order.
    fn scan_prefix<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &[u8],
        decode_value: impl Fn(&[u8]) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(decode_value(&value)?);
        }
        Ok(values)
    }

    fn journal_key(page_id: PageId, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(page_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn notification_key(user_id: UserId, notification_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(user_id.as_bytes());
        key.extend_from_slice(notification_id.as_bytes());
        key
    }
}

fn journal_sequence(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(16..24)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn encode_journal(entry: &JournalEntry) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(entry)?))
}

fn decode_journal(bytes: &[u8]) -> Result<JournalEntry, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    decode(&raw)
}

impl CollabStore for RocksStore {
    fn insert_sharing(&self, record: &PageSharingRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_SHARING)?;
        if self.db.get_cf(cf, record.page_id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(record.page_id));
        }
        self.put(CF_SHARING, record.page_id.as_bytes(), &encode(record)?)
    }

    fn load_sharing(&self, page_id: PageId) -> Result<Option<PageSharingRecord>, StoreError> {
        let cf = self.cf(CF_SHARING)?;
        match self.db.get_cf(cf, page_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_sharing(&self, record: &PageSharingRecord) -> Result<(), StoreError> {
        self.put(CF_SHARING, record.page_id.as_bytes(), &encode(record)?)
    }

    fn list_sharing(&self) -> Result<Vec<PageId>, StoreError> {
        let cf = self.cf(CF_SHARING)?;
        let mut pages = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = Uuid::from_slice(&key)
                .map_err(|_| StoreError::Deserialization("Invalid page key".into()))?;
            pages.push(id);
        }
        Ok(pages)
    }

    fn append_journal(&self, mut entry: JournalEntry) -> Result<JournalEntry, StoreError> {
        entry.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = Self::journal_key(entry.page_id, entry.sequence);
        self.put(CF_JOURNAL, &key, &encode_journal(&entry)?)?;
        Ok(entry)
    }

    fn journal_entries(&self, filter: &JournalFilter) -> Result<Vec<JournalEntry>, StoreError> {
        let candidates = match filter.scope {
            JournalScope::Page(page) | JournalScope::Block(page, _) => {
                self.scan_prefix(CF_JOURNAL, page.as_bytes(), decode_journal)?
            }
            JournalScope::User(_) => self.scan_prefix(CF_JOURNAL, &[], decode_journal)?,
        };
        let matching = candidates.into_iter().filter(|e| filter.matches(e)).collect();
        Ok(filter.paginate(matching))
    }

    fn latest_content(&self, page_id: PageId, block_id: Option<BlockId>) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_JOURNAL)?;
        let prefix = page_id.as_bytes();
        let upper = Self::journal_key(page_id, u64::MAX);
        for item in self.db.iterator_cf(cf, IteratorMode::From(upper.as_slice(), Direction::Reverse)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let entry = decode_journal(&value)?;
            if entry.block_id == block_id && entry.new_content.is_some() {
                return Ok(entry.new_content);
            }
        }
        Ok(None)
    }

    fn insert_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        let cf = self.cf(CF_COMMENTS)?;
        if self.db.get_cf(cf, comment.id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(comment.id));
        }
        self.put(CF_COMMENTS, comment.id.as_bytes(), &encode(comment)?)
    }

    fn load_comment(&self, comment_id: CommentId) -> Result<Option<Comment>, StoreError> {
        let cf = self.cf(CF_COMMENTS)?;
        match self.db.get_cf(cf, comment_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.put(CF_COMMENTS, comment.id.as_bytes(), &encode(comment)?)
    }

    fn comments_for_page(&self, page_id: PageId) -> Result<Vec<Comment>, StoreError> {
        let mut comments: Vec<Comment> = self
            .scan_prefix(CF_COMMENTS, &[], |bytes| decode::<Comment>(bytes))?
            .into_iter()
            .filter(|c| c.page_id == page_id)
            .collect();
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        let key = Self::notification_key(notification.user_id, notification.id);
        self.put(CF_NOTIFICATIONS, &key, &encode(notification)?)
    }

    fn notifications_for_user(&self, user_id: UserId) -> Result<Vec<Notification>, StoreError> {
        let mut notifications: Vec<Notification> =
            self.scan_prefix(CF_NOTIFICATIONS, user_id.as_bytes(), |bytes| decode(bytes))?;
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    fn save_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        let key = Self::notification_key(notification.user_id, notification.id);
        let cf = self.cf(CF_NOTIFICATIONS)?;
        if self.db.get_cf(cf, &key)?.is_none() {
            return Err(StoreError::NotFound(notification.id));
        }
        self.put(CF_NOTIFICATIONS, &key, &encode(notification)?)
    }

    fn delete_notifications_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_NOTIFICATIONS)?;
        let prefix = user_id.as_bytes();

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeType, NotificationKind, PermissionLevel};
    use crate::storage::JournalQuery;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_sharing_roundtrip() {
        let (_dir, store) = open_temp();
        let owner = Uuid::new_v4();
        let mut record = PageSharingRecord::new(Uuid::new_v4(), owner);
        store.insert_sharing(&record).unwrap();

        record.is_public = true;
        store.save_sharing(&record).unwrap();

        let loaded = store.load_sharing(record.page_id).unwrap().unwrap();
        assert!(loaded.is_public);
        assert_eq!(loaded.effective_level(owner), Some(PermissionLevel::Admin));
        assert!(store.load_sharing(Uuid::new_v4()).unwrap().is_none());
        assert!(matches!(
            store.insert_sharing(&record),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_journal_scopes_and_order() {
        let (_dir, store) = open_temp();
        let page_a = Uuid::new_v4();
        let page_b = Uuid::new_v4();
        let block = Uuid::new_v4();
        let user = Uuid::new_v4();

        store.append_journal(JournalEntry::new(page_a, user, ChangeType::Create)).unwrap();
        store
            .append_journal(
                JournalEntry::new(page_a, user, ChangeType::Update)
                    .with_block(Some(block))
                    .with_content(None, Some("v2".into())),
            )
            .unwrap();
        store.append_journal(JournalEntry::new(page_b, user, ChangeType::Create)).unwrap();

        let by_page = store
            .journal_entries(&JournalFilter {
                scope: JournalScope::Page(page_a),
                query: JournalQuery::default(),
            })
            .unwrap();
        assert_eq!(by_page.len(), 2);
        assert_eq!(by_page[0].new_content.as_deref(), Some("v2"));

        let by_block = store
            .journal_entries(&JournalFilter {
                scope: JournalScope::Block(page_a, block),
                query: JournalQuery::default(),
            })
            .unwrap();
        assert_eq!(by_block.len(), 1);

        let by_user = store
            .journal_entries(&JournalFilter {
                scope: JournalScope::User(user),
                query: JournalQuery::latest(2),
            })
            .unwrap();
        assert_eq!(by_user.len(), 2);
        assert_eq!(by_user[0].page_id, page_b);
    }

    #[test]
    fn test_latest_content_stays_within_page() {
        let (_dir, store) = open_temp();
        let page = Uuid::new_v4();
        let next_page = Uuid::new_v4();
        let block = Uuid::new_v4();
        let user = Uuid::new_v4();
        let write = |page_id, block_id, content: &str| {
            store
                .append_journal(
                    JournalEntry::new(page_id, user, ChangeType::Update)
                        .with_block(block_id)
                        .with_content(None, Some(content.into())),
                )
                .unwrap();
        };

        write(page, Some(block), "first");
        write(page, Some(block), "second");
        write(page, None, "whole");
        write(next_page, Some(block), "elsewhere");
        store.append_journal(JournalEntry::new(page, user, ChangeType::Permission)).unwrap();

        assert_eq!(store.latest_content(page, Some(block)).unwrap().as_deref(), Some("second"));
        assert_eq!(store.latest_content(page, None).unwrap().as_deref(), Some("whole"));
        assert_eq!(store.latest_content(Uuid::new_v4(), None).unwrap(), None);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let page = Uuid::new_v4();
        let user = Uuid::new_v4();

        let last = {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.append_journal(JournalEntry::new(page, user, ChangeType::Create)).unwrap();
            store.append_journal(JournalEntry::new(page, user, ChangeType::Update)).unwrap()
        };

        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let next = store.append_journal(JournalEntry::new(page, user, ChangeType::Update)).unwrap();
        assert_eq!(next.sequence, last.sequence + 1);
    }

    #[test]
    fn test_notifications_by_user() {
        let (_dir, store) = open_temp();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        let make = |user_id, created_at| Notification {
            id: Uuid::new_v4(),
            kind: NotificationKind::Mention,
            user_id,
            page_id: Uuid::new_v4(),
            message: "mentioned".into(),
            metadata: None,
            read: false,
            created_at,
        };

        let first = make(user, 1);
        store.insert_notification(&first).unwrap();
        store.insert_notification(&make(user, 2)).unwrap();
        store.insert_notification(&make(other, 3)).unwrap();

        let mut read = first.clone();
        read.read = true;
        store.save_notification(&read).unwrap();

        let mine = store.notifications_for_user(user).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].created_at, 2);
        assert!(mine[1].read);

        assert_eq!(store.delete_notifications_for_user(user).unwrap(), 2);
        assert_eq!(store.notifications_for_user(other).unwrap().len(), 1);
    }
}
