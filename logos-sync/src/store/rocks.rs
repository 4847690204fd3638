//! RocksDB-backed durable store.
//!
//! Column families:
//! - `rooms`          — Room records keyed by room id
//! - `room_index`     — (resource type, resource id) → room id
//! - `operations`     — LZ4-compressed operations keyed by `room:16 | ts:8 BE | id:16`
//! - `comments`       — Comments keyed by `room:16 | created_at:8 BE | id:16`
//! - `comment_ids`    — comment id → key in `comments`
//! - `invitations`    — Invitations keyed by `room:16 | created_at:8 BE | id:16`
//! - `invitation_ids` — invitation id → key in `invitations`
//! - `participants`   — `room:16 | user:16` → palette slot, `room:16` → next slot
//!
//! Big-endian timestamps in the keys make a forward prefix scan return a
//! room's records oldest first, which is exactly the history order.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{validate_parent, ChangeFeed, DurableStore, ServerClock, StoreError};
use crate::model::{
    now_millis, Comment, CommentAction, CommentChange, Invitation, InvitationStatus,
    JoinReceipt, NewComment, NewInvitation, NewOperation, NewRoom, Operation, ResourceType,
    Room, RoomId, UserId,
};
use crate::presence::CursorColor;

const CF_ROOMS: &str = "rooms";
const CF_ROOM_INDEX: &str = "room_index";
const CF_OPERATIONS: &str = "operations";
const CF_COMMENTS: &str = "comments";
const CF_COMMENT_IDS: &str = "comment_ids";
const CF_INVITATIONS: &str = "invitations";
const CF_INVITATION_IDS: &str = "invitation_ids";
const CF_PARTICIPANTS: &str = "participants";

const COLUMN_FAMILIES: &[&str] = &[
    CF_ROOMS,
    CF_ROOM_INDEX,
    CF_OPERATIONS,
    CF_COMMENTS,
    CF_COMMENT_IDS,
    CF_INVITATIONS,
    CF_INVITATION_IDS,
    CF_PARTICIPANTS,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// Per-room capacity of the comment change feed
    pub feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            feed_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            feed_capacity: 64,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

type Db = DBWithThreadMode<SingleThreaded>;

pub struct RocksStore {
    db: Db,
    config: StoreConfig,
    /// Serializes read-modify-write sections (join/leave, resolve, status).
    write_lock: Mutex<()>,
    clock: ServerClock,
    feed: ChangeFeed,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        let last_timestamp = Self::recover_last_timestamp(&db);
        log::info!(
            "Opened sync store at {} (last operation timestamp {last_timestamp})",
            config.path.display()
        );

        Ok(Self {
            db,
            feed: ChangeFeed::new(config.feed_capacity),
            config,
            write_lock: Mutex::new(()),
            clock: ServerClock::starting_after(last_timestamp),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_ROOMS | CF_ROOM_INDEX | CF_COMMENT_IDS | CF_INVITATION_IDS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    /// Highest operation timestamp on disk, so appends after a restart
    /// keep increasing.
    fn recover_last_timestamp(db: &Db) -> u64 {
        let cf = match db.cf_handle(CF_OPERATIONS) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut last = 0;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            match item {
                Ok((key, _)) if key.len() >= 24 => last = last.max(read_u64(&key[16..24])),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Stopped timestamp recovery early: {e}");
                    break;
                }
            }
        }
        last
    }

    /// Database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Forward scan of every entry whose key starts with `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn room_index_key(resource_type: &ResourceType, resource_id: &str) -> Result<Vec<u8>, StoreError> {
        encode(&(resource_type, resource_id))
    }

    /// `prefix:16 | stamp:8 BE | id:16`
    fn ordered_key(prefix: Uuid, stamp: u64, id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(prefix.as_bytes());
        key.extend_from_slice(&stamp.to_be_bytes());
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn participant_key(room_id: RoomId, user_id: UserId) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(room_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key
    }

    fn require_room(&self, room_id: RoomId) -> Result<Room, StoreError> {
        self.get(CF_ROOMS, room_id.as_bytes())?
            .ok_or_else(|| StoreError::room_not_found(room_id))
    }

    fn comment_key(&self, comment_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_COMMENT_IDS)?;
        self.db
            .get_cf(cf, comment_id.as_bytes())?
            .ok_or_else(|| StoreError::comment_not_found(comment_id))
    }

    fn load_comment(&self, comment_id: Uuid) -> Result<(Vec<u8>, Comment), StoreError> {
        let key = self.comment_key(comment_id)?;
        let comment = self
            .get(CF_COMMENTS, &key)?
            .ok_or_else(|| StoreError::comment_not_found(comment_id))?;
        Ok((key, comment))
    }

    fn load_invitation(&self, invitation_id: Uuid) -> Result<(Vec<u8>, Invitation), StoreError> {
        let cf = self.cf(CF_INVITATION_IDS)?;
        let key = self
            .db
            .get_cf(cf, invitation_id.as_bytes())?
            .ok_or_else(|| StoreError::invitation_not_found(invitation_id))?;
        let invitation = self
            .get(CF_INVITATIONS, &key)?
            .ok_or_else(|| StoreError::invitation_not_found(invitation_id))?;
        Ok((key, invitation))
    }

    fn room_comments(&self, room_id: RoomId) -> Result<Vec<Comment>, StoreError> {
        self.scan_prefix(CF_COMMENTS, room_id.as_bytes())?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    fn member_count(&self, room_id: RoomId) -> Result<u32, StoreError> {
        Ok(self
            .scan_prefix(CF_PARTICIPANTS, room_id.as_bytes())?
            .iter()
            .filter(|(key, _)| key.len() == 32)
            .count() as u32)
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn encode_operation(operation: &Operation) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(operation)?))
}

fn decode_operation(bytes: &[u8]) -> Result<Operation, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    decode(&raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn create_room(&self, new: NewRoom) -> Result<Room, StoreError> {
        let _guard = self.lock();
        let index_key = Self::room_index_key(&new.resource_type, &new.resource_id)?;
        let cf_index = self.cf(CF_ROOM_INDEX)?;
        if self.db.get_cf(cf_index, &index_key)?.is_some() {
            return Err(StoreError::Invalid(format!(
                "room already exists for {}/{}",
                new.resource_type, new.resource_id
            )));
        }

        let now = now_millis();
        let room = Room {
            id: Uuid::new_v4(),
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            name: new.name,
            created_by: new.created_by,
            is_public: new.is_public,
            max_participants: new.max_participants,
            settings: new.settings,
            created_at: now,
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ROOMS)?, room.id.as_bytes(), encode(&room)?);
        batch.put_cf(cf_index, &index_key, room.id.as_bytes());
        self.write(batch)?;
        log::debug!("Created room {} for {}/{}", room.id, room.resource_type, room.resource_id);
        Ok(room)
    }

    async fn get_room(&self, room_id: RoomId) -> Result<Room, StoreError> {
        self.require_room(room_id)
    }

    async fn find_room(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Result<Option<Room>, StoreError> {
        let index_key = Self::room_index_key(resource_type, resource_id)?;
        let cf = self.cf(CF_ROOM_INDEX)?;
        let room_id = match self.db.get_cf(cf, &index_key)? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?,
            None => return Ok(None),
        };
        self.get(CF_ROOMS, room_id.as_bytes())
    }

    async fn update_room_settings(&self, room_id: RoomId, settings: Value) -> Result<Room, StoreError> {
        let _guard = self.lock();
        let mut room = self.require_room(room_id)?;
        room.settings = settings;
        room.updated_at = now_millis();
        self.db.put_cf(self.cf(CF_ROOMS)?, room_id.as_bytes(), encode(&room)?)?;
        Ok(room)
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<(), StoreError> {
        let _guard = self.lock();
        let room = self.require_room(room_id)?;
        let prefix = room_id.as_bytes();

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_ROOMS)?, prefix);
        batch.delete_cf(
            self.cf(CF_ROOM_INDEX)?,
            Self::room_index_key(&room.resource_type, &room.resource_id)?,
        );

        let cf_ops = self.cf(CF_OPERATIONS)?;
        for (key, _) in self.scan_prefix(CF_OPERATIONS, prefix)? {
            batch.delete_cf(cf_ops, key);
        }

        let cf_comments = self.cf(CF_COMMENTS)?;
        let cf_comment_ids = self.cf(CF_COMMENT_IDS)?;
        for (key, value) in self.scan_prefix(CF_COMMENTS, prefix)? {
            let comment: Comment = decode(&value)?;
            batch.delete_cf(cf_comments, key);
            batch.delete_cf(cf_comment_ids, comment.id.as_bytes());
        }

        let cf_invitations = self.cf(CF_INVITATIONS)?;
        let cf_invitation_ids = self.cf(CF_INVITATION_IDS)?;
        for (key, value) in self.scan_prefix(CF_INVITATIONS, prefix)? {
            let invitation: Invitation = decode(&value)?;
            batch.delete_cf(cf_invitations, key);
            batch.delete_cf(cf_invitation_ids, invitation.id.as_bytes());
        }

        let cf_participants = self.cf(CF_PARTICIPANTS)?;
        for (key, _) in self.scan_prefix(CF_PARTICIPANTS, prefix)? {
            batch.delete_cf(cf_participants, key);
        }

        self.write(batch)?;
        self.feed.close(room_id);
        log::info!("Deleted room {room_id}");
        Ok(())
    }

    async fn join_room(&self, room_id: RoomId, user_id: UserId) -> Result<JoinReceipt, StoreError> {
        let _guard = self.lock();
        let room = self.require_room(room_id)?;
        let cf = self.cf(CF_PARTICIPANTS)?;
        let member_key = Self::participant_key(room_id, user_id);

        if let Some(bytes) = self.db.get_cf(cf, &member_key)? {
            return Ok(JoinReceipt {
                participant_count: self.member_count(room_id)?,
                color: CursorColor::assign(read_u64(&bytes) as usize, user_id),
            });
        }

        let count = self.member_count(room_id)?;
        if count >= room.max_participants {
            return Err(StoreError::Invalid(format!(
                "room {room_id} is full ({})",
                room.max_participants
            )));
        }

        let slot = self
            .db
            .get_cf(cf, room_id.as_bytes())?
            .map_or(0, |bytes| read_u64(&bytes));

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &member_key, slot.to_be_bytes());
        batch.put_cf(cf, room_id.as_bytes(), (slot + 1).to_be_bytes());
        self.write(batch)?;

        Ok(JoinReceipt {
            participant_count: count + 1,
            color: CursorColor::assign(slot as usize, user_id),
        })
    }

    async fn leave_room(&self, room_id: RoomId, user_id: UserId) -> Result<u32, StoreError> {
        let _guard = self.lock();
        self.require_room(room_id)?;
        self.db
            .delete_cf(self.cf(CF_PARTICIPANTS)?, Self::participant_key(room_id, user_id))?;
        self.member_count(room_id)
    }

    async fn append_operation(&self, new: NewOperation) -> Result<Operation, StoreError> {
        // Timestamp and write under one lock, so a reader that sees ts N
        // has already been able to see every ts below it
        let _guard = self.lock();
        self.require_room(new.room_id)?;
        let operation = Operation::from_new(new, Uuid::new_v4(), self.clock.next());
        let key = Self::ordered_key(operation.room_id, operation.timestamp, operation.id);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(self.cf(CF_OPERATIONS)?, key, encode_operation(&operation)?, &write_opts)?;
        log::trace!("Appended operation {} at {}", operation.id, operation.timestamp);
        Ok(operation)
    }

    async fn operations_since(
        &self,
        room_id: RoomId,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError> {
        self.require_room(room_id)?;
        let cf = self.cf(CF_OPERATIONS)?;
        let start = match since {
            Some(ts) => Self::ordered_key(room_id, ts.saturating_add(1), Uuid::nil()),
            None => room_id.as_bytes().to_vec(),
        };

        let mut operations = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            if operations.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != room_id.as_bytes() {
                break;
            }
            operations.push(decode_operation(&value)?);
        }
        Ok(operations)
    }

    async fn insert_comment(&self, new: NewComment) -> Result<Comment, StoreError> {
        let comment = {
            let _guard = self.lock();
            self.require_room(new.room_id)?;
            if let Some(parent_id) = new.parent_id {
                let (_, parent) = self.load_comment(parent_id)?;
                validate_parent(&parent, new.room_id)?;
            }

            let now = self.clock.next();
            let comment = Comment {
                id: Uuid::new_v4(),
                room_id: new.room_id,
                author_id: new.author.user_id,
                author: new.author,
                content: new.content,
                position_data: new.position_data,
                parent_id: new.parent_id,
                resolved: false,
                created_at: now,
                updated_at: now,
            };
            let key = Self::ordered_key(comment.room_id, comment.created_at, comment.id);

            let mut batch = WriteBatch::default();
            batch.put_cf(self.cf(CF_COMMENTS)?, &key, encode(&comment)?);
            batch.put_cf(self.cf(CF_COMMENT_IDS)?, comment.id.as_bytes(), &key);
            self.write(batch)?;
            comment
        };

        self.feed.publish(
            comment.room_id,
            CommentChange {
                comment: comment.clone(),
                action: CommentAction::Created,
            },
        );
        Ok(comment)
    }

    async fn get_comment(&self, comment_id: Uuid) -> Result<Comment, StoreError> {
        self.load_comment(comment_id).map(|(_, comment)| comment)
    }

    async fn top_level_comments(&self, room_id: RoomId) -> Result<Vec<Comment>, StoreError> {
        let mut comments = self.room_comments(room_id)?;
        comments.retain(Comment::is_top_level);
        Ok(comments)
    }

    async fn replies(&self, parent_id: Uuid) -> Result<Vec<Comment>, StoreError> {
        let (_, parent) = self.load_comment(parent_id)?;
        let mut comments = self.room_comments(parent.room_id)?;
        comments.retain(|c| c.parent_id == Some(parent_id));
        Ok(comments)
    }

    async fn set_comment_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<Comment, StoreError> {
        let updated = {
            let _guard = self.lock();
            let (key, mut comment) = self.load_comment(comment_id)?;
            if comment.resolved == resolved {
                return Ok(comment);
            }
            comment.resolved = resolved;
            comment.updated_at = now_millis();
            self.db.put_cf(self.cf(CF_COMMENTS)?, &key, encode(&comment)?)?;
            comment
        };

        self.feed.publish(
            updated.room_id,
            CommentChange {
                comment: updated.clone(),
                action: CommentAction::Updated,
            },
        );
        Ok(updated)
    }

    fn comment_changes(&self, room_id: RoomId) -> broadcast::Receiver<CommentChange> {
        self.feed.subscribe(room_id)
    }

    async fn create_invitation(&self, new: NewInvitation) -> Result<Invitation, StoreError> {
        let _guard = self.lock();
        self.require_room(new.room_id)?;
        let invitation = Invitation {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            inviter_id: new.inviter_id,
            invitee: new.invitee,
            permission_level: new.permission_level,
            status: InvitationStatus::Pending,
            created_at: self.clock.next(),
            expires_at: new.expires_at,
        };
        let key = Self::ordered_key(invitation.room_id, invitation.created_at, invitation.id);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_INVITATIONS)?, &key, encode(&invitation)?);
        batch.put_cf(self.cf(CF_INVITATION_IDS)?, invitation.id.as_bytes(), &key);
        self.write(batch)?;
        Ok(invitation)
    }

    async fn get_invitation(&self, invitation_id: Uuid) -> Result<Invitation, StoreError> {
        self.load_invitation(invitation_id).map(|(_, invitation)| invitation)
    }

    async fn invitations(&self, room_id: RoomId) -> Result<Vec<Invitation>, StoreError> {
        self.scan_prefix(CF_INVITATIONS, room_id.as_bytes())?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    async fn set_invitation_status(
        &self,
        invitation_id: Uuid,
        status: InvitationStatus,
    ) -> Result<Invitation, StoreError> {
        let _guard = self.lock();
        let (key, mut invitation) = self.load_invitation(invitation_id)?;
        invitation.status = status;
        self.db.put_cf(self.cf(CF_INVITATIONS)?, &key, encode(&invitation)?)?;
        Ok(invitation)
    }
}
