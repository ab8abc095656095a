//! RocksDB-backed map store.
//!
//! Column families:
//! - `rooms`    : room rows, keyed by `room_id`
//! - `members`  : member rows, keyed by `room_id ++ user_id`
//! - `units`    : unit rows, keyed by `room_id ++ unit_id`
//! - `drawings` : drawing rows, keyed by `room_id ++ drawing_id`
//!
//! Values are bincode-encoded and LZ4-compressed. Every per-room column
//! family uses a fixed 16-byte prefix extractor so room scans stay on one
//! prefix.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use battlemap_core::{Drawing, EchelonIndex, Room, RoomMember, Unit, UserId};

use super::{MapStore, StoreError};

const CF_ROOMS: &str = "rooms";
const CF_MEMBERS: &str = "members";
const CF_UNITS: &str = "units";
const CF_DRAWINGS: &str = "drawings";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_MEMBERS, CF_UNITS, CF_DRAWINGS];

/// Column families whose keys start with the owning room id.
const ROOM_SCOPED: &[&str] = &[CF_MEMBERS, CF_UNITS, CF_DRAWINGS];

/// RocksDB tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("battlemap_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
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
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
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

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened map store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        if name == CF_ROOMS {
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        } else {
            opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush every column family's memtable to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        self.db
            .put_cf_opt(&cf, key, encode(value)?, &self.write_options())?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn take<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let existing = self.get(cf_name, key)?;
        if existing.is_some() {
            let cf = self.cf(cf_name)?;
            self.db.delete_cf_opt(&cf, key, &self.write_options())?;
        }
        Ok(existing)
    }

    /// All `(key, value)` pairs whose key starts with `room_id`.
    fn scan_room(&self, cf_name: &str, room_id: Uuid) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = room_id.as_bytes();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix[..], rocksdb::Direction::Forward),
        );

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    fn scan_decoded<T: DeserializeOwned>(&self, cf_name: &str, room_id: Uuid) -> Result<Vec<T>, StoreError> {
        self.scan_room(cf_name, room_id)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }
}

fn pair_key(room_id: Uuid, id: Uuid) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(room_id.as_bytes());
    key[16..].copy_from_slice(id.as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl MapStore for RocksStore {
    fn get_room(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        self.get(CF_ROOMS, id.as_bytes())
    }

    fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        self.put(CF_ROOMS, room.id.as_bytes(), room)
    }

    fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(decode::<Room>(&value)?);
        }
        rooms.sort_by_key(|r| (r.created_at, r.id));
        Ok(rooms)
    }

    fn delete_room(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        let existing: Option<Room> = self.get(CF_ROOMS, id.as_bytes())?;

        // One batch for the room row and every row scoped to it.
        let mut batch = WriteBatch::default();
        let cf_rooms = self.cf(CF_ROOMS)?;
        batch.delete_cf(&cf_rooms, id.as_bytes());
        for name in ROOM_SCOPED {
            let cf = self.cf(name)?;
            for (key, _) in self.scan_room(name, id)? {
                batch.delete_cf(&cf, &key);
            }
        }
        self.db.write_opt(batch, &self.write_options())?;

        if existing.is_some() {
            log::info!("Deleted room {id} and its rows from the map store");
        }
        Ok(existing)
    }

    fn upsert_member(&self, member: &RoomMember) -> Result<(), StoreError> {
        self.put(
            CF_MEMBERS,
            &pair_key(member.room_id, member.user_id),
            member,
        )
    }

    fn remove_member(
        &self,
        room_id: Uuid,
        user_id: UserId,
    ) -> Result<Option<RoomMember>, StoreError> {
        self.take(CF_MEMBERS, &pair_key(room_id, user_id))
    }

    fn list_members(&self, room_id: Uuid) -> Result<Vec<RoomMember>, StoreError> {
        let mut members: Vec<RoomMember> = self.scan_decoded(CF_MEMBERS, room_id)?;
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        Ok(members)
    }

    fn put_unit(&self, unit: &Unit) -> Result<(), StoreError> {
        self.put(CF_UNITS, &pair_key(unit.room_id, unit.id), unit)
    }

    fn get_unit(&self, room_id: Uuid, id: Uuid) -> Result<Option<Unit>, StoreError> {
        self.get(CF_UNITS, &pair_key(room_id, id))
    }

    fn remove_unit(&self, room_id: Uuid, id: Uuid) -> Result<Option<Unit>, StoreError> {
        self.take(CF_UNITS, &pair_key(room_id, id))
    }

    fn list_units(&self, room_id: Uuid, echelon: EchelonIndex) -> Result<Vec<Unit>, StoreError> {
        let mut units: Vec<Unit> = self.scan_decoded(CF_UNITS, room_id)?;
        units.retain(|u| u.echelon == echelon);
        units.sort_by_key(|u| (u.z_order, u.updated_at, u.id));
        Ok(units)
    }

    fn put_drawing(&self, drawing: &Drawing) -> Result<(), StoreError> {
        self.put(CF_DRAWINGS, &pair_key(drawing.room_id, drawing.id), drawing)
    }

    fn get_drawing(&self, room_id: Uuid, id: Uuid) -> Result<Option<Drawing>, StoreError> {
        self.get(CF_DRAWINGS, &pair_key(room_id, id))
    }

    fn remove_drawing(&self, room_id: Uuid, id: Uuid) -> Result<Option<Drawing>, StoreError> {
        self.take(CF_DRAWINGS, &pair_key(room_id, id))
    }

    fn list_drawings(
        &self,
        room_id: Uuid,
        echelon: EchelonIndex,
    ) -> Result<Vec<Drawing>, StoreError> {
        let mut drawings: Vec<Drawing> = self.scan_decoded(CF_DRAWINGS, room_id)?;
        drawings.retain(|d| d.echelon == echelon);
        drawings.sort_by_key(|d| (d.updated_at, d.id));
        Ok(drawings)
    }
}
