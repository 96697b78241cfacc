//! Validated CRUD over the persisted collections.
//!
//! Each collection lives under one key as a JSON array (the default item is
//! a single object).  Loads validate every record and report how many were
//! dropped; writes validate first, serialise the whole collection, then do a
//! single `set`, so a rejected write leaves the stored value untouched.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::{StoreError, ValidationError};
use crate::kv::KvStore;
use crate::media_ref::MediaRef;
use crate::records::{
    validate_playlist_name, DefaultItem, DefaultItemDraft, LoopConfig, LoopConfigDraft,
    MediaMetadata, PlaylistEntry, RecentItem, RecentItemDraft, SavedPlaylist, SavedPlaylistDraft,
    MAX_LOOP_CONFIGS, MAX_PLAYLISTS, MAX_PLAYLIST_ENTRIES, MAX_RECENT_ITEMS,
};

pub const KEY_RECENT_ITEMS: &str = "recentItems";
pub const KEY_DEFAULT_ITEM: &str = "defaultItem";
pub const KEY_LOOP_CONFIGS: &str = "loopConfigs";
pub const KEY_PLAYLISTS: &str = "playlists";
pub const KEY_WORKING_PLAYLIST: &str = "workingPlaylist";

/// Result of loading a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Loaded<T> {
    pub records: Vec<T>,
    /// Records (and, for playlists, entries) that failed validation or
    /// repeated an earlier record's key.
    pub dropped: usize,
    /// The stored value was not an array at all and was treated as empty.
    pub reset: bool,
}

impl<T> Default for Loaded<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            dropped: 0,
            reset: false,
        }
    }
}

/// Whether `update_playlist` modified an existing playlist or created one.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistSave {
    Created(SavedPlaylist),
    Updated(SavedPlaylist),
}

impl PlaylistSave {
    pub fn playlist(&self) -> &SavedPlaylist {
        match self {
            PlaylistSave::Created(p) | PlaylistSave::Updated(p) => p,
        }
    }
}

pub struct PersistenceStore<K: KvStore> {
    kv: K,
    recent_cap: usize,
}

impl<K: KvStore> PersistenceStore<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            recent_cap: MAX_RECENT_ITEMS,
        }
    }

    pub fn with_recent_cap(mut self, cap: usize) -> Self {
        self.recent_cap = cap.max(1);
        self
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    // ── Recent items ─────────────────────────────────────────────────────────

    /// Record a use of `draft.media_ref`, moving it to the front.
    pub fn save_recent(&mut self, draft: RecentItemDraft) -> Result<Vec<RecentItem>, StoreError> {
        let item = draft.validate()?;
        let mut items = self.load_recent().records;
        items.retain(|r| r.media_ref != item.media_ref);
        items.insert(0, item);
        items.truncate(self.recent_cap);
        self.write(KEY_RECENT_ITEMS, &items)?;
        Ok(items)
    }

    pub fn load_recent(&self) -> Loaded<RecentItem> {
        let mut loaded = self.load_array(KEY_RECENT_ITEMS, RecentItemDraft::validate);
        let mut seen = HashSet::new();
        let before = loaded.records.len();
        loaded.records.retain(|r| seen.insert(r.media_ref.clone()));
        loaded.dropped += before - loaded.records.len();
        loaded.records.truncate(self.recent_cap);
        loaded
    }

    pub fn delete_recent(&mut self, media: &MediaRef) -> Result<Vec<RecentItem>, StoreError> {
        let mut items = self.load_recent().records;
        items.retain(|r| &r.media_ref != media);
        self.write(KEY_RECENT_ITEMS, &items)?;
        Ok(items)
    }

    /// Fill in looked-up metadata for an existing recent item.  Returns
    /// `false` when the item is no longer in the list.
    pub fn refresh_recent(
        &mut self,
        media: &MediaRef,
        meta: &MediaMetadata,
    ) -> Result<bool, StoreError> {
        let mut items = self.load_recent().records;
        let Some(item) = items.iter_mut().find(|r| &r.media_ref == media) else {
            return Ok(false);
        };
        let refreshed = RecentItemDraft {
            title: Some(meta.title.clone()),
            author: Some(meta.author.clone()),
            thumbnail_url: Some(meta.thumbnail_url.clone()),
            ..RecentItemDraft::from(item.clone())
        }
        .validate()?;
        *item = refreshed;
        self.write(KEY_RECENT_ITEMS, &items)?;
        Ok(true)
    }

    // ── Default item ─────────────────────────────────────────────────────────

    pub fn save_default(&mut self, draft: DefaultItemDraft) -> Result<DefaultItem, StoreError> {
        let item = draft.validate()?;
        let json = serde_json::to_string(&item)?;
        self.kv.set(KEY_DEFAULT_ITEM, &json)?;
        Ok(item)
    }

    /// Load the default item.  A stored value that fails validation is
    /// removed so it is not reported again on every start.
    pub fn load_default(&mut self) -> Option<DefaultItem> {
        let raw = match self.kv.get(KEY_DEFAULT_ITEM) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("PersistenceStore: failed to read default item: {}", e);
                return None;
            }
        };
        let parsed = serde_json::from_str::<DefaultItemDraft>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|d| d.validate().map_err(|e| e.to_string()));
        match parsed {
            Ok(item) => Some(item),
            Err(reason) => {
                warn!("PersistenceStore: clearing invalid default item: {}", reason);
                if let Err(e) = self.kv.remove(KEY_DEFAULT_ITEM) {
                    warn!("PersistenceStore: failed to clear default item: {}", e);
                }
                None
            }
        }
    }

    pub fn clear_default(&mut self) -> Result<(), StoreError> {
        self.kv.remove(KEY_DEFAULT_ITEM)?;
        Ok(())
    }

    /// Fill in looked-up metadata when the default item refers to `media`.
    pub fn refresh_default(
        &mut self,
        media: &MediaRef,
        meta: &MediaMetadata,
    ) -> Result<bool, StoreError> {
        let Some(item) = self.load_default() else {
            return Ok(false);
        };
        if &item.media_ref != media {
            return Ok(false);
        }
        self.save_default(DefaultItemDraft {
            title: Some(meta.title.clone()),
            author: Some(meta.author.clone()),
            thumbnail_url: Some(meta.thumbnail_url.clone()),
            ..DefaultItemDraft::from(item)
        })?;
        Ok(true)
    }

    // ── Loop configurations ──────────────────────────────────────────────────

    /// Save a loop configuration.  Re-saving the same media with the same
    /// bounds updates that slot in place (keeping its id and creation time);
    /// anything else is inserted at the front.
    pub fn save_loop_config(&mut self, draft: LoopConfigDraft) -> Result<LoopConfig, StoreError> {
        let mut config = draft.validate()?;
        let mut configs = self.load_loop_configs().records;

        if let Some(existing) = configs.iter_mut().find(|c| {
            c.media_ref == config.media_ref
                && c.start_time == config.start_time
                && c.end_time == config.end_time
        }) {
            config.id = existing.id.clone();
            config.created_at = existing.created_at;
            *existing = config.clone();
            debug!("PersistenceStore: updated loop config {}", config.id);
        } else {
            configs.insert(0, config.clone());
            configs.truncate(MAX_LOOP_CONFIGS);
            debug!("PersistenceStore: saved loop config {}", config.id);
        }

        self.write(KEY_LOOP_CONFIGS, &configs)?;
        Ok(config)
    }

    pub fn load_loop_configs(&self) -> Loaded<LoopConfig> {
        let mut loaded = self.load_array(KEY_LOOP_CONFIGS, LoopConfigDraft::validate);
        let mut seen = HashSet::new();
        let before = loaded.records.len();
        loaded.records.retain(|c| seen.insert(c.id.clone()));
        loaded.dropped += before - loaded.records.len();
        loaded.records.truncate(MAX_LOOP_CONFIGS);
        loaded
    }

    pub fn find_loop_config(&self, id: &str) -> Option<LoopConfig> {
        self.load_loop_configs()
            .records
            .into_iter()
            .find(|c| c.id == id)
    }

    pub fn delete_loop_config(&mut self, id: &str) -> Result<Vec<LoopConfig>, StoreError> {
        let mut configs = self.load_loop_configs().records;
        let before = configs.len();
        configs.retain(|c| c.id != id);
        if configs.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.write(KEY_LOOP_CONFIGS, &configs)?;
        Ok(configs)
    }

    // ── Playlists ────────────────────────────────────────────────────────────

    /// Save a new playlist.  Names are unique case-insensitively.
    pub fn save_playlist(
        &mut self,
        name: &str,
        entries: &[PlaylistEntry],
    ) -> Result<SavedPlaylist, StoreError> {
        let name = validate_playlist_name(name)?;
        let entries = revalidate_entries(entries)?;
        let mut playlists = self.load_playlists().records;

        if playlists.iter().any(|p| same_name(&p.name, &name)) {
            return Err(StoreError::DuplicateName(name));
        }

        let playlist = SavedPlaylistDraft {
            name: Some(name),
            ..SavedPlaylistDraft::default()
        }
        .validate()
        .map(|(mut p, _)| {
            p.entries = entries;
            p
        })?;

        playlists.insert(0, playlist.clone());
        playlists.truncate(MAX_PLAYLISTS);
        self.write(KEY_PLAYLISTS, &playlists)?;
        debug!(
            "PersistenceStore: saved playlist {} ({} entries)",
            playlist.id,
            playlist.entries.len()
        );
        Ok(playlist)
    }

    /// Overwrite the playlist `id` in place when it still exists under the
    /// same name (case-insensitive).  Otherwise save a new playlist, which
    /// fails with `DuplicateName` if another playlist already has the name.
    pub fn update_playlist(
        &mut self,
        id: &str,
        name: &str,
        entries: &[PlaylistEntry],
    ) -> Result<PlaylistSave, StoreError> {
        let clean_name = validate_playlist_name(name)?;
        let mut playlists = self.load_playlists().records;

        let Some(existing) = playlists
            .iter_mut()
            .find(|p| p.id == id && same_name(&p.name, &clean_name))
        else {
            return self.save_playlist(name, entries).map(PlaylistSave::Created);
        };

        existing.name = clean_name;
        existing.entries = revalidate_entries(entries)?;
        existing.updated_at = Some(chrono::Utc::now());
        let updated = existing.clone();

        self.write(KEY_PLAYLISTS, &playlists)?;
        debug!("PersistenceStore: updated playlist {}", updated.id);
        Ok(PlaylistSave::Updated(updated))
    }

    pub fn load_playlists(&self) -> Loaded<SavedPlaylist> {
        let (raw, reset) = self.read_array(KEY_PLAYLISTS);
        let total = raw.len();
        let mut dropped_entries = 0;
        let mut ids = HashSet::new();
        let mut names = HashSet::new();

        let records: Vec<SavedPlaylist> = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value::<SavedPlaylistDraft>(v).ok())
            .filter_map(|d| d.validate().ok())
            .filter_map(|(p, dropped)| {
                dropped_entries += dropped;
                (ids.insert(p.id.clone()) && names.insert(p.name.to_lowercase())).then_some(p)
            })
            .collect();

        let dropped = total - records.len() + dropped_entries;
        if dropped > 0 {
            warn!(
                "PersistenceStore: dropped {} invalid playlist record(s) from {}",
                dropped, KEY_PLAYLISTS
            );
        }

        let mut records = records;
        records.truncate(MAX_PLAYLISTS);
        Loaded {
            records,
            dropped,
            reset,
        }
    }

    pub fn find_playlist(&self, id: &str) -> Option<SavedPlaylist> {
        self.load_playlists().records.into_iter().find(|p| p.id == id)
    }

    pub fn delete_playlist(&mut self, id: &str) -> Result<Vec<SavedPlaylist>, StoreError> {
        let mut playlists = self.load_playlists().records;
        let before = playlists.len();
        playlists.retain(|p| p.id != id);
        if playlists.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.write(KEY_PLAYLISTS, &playlists)?;
        Ok(playlists)
    }

    // ── Working playlist ─────────────────────────────────────────────────────

    pub fn save_working_playlist(&mut self, entries: &[PlaylistEntry]) -> Result<(), StoreError> {
        let entries = revalidate_entries(entries)?;
        self.write(KEY_WORKING_PLAYLIST, &entries)
    }

    pub fn load_working_playlist(&self) -> Loaded<PlaylistEntry> {
        let mut loaded = self.load_array(KEY_WORKING_PLAYLIST, LoopConfigDraft::validate);
        loaded.records.truncate(MAX_PLAYLIST_ENTRIES);
        loaded
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Read `key` as a JSON array.  A missing key is empty; a value that is
    /// not an array is reported as a reset.
    fn read_array(&self, key: &str) -> (Vec<serde_json::Value>, bool) {
        let raw = match self.kv.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return (Vec::new(), false),
            Err(e) => {
                warn!("PersistenceStore: failed to read {}: {}", key, e);
                return (Vec::new(), true);
            }
        };
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Array(values)) => (values, false),
            _ => {
                warn!("PersistenceStore: {} is not a JSON array, treating as empty", key);
                (Vec::new(), true)
            }
        }
    }

    fn load_array<D, T>(
        &self,
        key: &str,
        validate: impl Fn(D) -> Result<T, ValidationError>,
    ) -> Loaded<T>
    where
        D: DeserializeOwned,
    {
        let (raw, reset) = self.read_array(key);
        let total = raw.len();
        let records: Vec<T> = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value::<D>(v).ok())
            .filter_map(|d| validate(d).ok())
            .collect();
        let dropped = total - records.len();
        if dropped > 0 {
            warn!(
                "PersistenceStore: dropped {} invalid record(s) from {}",
                dropped, key
            );
        }
        Loaded {
            records,
            dropped,
            reset,
        }
    }

    fn write<T: Serialize>(&mut self, key: &str, records: &[T]) -> Result<(), StoreError> {
        let json = serde_json::to_string(records)?;
        self.kv.set(key, &json)?;
        Ok(())
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn revalidate_entries(entries: &[PlaylistEntry]) -> Result<Vec<PlaylistEntry>, StoreError> {
    if entries.len() > MAX_PLAYLIST_ENTRIES {
        return Err(ValidationError::TooManyEntries {
            max: MAX_PLAYLIST_ENTRIES,
        }
        .into());
    }
    entries
        .iter()
        .map(|e| LoopConfigDraft::from(e.clone()).validate().map_err(StoreError::from))
        .collect()
}
