//! Room registry.
//!
//! Maps room names to their radios. Each room owns one log file in the
//! configured data directory, named by the signature it was created with.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::RadioConfig;
use crate::radio::{BroadcastRadio, RadioError};
use crate::signature::derive_signature;

/// Manages multiple rooms (one radio per room).
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastRadio>>>>,
    config: RadioConfig,
}

impl RoomManager {
    pub fn new(config: RadioConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get or create the radio for `name`.
    ///
    /// A new room gets a fresh signature seeded from its name.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<BroadcastRadio>, RadioError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }

        let room = BroadcastRadio::open(self.config.clone(), derive_signature(name))?;
        log::info!("Created room {name} ({})", room.storage_key());
        rooms.insert(name.to_string(), room.clone());
        Ok(room)
    }

    /// Reopen a room from the storage key it was created with.
    ///
    /// An already-open room of that name is returned as is.
    pub async fn restore(&self, name: &str, storage_key: &str) -> Result<Arc<BroadcastRadio>, RadioError> {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }

        let room = BroadcastRadio::open(self.config.clone(), storage_key)?;
        log::info!("Restored room {name} with {} bytes", room.whole_size());
        rooms.insert(name.to_string(), room.clone());
        Ok(room)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<BroadcastRadio>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Close a room, optionally deleting its log file.
    ///
    /// Returns `false` if no such room was open.
    pub async fn close_room(&self, name: &str, remove_file: bool) -> Result<bool, RadioError> {
        let Some(room) = self.rooms.write().await.remove(name) else {
            return Ok(false);
        };

        if remove_file {
            room.remove()?;
        } else {
            room.close()?;
        }
        log::info!("Closed room {name}");
        Ok(true)
    }

    /// Close a room that has no subscribers left. Its log file is kept.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            if room.subscriber_count() == 0 {
                if let Some(room) = rooms.remove(name) {
                    if let Err(e) = room.close() {
                        log::error!("Closing empty room {name} failed: {e}");
                    }
                }
                return true;
            }
        }
        false
    }

    /// Get the number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Get all active room names.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Close every room, keeping their files.
    pub async fn close_all(&self) {
        let rooms: Vec<_> = self.rooms.write().await.drain().collect();
        for (name, room) in rooms {
            if let Err(e) = room.close() {
                log::error!("Closing room {name} failed: {e}");
            }
        }
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }
}
