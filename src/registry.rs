// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide named set of transfer entities plus the reverse lookup from
// the opaque pointer handed to C callers. One mutex serializes both maps;
// entity construction (which does I/O) runs outside it behind a pending-name
// reservation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{error, info};

use crate::entity::TransferEntity;
use crate::error::{ErrCode, Result};
use crate::helper::TransConfig;

#[derive(Default)]
struct Maps {
    by_name: HashMap<String, Arc<TransferEntity>>,
    by_ptr: HashMap<usize, String>,
    pending: HashSet<String>,
}

pub struct EntityManager {
    maps: Mutex<Maps>,
}

impl EntityManager {
    pub fn instance() -> &'static EntityManager {
        static INSTANCE: OnceLock<EntityManager> = OnceLock::new();
        INSTANCE.get_or_init(|| EntityManager {
            maps: Mutex::new(Maps::default()),
        })
    }

    /// Create an entity under `name`, deduplicating by name. Returns the
    /// opaque pointer value used as the C handle.
    pub fn create_entity(
        &self,
        name: &str,
        store_url: &str,
        config: TransConfig,
    ) -> Result<Arc<TransferEntity>> {
        {
            let mut maps = self.maps.lock().unwrap();
            if maps.by_name.contains_key(name) || maps.pending.contains(name) {
                error!(name, "entity already exists");
                return Err(ErrCode::RepeatCall);
            }
            maps.pending.insert(name.to_string());
        }

        let created = TransferEntity::create(name, store_url, config);

        let mut maps = self.maps.lock().unwrap();
        maps.pending.remove(name);
        match created {
            Ok(entity) => {
                let ptr = Arc::as_ptr(&entity) as usize;
                maps.by_name.insert(name.to_string(), Arc::clone(&entity));
                maps.by_ptr.insert(ptr, name.to_string());
                Ok(entity)
            }
            Err(e) => {
                error!(name, "entity creation failed: {e}");
                Err(e)
            }
        }
    }

    pub fn handle_of(&self, entity: &Arc<TransferEntity>) -> usize {
        Arc::as_ptr(entity) as usize
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<TransferEntity>> {
        let maps = self.maps.lock().unwrap();
        maps.by_name
            .get(name)
            .cloned()
            .ok_or(ErrCode::ObjectNotExists)
    }

    pub fn get_by_ptr(&self, ptr: usize) -> Result<Arc<TransferEntity>> {
        let maps = self.maps.lock().unwrap();
        let name = maps.by_ptr.get(&ptr).ok_or(ErrCode::ObjectNotExists)?;
        maps.by_name
            .get(name)
            .cloned()
            .ok_or(ErrCode::ObjectNotExists)
    }

    /// Remove by handle; the entity is shut down outside the registry lock.
    pub fn remove_by_ptr(&self, ptr: usize) -> Result<()> {
        let entity = {
            let mut maps = self.maps.lock().unwrap();
            let Some(name) = maps.by_ptr.remove(&ptr) else {
                return Err(ErrCode::ObjectNotExists);
            };
            maps.by_name.remove(&name)
        };
        if let Some(entity) = entity {
            info!(name = entity.name(), "entity removed");
            entity.shutdown();
        }
        Ok(())
    }

    pub fn remove_by_name(&self, name: &str) -> Result<()> {
        let entity = {
            let mut maps = self.maps.lock().unwrap();
            let Some(entity) = maps.by_name.remove(name) else {
                return Err(ErrCode::ObjectNotExists);
            };
            maps.by_ptr.remove(&(Arc::as_ptr(&entity) as usize));
            entity
        };
        entity.shutdown();
        Ok(())
    }

    /// Tear every entity down (library uninit).
    pub fn remove_all(&self) {
        let drained: Vec<Arc<TransferEntity>> = {
            let mut maps = self.maps.lock().unwrap();
            maps.by_ptr.clear();
            maps.by_name.drain().map(|(_, e)| e).collect()
        };
        for entity in drained {
            entity.shutdown();
        }
    }
}
