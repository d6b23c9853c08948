//! Loaded-network registry
//!
//! A fixed arena of `MAX_LOADED_NETWORK` slots with a free-list. Slots are
//! addressed by [`SlotRef`], which carries the generation of the occupant it
//! was issued for; a reference that outlives its network stops resolving
//! once the slot is reused.

use crate::config::MAX_LOADED_NETWORK;
use crate::power::PowerVote;
use crate::protocol::BufferSpan;
use thiserror::Error;

/// Firmware handle value before load completes
pub const INVALID_FIRMWARE_HANDLE: u32 = u32::MAX;

/// Where a network is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Slot reserved, load command outstanding
    Loading,
    /// Firmware acknowledged the load
    Loaded,
    /// Unload command outstanding
    Unloading,
    /// Unload timed out; firmware may still hold the network
    Stale,
}

/// One loaded network image
#[derive(Debug)]
pub struct NpuNetwork {
    /// Host-chosen id
    pub id: u64,
    /// Buffer handle holding the image
    pub buffer_handle: i32,
    /// Device address of the image
    pub physical_address: u64,
    /// Image size in bytes
    pub size: u32,
    /// Size of the first block the firmware fetches
    pub first_block_size: u32,
    /// Coprocessor handle, `INVALID_FIRMWARE_HANDLE` until loaded
    pub firmware_handle: u32,
    /// Transaction of the latest command against this network
    pub transaction_id: u32,
    /// Lifecycle state
    pub state: NetworkState,
    /// Exec commands currently outstanding against this network
    pub active_execs: u32,
    resident_vote: Option<PowerVote>,
}

impl NpuNetwork {
    /// New entry in `Loading` state
    pub fn new(id: u64, image: BufferSpan, first_block_size: u32) -> Self {
        Self {
            id,
            buffer_handle: image.handle,
            physical_address: image.physical_address,
            size: image.size,
            first_block_size,
            firmware_handle: INVALID_FIRMWARE_HANDLE,
            transaction_id: 0,
            state: NetworkState::Loading,
            active_execs: 0,
            resident_vote: None,
        }
    }

    /// Image location as sent to firmware
    pub const fn image(&self) -> BufferSpan {
        BufferSpan {
            handle: self.buffer_handle,
            physical_address: self.physical_address,
            size: self.size,
        }
    }

    /// Park a power vote on this network; it is released when the entry drops
    pub fn hold_vote(&mut self, vote: PowerVote) {
        self.resident_vote = Some(vote);
    }

    /// Whether an exec is outstanding; unload must wait for it
    pub const fn is_executing(&self) -> bool {
        self.active_execs > 0
    }

    /// Whether this network keeps the power domain up
    pub const fn holds_vote(&self) -> bool {
        self.resident_vote.is_some()
    }
}

/// Generation-checked slot address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    index: usize,
    generation: u32,
}

impl SlotRef {
    /// Slot index
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Generation of the occupant this reference was issued for
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// Table operation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    /// All slots in use
    #[error("network table full")]
    TableFull,
    /// Id already live
    #[error("network {0} already present")]
    DuplicateId(u64),
}

/// No live network with the given id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("network {0} not found")]
pub struct NetworkNotFound(pub u64);

#[derive(Debug)]
struct Slot {
    generation: u32,
    network: Option<NpuNetwork>,
}

/// Fixed-capacity registry of loaded networks
#[derive(Debug)]
pub struct NetworkTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Default for NetworkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkTable {
    /// Table with `MAX_LOADED_NETWORK` slots
    pub fn new() -> Self {
        Self::with_capacity(MAX_LOADED_NETWORK)
    }

    /// Table with `capacity` slots
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                network: None,
            })
            .collect();
        // Pop from the back so slot 0 is handed out first
        let free = (0..capacity).rev().collect();
        Self { slots, free }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether no entries are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a slot for `network`
    ///
    /// # Errors
    ///
    /// `TableFull` if every slot is live, `DuplicateId` if the id is live.
    pub fn insert(&mut self, network: NpuNetwork) -> Result<SlotRef, TableError> {
        if self.find(network.id).is_some() {
            return Err(TableError::DuplicateId(network.id));
        }
        let index = self.free.pop().ok_or(TableError::TableFull)?;
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.network = Some(network);
        Ok(SlotRef {
            index,
            generation: slot.generation,
        })
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.network.as_ref().is_some_and(|n| n.id == id))
    }

    /// Live network with `id`
    pub fn find(&self, id: u64) -> Option<&NpuNetwork> {
        self.position(id)
            .and_then(|i| self.slots[i].network.as_ref())
    }

    /// Live network with `id`, mutably
    pub fn find_mut(&mut self, id: u64) -> Option<&mut NpuNetwork> {
        let i = self.position(id)?;
        self.slots[i].network.as_mut()
    }

    /// Slot reference for the live network with `id`
    pub fn slot_of(&self, id: u64) -> Option<SlotRef> {
        self.position(id).map(|index| SlotRef {
            index,
            generation: self.slots[index].generation,
        })
    }

    /// Occupant of `slot`, if it is still the one `slot` was issued for
    pub fn get(&self, slot: SlotRef) -> Option<&NpuNetwork> {
        let s = self.slots.get(slot.index)?;
        if s.generation == slot.generation {
            s.network.as_ref()
        } else {
            None
        }
    }

    /// Occupant of `slot`, mutably, if still current
    pub fn get_mut(&mut self, slot: SlotRef) -> Option<&mut NpuNetwork> {
        let s = self.slots.get_mut(slot.index)?;
        if s.generation == slot.generation {
            s.network.as_mut()
        } else {
            None
        }
    }

    /// Remove the live network with `id`
    ///
    /// # Errors
    ///
    /// `NetworkNotFound` if no live entry has this id.
    pub fn remove(&mut self, id: u64) -> Result<NpuNetwork, NetworkNotFound> {
        self.position(id)
            .and_then(|index| self.vacate(index))
            .ok_or(NetworkNotFound(id))
    }

    /// Remove the occupant of `slot` if it is still current
    pub fn remove_slot(&mut self, slot: SlotRef) -> Option<NpuNetwork> {
        self.get(slot)?;
        self.vacate(slot.index)
    }

    fn vacate(&mut self, index: usize) -> Option<NpuNetwork> {
        let network = self.slots[index].network.take()?;
        self.free.push(index);
        Some(network)
    }

    /// Live networks in slot order
    pub fn iter(&self) -> impl Iterator<Item = &NpuNetwork> {
        self.slots.iter().filter_map(|s| s.network.as_ref())
    }

    /// Remove every live network
    pub fn drain(&mut self) -> Vec<NpuNetwork> {
        (0..self.slots.len())
            .filter_map(|i| self.vacate(i))
            .collect()
    }

    /// Whether any live network's image lives in buffer `handle`
    pub fn references_buffer(&self, handle: i32) -> bool {
        self.iter().any(|n| n.buffer_handle == handle)
    }
}
