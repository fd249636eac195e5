//! Slot-based dispatch bus.
//!
//! The bus maps a [`SlotType`] to the one [`Slot`] serving it and forwards
//! handler registration to that slot. It never touches handler tables itself:
//! each slot guards its own.

use std::collections::HashMap;
use std::sync::Arc;

use error_stack::Report;
use parking_lot::RwLock;
use tracing::{debug, warn};

pub mod error;
pub mod traits;

pub use error::{BusError, BusResult, DispatchError, DispatchResult, IntoBusReport};
pub use traits::{Event, Handler, MatchArg, Reply, Slot, SlotType, handler_fn, string_matches};


/// Registry of slots keyed by transport type.
#[derive(Default)]
pub struct SlotBus {
    slots: RwLock<HashMap<SlotType, Arc<dyn Slot>>>,
}

impl SlotBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `slot` for its type. A previous slot of the same type is
    /// replaced.
    pub fn add_slot(&self, slot: Arc<dyn Slot>) {
        let slot_type = slot.slot_type();
        if self.slots.write().insert(slot_type, slot).is_some() {
            warn!(slot = %slot_type, "replaced existing slot");
        } else {
            debug!(slot = %slot_type, "slot registered");
        }
    }

    /// Bind `handler` on the slot registered for `slot_type`.
    pub async fn add_slot_handler(
        &self,
        slot_type: SlotType,
        handler: Handler,
        matches: &[MatchArg],
    ) -> BusResult<()> {
        let slot = self.slot(slot_type)?;
        slot.add_handler(handler, matches).await
    }

    /// Remove the binding for `matches` on the slot registered for `slot_type`.
    pub async fn del_slot_handler(&self, slot_type: SlotType, matches: &[MatchArg]) -> BusResult<()> {
        let slot = self.slot(slot_type)?;
        slot.del_handler(matches).await
    }

    /// Whether a slot is registered for `slot_type`.
    pub fn has_slot(&self, slot_type: SlotType) -> bool {
        self.slots.read().contains_key(&slot_type)
    }

    pub fn slot_types(&self) -> Vec<SlotType> {
        self.slots.read().keys().copied().collect()
    }

    // The read guard is released before the slot call is awaited.
    fn slot(&self, slot_type: SlotType) -> BusResult<Arc<dyn Slot>> {
        self.slots
            .read()
            .get(&slot_type)
            .cloned()
            .ok_or_else(|| Report::new(BusError::NoSuchSlot(slot_type)))
    }
}
