//! Board registry
//!
//! Tracks every probed board by its discovery index and routes shared
//! interrupt lines to the boards that own them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{info, warn};
use spin::Mutex;

use crate::config::EngineConfig;
use crate::device::VdmaDevice;
use crate::error::{Result, VdmaError};
use crate::hal::DmaPlatform;
use crate::regs::RegisterSpace;
use crate::resources::PciResources;
use crate::MAX_BOARDS;

#[derive(Default)]
struct BoardTable {
    boards: BTreeMap<usize, Arc<VdmaDevice>>,
    /// Slots held by probes still in flight
    reserved: usize,
}

/// Table of probed boards
pub struct DeviceRegistry {
    table: Mutex<BoardTable>,
    next_board: AtomicUsize,
    max_boards: usize,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BOARDS)
    }

    pub fn with_capacity(max_boards: usize) -> Self {
        Self {
            table: Mutex::new(BoardTable::default()),
            next_board: AtomicUsize::new(0),
            max_boards,
        }
    }

    /// Probes a board and registers it under the next discovery index
    pub fn probe(
        &self,
        space: Arc<dyn RegisterSpace>,
        platform: Arc<dyn DmaPlatform>,
        resources: PciResources,
        config: EngineConfig,
    ) -> Result<Arc<VdmaDevice>> {
        let board = {
            let mut table = self.table.lock();
            if table.boards.len() + table.reserved >= self.max_boards {
                warn!("registry: board table full ({})", self.max_boards);
                return Err(VdmaError::InvalidArgument("board table full"));
            }
            table.reserved += 1;
            self.next_board.fetch_add(1, Ordering::Relaxed)
        };

        let probed = VdmaDevice::probe(board, space, platform, resources, config).map(Arc::new);

        let mut table = self.table.lock();
        table.reserved -= 1;
        let device = probed?;
        table.boards.insert(board, device.clone());
        info!("registry: board {} registered", board);
        Ok(device)
    }

    pub fn get(&self, board: usize) -> Result<Arc<VdmaDevice>> {
        self.table.lock().boards.get(&board).cloned().ok_or(VdmaError::NoDevice)
    }

    /// Unregisters a board; it is torn down once the last handle drops
    pub fn remove(&self, board: usize) -> Result<Arc<VdmaDevice>> {
        let device = self.table.lock().boards.remove(&board).ok_or(VdmaError::NoDevice)?;
        info!("registry: board {} unregistered", board);
        Ok(device)
    }

    pub fn len(&self) -> usize {
        self.table.lock().boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered board indices, ascending
    pub fn boards(&self) -> Vec<usize> {
        self.table.lock().boards.keys().copied().collect()
    }

    /// Offers `irq` to every board; returns whether one claimed it
    pub fn dispatch_irq(&self, irq: u32) -> bool {
        let devices: Vec<Arc<VdmaDevice>> = self.table.lock().boards.values().cloned().collect();
        let mut handled = false;
        for device in devices {
            handled |= device.handle_irq(irq);
        }
        handled
    }
}
