//! PCI resources handed over by the bus glue

use crate::MAX_IRQ_VECTORS;

/// Standard PCI function BAR count
pub const MAX_BARS: usize = 6;

/// One base address register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    pub index: u8,
    pub addr: u64,
    pub size: u64,
    pub memory: bool,
    pub prefetch: bool,
}

/// BARs and interrupt vectors of one board, as captured at probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciResources {
    pub vendor_id: u16,
    pub device_id: u16,
    pub bars: heapless::Vec<BarInfo, MAX_BARS>,
    pub irq_vectors: heapless::Vec<u32, MAX_IRQ_VECTORS>,
}

impl PciResources {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
            ..Self::default()
        }
    }

    /// Adds a BAR; extra BARs beyond six are ignored
    pub fn with_bar(mut self, bar: BarInfo) -> Self {
        let _ = self.bars.push(bar);
        self
    }

    /// Adds interrupt vectors in slot order; at most 32 are kept
    pub fn with_irq_vectors(mut self, vectors: &[u32]) -> Self {
        for &v in vectors {
            if self.irq_vectors.push(v).is_err() {
                break;
            }
        }
        self
    }

    pub fn bar(&self, index: u8) -> Option<&BarInfo> {
        self.bars.iter().find(|b| b.index == index)
    }

    /// First memory BAR, where the engine registers live
    pub fn register_bar(&self) -> Option<&BarInfo> {
        self.bars.iter().find(|b| b.memory)
    }
}
