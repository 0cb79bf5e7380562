//! User buffer binder
//!
//! Pins the user buffers of a channel, builds one scatter list per buffer
//! and maps it for bus mastering. Each [`BufferSlot`] releases its mapping
//! and pins exactly once when dropped, so an early return anywhere in
//! [`bind`] unwinds the slots already built.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{Result, VdmaError};
use crate::hal::{BusSegment, DmaPlatform, PinnedPage, SgEntry};
use crate::{Direction, MAX_BUFFERS};

/// Frame buffers must be a multiple of this many bytes
pub const LENGTH_ALIGN: usize = 16;
/// Buffer start addresses must be dword aligned
pub const ADDR_ALIGN: usize = 4;
/// Largest scatter segment; the descriptor length field is 24 bits wide
pub const MAX_SEGMENT_LEN: u32 = 0x00FF_F000;

/// One pinned and mapped user buffer
pub struct BufferSlot {
    platform: Arc<dyn DmaPlatform>,
    dir: Direction,
    addr: usize,
    len: usize,
    pages: Vec<PinnedPage>,
    sg: Vec<SgEntry>,
    mapped: Vec<BusSegment>,
}

impl BufferSlot {
    fn pin_and_map(platform: &Arc<dyn DmaPlatform>, addr: usize, len: usize, dir: Direction) -> Result<Self> {
        let page = platform.page_size();
        let first = addr & !(page - 1);
        let offset = addr - first;
        let npages = (offset + len + page - 1) / page;
        let write = dir.device_writes();

        let pages = platform.pin_user_pages(first, npages, write)?;
        let mut slot = Self {
            platform: platform.clone(),
            dir,
            addr,
            len,
            pages,
            sg: Vec::new(),
            mapped: Vec::new(),
        };
        if slot.pages.len() != npages {
            warn!(
                "binder: pinned {} of {} pages at 0x{:x}",
                slot.pages.len(),
                npages,
                addr
            );
            return Err(VdmaError::BadAddress);
        }

        slot.sg = build_sg_list(&slot.pages, offset, len, page);
        let mapped = platform.map_sg(&slot.sg, dir)?;
        if mapped.is_empty() {
            // unmap is skipped for an empty mapping
            return Err(VdmaError::OutOfMemory);
        }
        slot.mapped = mapped;
        debug!(
            "binder: 0x{:x}+{} -> {} pages, {} sg, {} mapped",
            addr,
            len,
            slot.pages.len(),
            slot.sg.len(),
            slot.mapped.len()
        );
        Ok(slot)
    }

    pub fn user_addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mapped segments, in transfer order
    pub fn segments(&self) -> &[BusSegment] {
        &self.mapped
    }

    pub fn segment_count(&self) -> usize {
        self.mapped.len()
    }
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        if !self.mapped.is_empty() {
            self.platform.unmap_sg(&self.sg, self.dir);
            self.mapped.clear();
        }
        if !self.pages.is_empty() {
            self.platform.unpin_pages(&self.pages, self.dir.device_writes());
            self.pages.clear();
        }
    }
}

/// Buffers bound to one channel; all slots share one length
pub struct BoundBuffers {
    slots: heapless::Vec<BufferSlot, MAX_BUFFERS>,
    length: usize,
    dir: Direction,
}

impl BoundBuffers {
    /// Bound buffer count (`ubuf_cnt`)
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    /// Per-buffer mapped segment counts
    pub fn segment_counts(&self) -> heapless::Vec<usize, MAX_BUFFERS> {
        self.slots.iter().map(BufferSlot::segment_count).collect()
    }
}

/// Builds a scatter list over pinned pages, merging physically
/// contiguous pages into one element
pub fn build_sg_list(pages: &[PinnedPage], offset: usize, len: usize, page_size: usize) -> Vec<SgEntry> {
    let mut list: Vec<SgEntry> = Vec::new();
    let mut remaining = len;
    let mut in_page = offset;

    for page in pages {
        if remaining == 0 {
            break;
        }
        let chunk = (page_size - in_page).min(remaining);
        let phys = page.phys + in_page as u64;

        match list.last_mut() {
            Some(last)
                if last.phys + last.len as u64 == phys
                    && last.len as usize + chunk <= MAX_SEGMENT_LEN as usize =>
            {
                last.len += chunk as u32;
            }
            _ => list.push(SgEntry {
                phys,
                len: chunk as u32,
            }),
        }
        remaining -= chunk;
        in_page = 0;
    }
    list
}

fn validate(platform: &dyn DmaPlatform, addrs: &[usize], length: usize, dir: Direction) -> Result<()> {
    if length == 0 || length > u32::MAX as usize {
        return Err(VdmaError::InvalidArgument("buffer length out of range"));
    }
    if length % LENGTH_ALIGN != 0 {
        return Err(VdmaError::InvalidArgument("buffer length must be a multiple of 16"));
    }
    for &addr in addrs {
        if addr == 0 || addr % ADDR_ALIGN != 0 {
            return Err(VdmaError::InvalidArgument("buffer address misaligned"));
        }
        if !platform.access_ok(addr, length, dir.device_writes()) {
            warn!("binder: buffer 0x{:x}+{} not accessible", addr, length);
            return Err(VdmaError::BadAddress);
        }
    }
    Ok(())
}

/// Pins and maps `count` buffers of `length` bytes.
///
/// `count` is clamped to [`MAX_BUFFERS`]. Every buffer is validated before
/// the first page is pinned; a failure while pinning or mapping releases
/// all slots built so far.
pub fn bind(
    platform: &Arc<dyn DmaPlatform>,
    addrs: &[usize],
    count: usize,
    length: usize,
    dir: Direction,
) -> Result<BoundBuffers> {
    let mut count = count;
    if count > MAX_BUFFERS {
        warn!("binder: {} buffers requested, clamping to {}", count, MAX_BUFFERS);
        count = MAX_BUFFERS;
    }
    if count == 0 {
        return Err(VdmaError::InvalidArgument("no buffers"));
    }
    if addrs.len() < count {
        return Err(VdmaError::InvalidArgument("fewer addresses than buffers"));
    }
    let addrs = &addrs[..count];
    validate(platform.as_ref(), addrs, length, dir)?;

    let mut slots = heapless::Vec::new();
    for &addr in addrs {
        let slot = BufferSlot::pin_and_map(platform, addr, length, dir)?;
        if slots.push(slot).is_err() {
            return Err(VdmaError::InvalidArgument("too many buffers"));
        }
    }

    info!("binder: bound {} x {} bytes for {}", count, length, dir);
    Ok(BoundBuffers { slots, length, dir })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimPlatform;

    const PAGE: usize = 4096;

    fn platform() -> (Arc<SimPlatform>, Arc<dyn DmaPlatform>) {
        let sim = Arc::new(SimPlatform::new());
        let dynp: Arc<dyn DmaPlatform> = sim.clone();
        (sim, dynp)
    }

    #[test]
    fn test_sg_list_with_offset_and_gaps() {
        let pages = [
            PinnedPage { phys: 0x10_0000 },
            PinnedPage { phys: 0x10_1000 },
            PinnedPage { phys: 0x20_0000 },
        ];
        let sg = build_sg_list(&pages, 0x800, 2 * PAGE, PAGE);
        assert_eq!(
            sg,
            vec![
                SgEntry { phys: 0x10_0800, len: 0x1800 },
                SgEntry { phys: 0x20_0000, len: 0x800 },
            ]
        );
    }

    #[test]
    fn test_sg_list_single_partial_page() {
        let pages = [PinnedPage { phys: 0x5000 }];
        let sg = build_sg_list(&pages, 0x10, 0x40, PAGE);
        assert_eq!(sg, vec![SgEntry { phys: 0x5010, len: 0x40 }]);
    }

    #[test]
    fn test_bind_then_drop_releases_everything() {
        let (sim, platform) = platform();
        for count in 1..=MAX_BUFFERS {
            let addrs: Vec<usize> = (0..count).map(|i| 0x1000_0000 + i * 0x10_0000).collect();
            let bound = bind(&platform, &addrs, count, 3 * PAGE, Direction::CardToHost).unwrap();
            assert_eq!(bound.count(), count);
            assert!(sim.live_pins() > 0);
            drop(bound);
            assert_eq!(sim.live_pins(), 0);
            assert_eq!(sim.live_mappings(), 0);
        }
    }

    #[test]
    fn test_bind_clamps_count() {
        let (_sim, platform) = platform();
        let addrs: Vec<usize> = (0..20).map(|i| 0x4000_0000 + i * 0x10_0000).collect();
        let bound = bind(&platform, &addrs, 20, PAGE, Direction::HostToCard).unwrap();
        assert_eq!(bound.count(), MAX_BUFFERS);
        assert_eq!(bound.segment_counts().len(), MAX_BUFFERS);
    }

    #[test]
    fn test_bind_rejects_bad_arguments_without_pinning() {
        let (sim, platform) = platform();
        let addrs = [0x1000_0000usize, 0x1010_0000];

        assert!(matches!(
            bind(&platform, &addrs, 2, 100, Direction::CardToHost),
            Err(VdmaError::InvalidArgument(_))
        ));
        assert!(matches!(
            bind(&platform, &[0x1000_0002], 1, PAGE, Direction::CardToHost),
            Err(VdmaError::InvalidArgument(_))
        ));
        assert!(matches!(
            bind(&platform, &addrs, 3, PAGE, Direction::CardToHost),
            Err(VdmaError::InvalidArgument(_))
        ));
        assert!(matches!(
            bind(&platform, &addrs, 0, PAGE, Direction::CardToHost),
            Err(VdmaError::InvalidArgument(_))
        ));

        sim.deny_access(0x1010_0000);
        assert_eq!(
            bind(&platform, &addrs, 2, PAGE, Direction::CardToHost).err(),
            Some(VdmaError::BadAddress)
        );
        assert_eq!(sim.pin_calls(), 0);
    }

    #[test]
    fn test_partial_pin_unwinds() {
        let (sim, platform) = platform();
        let addrs = [0x1000_0000usize, 0x1100_0000, 0x1200_0000];
        // third buffer's second page cannot be faulted in
        sim.fail_pin_at(0x1200_1000);

        let result = bind(&platform, &addrs, 3, 2 * PAGE, Direction::CardToHost);
        assert_eq!(result.err(), Some(VdmaError::BadAddress));
        assert_eq!(sim.live_pins(), 0);
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_map_failure_unwinds() {
        let (sim, platform) = platform();
        let addrs = [0x1000_0000usize, 0x1100_0000];
        sim.fail_map_after(1);

        let result = bind(&platform, &addrs, 2, PAGE, Direction::HostToCard);
        assert_eq!(result.err(), Some(VdmaError::OutOfMemory));
        assert_eq!(sim.live_pins(), 0);
        assert_eq!(sim.live_mappings(), 0);
    }
}
