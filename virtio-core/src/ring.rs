//! Split virtqueue wire format.
//!
//! The structures in this module are bit-exact with the layout a virtio
//! device consumes: a descriptor table, an available (driver -> device) ring
//! and a used (device -> driver) ring, laid out in one physically contiguous
//! region. All device-visible memory is accessed through volatile loads and
//! stores; the raw pointers never escape [`RingView`].

use core::mem::size_of;
use core::ptr;

use crate::VirtioError;

/// Descriptor flag bits.
pub mod desc_flags {
    /// Buffer continues via the next field.
    pub const NEXT: u16 = 1;
    /// Buffer is written by the device.
    pub const WRITE: u16 = 2;
    /// Buffer contains a table of indirect descriptors.
    pub const INDIRECT: u16 = 4;
}

/// Ring header flag bits.
pub mod ring_flags {
    /// Device asks the driver to skip the notify doorbell.
    pub const NO_NOTIFY: u16 = 1;
}

/// Sentinel stored in unused ring slots. Helps debugging: device-side
/// validators complain loudly when they encounter it.
pub const TABLE_INDEX_SENTINEL: u16 = 0xFFFF;

/// Hard cap on the combined size of one queue's ring structures.
pub const QUEUE_REGION_LIMIT: usize = 0x4000;

/// A virtqueue descriptor: one physically contiguous buffer of a request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    /// Physical address of the buffer.
    pub address: u64,
    /// Length of the buffer in bytes.
    pub length: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if the NEXT flag is set.
    pub next: u16,
}

/// Used ring element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsedElement {
    /// Head index of the completed descriptor chain.
    pub table_index: u32,
    /// Total bytes the device wrote into the chain.
    pub written: u32,
}

const AVAIL_HEADER: usize = 4; // u16 flags + u16 head index
const AVAIL_ELEMENT: usize = size_of::<u16>();
const USED_HEADER: usize = 4; // u16 flags + u16 head index
const USED_ELEMENT: usize = size_of::<UsedElement>();
const EXTRA: usize = size_of::<u16>(); // trailing event index

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Byte offsets of the ring structures within one contiguous region.
///
/// The descriptor table sits at offset zero; the available and used rings
/// follow at the requested alignments. Legacy transports demand a 4096-byte
/// alignment in front of the used ring, modern transports only 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    /// Number of descriptors.
    pub queue_size: usize,
    /// Offset of the available ring.
    pub available_offset: usize,
    /// Offset of the used ring.
    pub used_offset: usize,
    /// Total bytes covered by table, rings and trailing event indices.
    pub region_size: usize,
}

impl RingLayout {
    /// Compute the region layout for a queue of `queue_size` descriptors.
    ///
    /// Fails if the structures do not fit [`QUEUE_REGION_LIMIT`]. The cap is
    /// checked explicitly rather than asserted so oversized devices are
    /// rejected instead of aborting the driver.
    pub fn compute(
        queue_size: usize,
        available_align: usize,
        used_align: usize,
    ) -> Result<RingLayout, VirtioError> {
        let available_offset = align_up(queue_size * size_of::<Descriptor>(), available_align);
        let used_offset = align_up(
            available_offset + AVAIL_HEADER + queue_size * AVAIL_ELEMENT + EXTRA,
            used_align,
        );
        let region_size = used_offset + USED_HEADER + queue_size * USED_ELEMENT + EXTRA;

        if region_size > QUEUE_REGION_LIMIT {
            log::error!(
                "virtio: ring structures for {} descriptors need {} bytes, cap is {}",
                queue_size,
                region_size,
                QUEUE_REGION_LIMIT
            );
            return Err(VirtioError::QueueRegionTooLarge);
        }

        Ok(RingLayout {
            queue_size,
            available_offset,
            used_offset,
            region_size,
        })
    }
}

/// Volatile accessor over one queue's ring memory.
///
/// Holds raw pointers into the mapped queue region; the [`Queue`] that
/// constructs a view keeps the mapping alive for the lifetime of the
/// process.
///
/// [`Queue`]: crate::queue::Queue
pub(crate) struct RingView {
    table: *mut Descriptor,
    available: *mut u8,
    used: *mut u8,
    queue_size: usize,
}

impl RingView {
    /// # Safety
    ///
    /// `base` must point to a region of at least `layout.region_size` bytes
    /// that stays mapped for as long as the view is used.
    pub(crate) unsafe fn new(base: *mut u8, layout: &RingLayout) -> RingView {
        RingView {
            table: base as *mut Descriptor,
            available: base.add(layout.available_offset),
            used: base.add(layout.used_offset),
            queue_size: layout.queue_size,
        }
    }

    /// Zero the descriptor table and ring headers and fill every ring slot
    /// with the sentinel index.
    pub(crate) fn initialize(&self) {
        for i in 0..self.queue_size {
            self.write_descriptor(i as u16, Descriptor::default());
        }

        unsafe {
            ptr::write_volatile(self.available as *mut u16, 0); // flags
            ptr::write_volatile(self.available.add(2) as *mut u16, 0); // head index
            for i in 0..self.queue_size {
                ptr::write_volatile(self.available_slot_ptr(i), TABLE_INDEX_SENTINEL);
            }
            ptr::write_volatile(self.available_event_ptr(), 0);

            ptr::write_volatile(self.used as *mut u16, 0); // flags
            ptr::write_volatile(self.used.add(2) as *mut u16, 0); // head index
            for i in 0..self.queue_size {
                ptr::write_volatile(
                    self.used_slot_ptr(i),
                    UsedElement {
                        table_index: TABLE_INDEX_SENTINEL as u32,
                        written: 0,
                    },
                );
            }
            ptr::write_volatile(self.used_event_ptr(), 0);
        }
    }

    pub(crate) fn read_descriptor(&self, index: u16) -> Descriptor {
        debug_assert!((index as usize) < self.queue_size);
        unsafe { ptr::read_volatile(self.table.add(index as usize)) }
    }

    pub(crate) fn write_descriptor(&self, index: u16, descriptor: Descriptor) {
        debug_assert!((index as usize) < self.queue_size);
        unsafe { ptr::write_volatile(self.table.add(index as usize), descriptor) }
    }

    fn available_slot_ptr(&self, slot: usize) -> *mut u16 {
        debug_assert!(slot < self.queue_size);
        unsafe { self.available.add(AVAIL_HEADER + slot * AVAIL_ELEMENT) as *mut u16 }
    }

    fn available_event_ptr(&self) -> *mut u16 {
        unsafe {
            self.available
                .add(AVAIL_HEADER + self.queue_size * AVAIL_ELEMENT) as *mut u16
        }
    }

    fn used_slot_ptr(&self, slot: usize) -> *mut UsedElement {
        debug_assert!(slot < self.queue_size);
        unsafe { self.used.add(USED_HEADER + slot * USED_ELEMENT) as *mut UsedElement }
    }

    fn used_event_ptr(&self) -> *mut u16 {
        unsafe { self.used.add(USED_HEADER + self.queue_size * USED_ELEMENT) as *mut u16 }
    }

    pub(crate) fn available_head(&self) -> u16 {
        unsafe { ptr::read_volatile(self.available.add(2) as *const u16) }
    }

    pub(crate) fn publish_available(&self, head: u16, table_index: u16) {
        let slot = head as usize & (self.queue_size - 1);
        unsafe { ptr::write_volatile(self.available_slot_ptr(slot), table_index) }
    }

    pub(crate) fn set_available_head(&self, head: u16) {
        unsafe { ptr::write_volatile(self.available.add(2) as *mut u16, head) }
    }

    pub(crate) fn used_flags(&self) -> u16 {
        unsafe { ptr::read_volatile(self.used as *const u16) }
    }

    pub(crate) fn used_head(&self) -> u16 {
        unsafe { ptr::read_volatile(self.used.add(2) as *const u16) }
    }

    pub(crate) fn used_element(&self, head: u16) -> UsedElement {
        let slot = head as usize & (self.queue_size - 1);
        unsafe { ptr::read_volatile(self.used_slot_ptr(slot)) }
    }

    /// Read back an available-ring slot. Used by tests to check submission
    /// order the way a device would.
    #[cfg(test)]
    pub(crate) fn available_slot(&self, slot: usize) -> u16 {
        unsafe { ptr::read_volatile(self.available_slot_ptr(slot)) }
    }

    /// Simulate the device side: place a completion into the used ring.
    #[cfg(test)]
    pub(crate) fn device_complete(&self, element: UsedElement) {
        let head = self.used_head();
        let slot = head as usize & (self.queue_size - 1);
        unsafe {
            ptr::write_volatile(self.used_slot_ptr(slot), element);
            ptr::write_volatile(self.used.add(2) as *mut u16, head.wrapping_add(1));
        }
    }

    /// Simulate the device side: set or clear used-ring flags.
    #[cfg(test)]
    pub(crate) fn device_set_used_flags(&self, flags: u16) {
        unsafe { ptr::write_volatile(self.used as *mut u16, flags) }
    }
}
