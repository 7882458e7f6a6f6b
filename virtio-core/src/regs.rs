//! Virtio PCI register maps.
//!
//! Two register layouts exist: the legacy 20-byte I/O port block at BAR0 and
//! the modern capability-described MMIO windows (common, notify, ISR and
//! device configuration). Both are accessed through the [`RegisterSpace`]
//! trait so the transports stay independent of the access mechanism and
//! tests can substitute device models.

use crate::mapping::PhysicalMapping;

/// Legacy I/O register block (offsets into BAR0).
pub mod legacy_regs {
    /// Device features (32-bit).
    pub const DEVICE_FEATURES: usize = 0x00;
    /// Driver features (32-bit).
    pub const DRIVER_FEATURES: usize = 0x04;
    /// Queue address as a page number (32-bit).
    pub const QUEUE_ADDRESS: usize = 0x08;
    /// Queue size (16-bit).
    pub const QUEUE_SIZE: usize = 0x0C;
    /// Queue select (16-bit).
    pub const QUEUE_SELECT: usize = 0x0E;
    /// Queue notify (16-bit).
    pub const QUEUE_NOTIFY: usize = 0x10;
    /// Device status (8-bit).
    pub const DEVICE_STATUS: usize = 0x12;
    /// ISR status (8-bit, read to clear).
    pub const ISR_STATUS: usize = 0x13;
    /// Device-specific configuration starts here.
    pub const DEVICE_SPECIFIC: usize = 0x14;
}

/// Modern common-configuration window (offsets into the common MMIO space).
pub mod common_regs {
    /// Device feature select (32-bit).
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    /// Device feature window (32-bit).
    pub const DEVICE_FEATURE_WINDOW: usize = 0x04;
    /// Driver feature select (32-bit).
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    /// Driver feature window (32-bit).
    pub const DRIVER_FEATURE_WINDOW: usize = 0x0C;
    /// Device status (8-bit).
    pub const DEVICE_STATUS: usize = 0x14;
    /// Queue select (16-bit).
    pub const QUEUE_SELECT: usize = 0x16;
    /// Queue size (16-bit).
    pub const QUEUE_SIZE: usize = 0x18;
    /// Queue MSI-X vector (16-bit).
    pub const QUEUE_MSIX_VECTOR: usize = 0x1A;
    /// Queue enable (16-bit).
    pub const QUEUE_ENABLE: usize = 0x1C;
    /// Queue notify offset (16-bit).
    pub const QUEUE_NOTIFY_OFF: usize = 0x1E;
    /// Descriptor table physical address, low/high half (32-bit each).
    pub const QUEUE_TABLE: [usize; 2] = [0x20, 0x24];
    /// Available ring physical address, low/high half.
    pub const QUEUE_AVAILABLE: [usize; 2] = [0x28, 0x2C];
    /// Used ring physical address, low/high half.
    pub const QUEUE_USED: [usize; 2] = [0x30, 0x34];
}

/// ISR status register (offset into the ISR window, read to clear).
pub const ISR_STATUS: usize = 0x00;

/// ISR status bits.
pub mod isr_bits {
    /// A queue has new used-ring entries.
    pub const QUEUE: u8 = 1;
    /// Device configuration changed.
    pub const CONFIG: u8 = 2;
}

/// MSI-X "no vector" sentinel.
pub const MSIX_NO_VECTOR: u16 = 0xFFFF;

bitflags::bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Driver has acknowledged the device.
        const ACKNOWLEDGE = 1;
        /// Driver knows how to drive the device.
        const DRIVER = 2;
        /// Driver is ready.
        const DRIVER_OK = 4;
        /// Feature negotiation complete.
        const FEATURES_OK = 8;
        /// Device experienced an unrecoverable error.
        const DEVICE_NEEDS_RESET = 64;
        /// Driver gave up on the device.
        const FAILED = 128;
    }
}

/// Device-independent feature bits.
pub mod features {
    /// Driver can use indirect descriptor tables.
    pub const RING_INDIRECT_DESC: u32 = 28;
    /// Ring event-index suppression.
    pub const RING_EVENT_IDX: u32 = 29;
    /// Device is virtio 1.0+ compliant.
    pub const VERSION_1: u32 = 32;
}

/// Width-explicit access to a device register window.
///
/// Implemented over MMIO mappings and x86 port I/O; tests implement it with
/// in-memory device models.
pub trait RegisterSpace: Send + Sync {
    fn load8(&self, offset: usize) -> u8;
    fn load16(&self, offset: usize) -> u16;
    fn load32(&self, offset: usize) -> u32;
    fn store8(&self, offset: usize, value: u8);
    fn store16(&self, offset: usize, value: u16);
    fn store32(&self, offset: usize, value: u32);
}

/// Memory-mapped register window backed by a [`PhysicalMapping`].
pub struct MmioSpace {
    mapping: PhysicalMapping,
}

impl MmioSpace {
    pub fn new(mapping: PhysicalMapping) -> MmioSpace {
        MmioSpace { mapping }
    }

    fn register(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.mapping.size());
        unsafe { self.mapping.get().add(offset) }
    }
}

// The mapping is exclusively owned and every access is volatile.
unsafe impl Send for MmioSpace {}
unsafe impl Sync for MmioSpace {}

impl RegisterSpace for MmioSpace {
    fn load8(&self, offset: usize) -> u8 {
        unsafe { core::ptr::read_volatile(self.register(offset)) }
    }

    fn load16(&self, offset: usize) -> u16 {
        unsafe { core::ptr::read_volatile(self.register(offset) as *const u16) }
    }

    fn load32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.register(offset) as *const u32) }
    }

    fn store8(&self, offset: usize, value: u8) {
        unsafe { core::ptr::write_volatile(self.register(offset), value) }
    }

    fn store16(&self, offset: usize, value: u16) {
        unsafe { core::ptr::write_volatile(self.register(offset) as *mut u16, value) }
    }

    fn store32(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.register(offset) as *mut u32, value) }
    }
}

/// Legacy I/O port register window at a base port.
#[cfg(target_arch = "x86_64")]
pub struct PortSpace {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortSpace {
    pub fn new(base: u16) -> PortSpace {
        PortSpace { base }
    }

    fn port(&self, offset: usize) -> u16 {
        self.base + offset as u16
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterSpace for PortSpace {
    fn load8(&self, offset: usize) -> u8 {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.port(offset));
        unsafe { port.read() }
    }

    fn load16(&self, offset: usize) -> u16 {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.port(offset));
        unsafe { port.read() }
    }

    fn load32(&self, offset: usize) -> u32 {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.port(offset));
        unsafe { port.read() }
    }

    fn store8(&self, offset: usize, value: u8) {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.port(offset));
        unsafe { port.write(value) }
    }

    fn store16(&self, offset: usize, value: u16) {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.port(offset));
        unsafe { port.write(value) }
    }

    fn store32(&self, offset: usize, value: u32) {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.port(offset));
        unsafe { port.write(value) }
    }
}
