//! External collaborator interfaces.
//!
//! The transport core deliberately does not enumerate PCI buses, allocate
//! physical memory or schedule tasks. Those concerns are consumed through
//! the traits in this module, implemented by the surrounding system (and by
//! in-memory mocks in the test suite).
//!
//! All async traits use the `?Send` form: the execution model is a
//! single-threaded cooperative scheduler where tasks only interleave at
//! `await` points.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use async_trait::async_trait;
use futures_util::future::LocalBoxFuture;

use crate::VirtioError;

/// A DMA-capable memory object that can be mapped into the process.
///
/// Offsets and sizes passed to [`map`](MemoryObject::map) are whole pages;
/// page rounding is handled by [`PhysicalMapping`](crate::mapping::PhysicalMapping).
pub trait MemoryObject: Send + Sync {
    /// Map `size` bytes starting at page-aligned `offset`.
    fn map(&self, offset: usize, size: usize) -> Result<NonNull<u8>, VirtioError>;

    /// Release a mapping previously returned by [`map`](MemoryObject::map).
    fn unmap(&self, ptr: NonNull<u8>, size: usize);
}

/// Physical memory services: contiguous DMA allocation and virtual to
/// physical address translation.
pub trait DmaSpace: Send + Sync {
    /// Allocate `size` bytes of physically contiguous, DMA-capable memory.
    fn allocate(&self, size: usize) -> Result<Arc<dyn MemoryObject>, VirtioError>;

    /// Translate a virtual address inside a mapped DMA region to the
    /// physical address the device must be handed.
    fn translate(&self, ptr: *const u8) -> Result<u64, VirtioError>;
}

/// How a PCI base address register decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// Memory-mapped I/O.
    Memory,
    /// x86 port I/O.
    Port,
    /// BAR is not implemented by the device.
    Unused,
}

/// Decoded information about one BAR.
#[derive(Debug, Clone, Copy)]
pub struct BarInfo {
    pub kind: BarKind,
    pub address: u64,
    pub length: u64,
}

/// One entry of the device's PCI capability list. The capability body is
/// read through [`PciDevice::load_pci_capability`].
#[derive(Debug, Clone, Copy)]
pub struct PciCapability {
    /// Capability ID (0x09 for vendor-specific, used by virtio).
    pub kind: u8,
}

/// PCI configuration snapshot returned by [`PciDevice::pci_info`].
#[derive(Debug, Clone)]
pub struct PciInfo {
    pub caps: Vec<PciCapability>,
    pub bars: [BarInfo; 6],
}

/// A claimed BAR resource.
pub enum Bar {
    /// Memory BAR, mappable through [`PhysicalMapping`](crate::mapping::PhysicalMapping).
    Memory(Arc<dyn MemoryObject>),
    /// Port I/O BAR with its base port.
    Port(u16),
}

/// Tri-state answer handed back to the IRQ event source each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqAck {
    /// The device generated this interrupt and it was handled.
    Acknowledge,
    /// Handled; additionally clear a level-triggered line (MSI-X path).
    AcknowledgeClear,
    /// The device did not generate this interrupt (shared line).
    Nack,
}

/// An interrupt event source for one IRQ line or MSI-X vector.
#[async_trait(?Send)]
pub trait IrqObject {
    /// Wait for the event following `sequence`; returns the new sequence
    /// number to acknowledge.
    async fn wait(&self, sequence: u64) -> Result<u64, VirtioError>;

    /// Report the handling outcome for `sequence` back to the source.
    fn acknowledge(&self, ack: IrqAck, sequence: u64) -> Result<(), VirtioError>;
}

/// Host-device abstraction for one PCI function.
///
/// Mirrors the services a bus driver exposes: configuration snapshots, BAR
/// and IRQ acquisition, capability reads and bus-level enables.
#[async_trait(?Send)]
pub trait PciDevice {
    async fn pci_info(&self) -> Result<PciInfo, VirtioError>;

    async fn access_bar(&self, index: usize) -> Result<Bar, VirtioError>;

    /// Acquire the legacy (shared line) interrupt.
    async fn access_irq(&self) -> Result<Arc<dyn IrqObject>, VirtioError>;

    /// Install an MSI-X vector and return its event source.
    async fn install_msi(&self, vector: u32) -> Result<Arc<dyn IrqObject>, VirtioError>;

    /// Enable MSI-X on the function. Returns `false` if the device or the
    /// platform does not support it.
    async fn enable_msi(&self) -> Result<bool, VirtioError>;

    async fn enable_busmaster(&self) -> Result<(), VirtioError>;

    async fn enable_bus_irq(&self) -> Result<(), VirtioError>;

    /// Read `size` bytes (1, 2 or 4) at `offset` into capability `index`.
    async fn load_pci_capability(
        &self,
        index: usize,
        offset: u32,
        size: u32,
    ) -> Result<u32, VirtioError>;

    async fn claim_device(&self) -> Result<(), VirtioError>;
}

/// Cooperative task dispatcher owned by the embedder.
///
/// [`run_device`](crate::transport::Transport::run_device) hands its
/// interrupt-processing loops to this; they run until process exit.
pub trait Runtime {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>);
}
