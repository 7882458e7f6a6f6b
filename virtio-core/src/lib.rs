//! Device-independent virtio transport core.
//!
//! This crate implements the transport layer that every virtio device driver
//! (block, network, GPU, console, ...) builds on: discovering whether a PCI
//! device exposes a legacy (pre-1.0) or modern (1.0+) virtio interface,
//! negotiating features, constructing split virtqueues in physically
//! contiguous memory, and running the submit/notify/interrupt/complete cycle.
//!
//! # Architecture
//!
//! Virtio devices communicate through virtqueues - ring buffers shared
//! between driver and device. Each queue consists of:
//! - Descriptor table: Describes memory buffers
//! - Available ring: Driver tells device which descriptors are ready
//! - Used ring: Device tells driver which descriptors are consumed
//!
//! The pieces a driver interacts with:
//! - [`discover`](discover::discover) probes the PCI capability list and
//!   drives the device through its status-register handshake, producing a
//!   [`Transport`](transport::Transport).
//! - [`Transport`](transport::Transport) owns configuration-space access,
//!   feature negotiation, per-queue setup and the device-wide interrupt task.
//! - [`Queue`](queue::Queue) owns one virtqueue; requests are assembled as
//!   descriptor [`Chain`](queue::Chain)s and posted to the available ring.
//!
//! Bus enumeration, physical memory and task scheduling are not implemented
//! here; they are consumed through the traits in [`hw`].
//!
//! # Concurrency
//!
//! The design assumes a single-threaded cooperative scheduler: tasks only
//! interleave at `await` points. All queue state is nevertheless behind
//! `spin::Mutex`, so a multi-threaded embedding does not observe the free
//! list or ring cursors mid-update.
//!
//! # References
//!
//! - Virtual I/O Device (VIRTIO) Specification 1.1+

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod discover;
pub mod hw;
pub mod mapping;
pub mod queue;
pub mod regs;
pub mod ring;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

use core::fmt;

/// Virtio transport error types.
///
/// These cover the fatal initialization and runtime conditions a driver can
/// observe. Caller programming errors (double-posting a descriptor, posting
/// a zero-length buffer) are assertion failures, not error values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// No capability set or I/O BAR yields a usable transport.
    NoSuitableTransport,
    /// Device status did not read back as zero after a reset.
    DeviceResetFailed,
    /// Device rejected FEATURES_OK or lacks a required feature bit.
    FeatureNegotiationFailed,
    /// Selected queue reports a size of zero.
    QueueNotAvailable,
    /// Ring structures do not fit the fixed queue region.
    QueueRegionTooLarge,
    /// Device did not accept the MSI-X vector assigned to a queue.
    MsixVectorRejected,
    /// Host PCI device collaborator failed.
    HostDeviceFailure,
    /// DMA allocation or address translation failed.
    DmaFailure,
    /// Mapping a memory object into the process failed.
    MappingFailed,
    /// IRQ event source failed.
    IrqFailure,
}

impl VirtioError {
    /// Human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            VirtioError::NoSuitableTransport => "no suitable virtio transport",
            VirtioError::DeviceResetFailed => "device status not zero after reset",
            VirtioError::FeatureNegotiationFailed => "feature negotiation failed",
            VirtioError::QueueNotAvailable => "queue not available",
            VirtioError::QueueRegionTooLarge => "queue region exceeds allocation cap",
            VirtioError::MsixVectorRejected => "device rejected MSI-X vector",
            VirtioError::HostDeviceFailure => "host PCI device failure",
            VirtioError::DmaFailure => "DMA allocation or translation failure",
            VirtioError::MappingFailed => "memory mapping failure",
            VirtioError::IrqFailure => "IRQ event source failure",
        }
    }
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
