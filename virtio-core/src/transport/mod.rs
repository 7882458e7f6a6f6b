//! Virtio PCI transports.
//!
//! A transport owns a device's configuration-space access, feature
//! negotiation, per-queue setup and the device-wide interrupt-processing
//! task. Two register layouts exist; the enum dispatches between them and
//! keeps feature-bit range checks exhaustive.
//!
//! Usual initialization sequence:
//! 1. [`discover`](crate::discover::discover) to obtain a transport.
//! 2. [`Transport::finalize_features`] after negotiating feature bits.
//! 3. [`Transport::claim_queues`] + [`Transport::setup_queue`] per virtq.
//! 4. [`Transport::run_device`] to go live.

pub mod legacy;
pub mod modern;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::hw::{IrqAck, IrqObject, PciDevice, Runtime};
use crate::queue::Queue;
use crate::regs::{isr_bits, DeviceStatus, RegisterSpace};
use crate::VirtioError;

pub use legacy::LegacyTransport;
pub use modern::ModernTransport;

/// Queue slots claimed by a transport. Slots are allocated once by
/// `claim_queues` and filled by `setup_queue`; queues are never torn down.
pub(crate) type QueueSlots = Arc<Mutex<Vec<Option<Arc<Queue>>>>>;

/// A virtio transport over one of the two PCI register layouts.
pub enum Transport {
    /// Pre-1.0 port-I/O transport.
    Legacy(LegacyTransport),
    /// 1.0+ capability-described MMIO transport.
    Modern(ModernTransport),
}

impl core::fmt::Debug for Transport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Transport::Legacy(_) => f.write_str("Transport::Legacy"),
            Transport::Modern(_) => f.write_str("Transport::Modern"),
        }
    }
}

impl Transport {
    /// Read a byte from the device-specific configuration area.
    pub fn load_config8(&self, offset: usize) -> u8 {
        match self {
            Transport::Legacy(t) => t.load_config8(offset),
            Transport::Modern(t) => t.load_config8(offset),
        }
    }

    /// Read a 16-bit word from the device-specific configuration area.
    pub fn load_config16(&self, offset: usize) -> u16 {
        match self {
            Transport::Legacy(t) => t.load_config16(offset),
            Transport::Modern(t) => t.load_config16(offset),
        }
    }

    /// Read a 32-bit word from the device-specific configuration area.
    pub fn load_config32(&self, offset: usize) -> u32 {
        match self {
            Transport::Legacy(t) => t.load_config32(offset),
            Transport::Modern(t) => t.load_config32(offset),
        }
    }

    /// Does the device offer this feature bit?
    ///
    /// Legacy transports only carry bits 0-31 and report `false` above
    /// that range.
    pub fn check_device_feature(&self, feature: u32) -> bool {
        match self {
            Transport::Legacy(t) => t.check_device_feature(feature),
            Transport::Modern(t) => t.check_device_feature(feature),
        }
    }

    /// Accept a feature bit offered by the device.
    pub fn acknowledge_driver_feature(&self, feature: u32) {
        match self {
            Transport::Legacy(t) => t.acknowledge_driver_feature(feature),
            Transport::Modern(t) => t.acknowledge_driver_feature(feature),
        }
    }

    /// Conclude feature negotiation.
    pub fn finalize_features(&self) -> Result<(), VirtioError> {
        match self {
            Transport::Legacy(t) => t.finalize_features(),
            Transport::Modern(t) => t.finalize_features(),
        }
    }

    /// Preallocate `count` queue slots.
    pub fn claim_queues(&self, count: u16) {
        match self {
            Transport::Legacy(t) => t.claim_queues(count),
            Transport::Modern(t) => t.claim_queues(count),
        }
    }

    /// Negotiate and construct the virtqueue at `index`.
    pub fn setup_queue(&self, index: u16) -> Result<Arc<Queue>, VirtioError> {
        match self {
            Transport::Legacy(t) => t.setup_queue(index),
            Transport::Modern(t) => t.setup_queue(index),
        }
    }

    /// Set DRIVER_OK and start the interrupt-processing tasks.
    pub fn run_device(&self, runtime: &dyn Runtime) {
        match self {
            Transport::Legacy(t) => t.run_device(runtime),
            Transport::Modern(t) => t.run_device(runtime),
        }
    }

    /// The underlying host PCI device.
    pub fn pci_device(&self) -> &Arc<dyn PciDevice> {
        match self {
            Transport::Legacy(t) => t.pci_device(),
            Transport::Modern(t) => t.pci_device(),
        }
    }
}

/// Write zero to the status register and verify the device went quiescent.
/// A non-zero readback is a protocol violation.
pub(crate) fn reset_device(
    space: &dyn RegisterSpace,
    status_offset: usize,
) -> Result<(), VirtioError> {
    space.store8(status_offset, 0);
    let status = space.load8(status_offset);
    if status != 0 {
        log::error!(
            "virtio: device status reads {:#x} after reset, expected zero",
            status
        );
        return Err(VirtioError::DeviceResetFailed);
    }
    Ok(())
}

/// Advance the device to ACKNOWLEDGE, then DRIVER.
/// The specification requires these to be two separate writes.
pub(crate) fn acknowledge_device(space: &dyn RegisterSpace, status_offset: usize) {
    set_status_bits(space, status_offset, DeviceStatus::ACKNOWLEDGE);
    set_status_bits(space, status_offset, DeviceStatus::DRIVER);
}

/// Read-modify-write helper for the status register.
pub(crate) fn set_status_bits(
    space: &dyn RegisterSpace,
    status_offset: usize,
    bits: DeviceStatus,
) {
    let status = space.load8(status_offset);
    space.store8(status_offset, status | bits.bits());
}

/// Shared-line interrupt loop: the device multiplexes queue activity and
/// configuration changes onto one 2-bit ISR register.
///
/// Runs until process exit; the only early return is an unrecoverable
/// device fault or a failing IRQ source.
pub(crate) struct IrqLoop {
    pub irq: Arc<dyn IrqObject>,
    pub isr_space: Arc<dyn RegisterSpace>,
    pub isr_offset: usize,
    pub status_space: Arc<dyn RegisterSpace>,
    pub status_offset: usize,
    pub queues: QueueSlots,
}

impl IrqLoop {
    pub(crate) async fn run(self) {
        let mut sequence = 0;
        loop {
            sequence = match self.irq.wait(sequence).await {
                Ok(sequence) => sequence,
                Err(error) => {
                    log::error!("virtio: IRQ wait failed: {}", error);
                    return;
                }
            };

            // Reading the ISR register clears it on the device.
            let isr = self.isr_space.load8(self.isr_offset);
            if isr & (isr_bits::QUEUE | isr_bits::CONFIG) == 0 {
                // Shared line; this interrupt belongs to another device.
                if self.irq.acknowledge(IrqAck::Nack, sequence).is_err() {
                    return;
                }
                continue;
            }
            if self.irq.acknowledge(IrqAck::Acknowledge, sequence).is_err() {
                return;
            }

            if isr & isr_bits::CONFIG != 0 {
                let status = self.status_space.load8(self.status_offset);
                if status & DeviceStatus::DEVICE_NEEDS_RESET.bits() != 0 {
                    // Unrecoverable; stop touching the device rather than
                    // posting further requests.
                    log::error!("virtio: device signalled DEVICE_NEEDS_RESET, halting queue processing");
                    return;
                }
                // TODO: surface configuration changes (e.g. link state) to
                // the owning driver once one needs them.
                log::warn!("virtio: configuration change ignored");
            }

            if isr & isr_bits::QUEUE != 0 {
                // Queue activity is signalled device-wide; scan every queue.
                for queue in claimed_queues(&self.queues) {
                    queue.process_interrupt();
                }
            }
        }
    }
}

/// Per-vector MSI-X interrupt loop. The vector targets queue activity only;
/// configuration changes keep arriving through the shared ISR loop.
pub(crate) struct MsixLoop {
    pub irq: Arc<dyn IrqObject>,
    pub queues: QueueSlots,
}

impl MsixLoop {
    pub(crate) async fn run(self) {
        let mut sequence = 0;
        loop {
            sequence = match self.irq.wait(sequence).await {
                Ok(sequence) => sequence,
                Err(error) => {
                    log::error!("virtio: MSI-X wait failed: {}", error);
                    return;
                }
            };
            if self
                .irq
                .acknowledge(IrqAck::AcknowledgeClear, sequence)
                .is_err()
            {
                return;
            }
            for queue in claimed_queues(&self.queues) {
                queue.process_interrupt();
            }
        }
    }
}

/// Snapshot the populated queue slots without holding the lock across
/// completion callbacks.
fn claimed_queues(slots: &QueueSlots) -> Vec<Arc<Queue>> {
    slots.lock().iter().flatten().cloned().collect()
}
