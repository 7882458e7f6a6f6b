//! Transport discovery and the device status handshake.
//!
//! Probes a PCI function for the modern capability set first, falling back
//! to the legacy I/O BAR, and leaves the device reset and acknowledged so
//! the caller can proceed straight to feature negotiation.

use alloc::sync::Arc;

use crate::hw::{Bar, BarKind, DmaSpace, PciDevice};
use crate::mapping::PhysicalMapping;
use crate::regs::{common_regs, MmioSpace, RegisterSpace};
use crate::transport::{self, ModernTransport, Transport};
use crate::VirtioError;

#[cfg(target_arch = "x86_64")]
use crate::regs::{legacy_regs, PortSpace};
#[cfg(target_arch = "x86_64")]
use crate::transport::LegacyTransport;

/// PCI capability ID carrying virtio structures (vendor-specific).
pub const VENDOR_CAPABILITY: u8 = 0x09;

/// Virtio structure types inside a vendor capability.
mod cap_subtype {
    pub const COMMON: u32 = 1;
    pub const NOTIFY: u32 = 2;
    pub const ISR: u32 = 3;
    pub const DEVICE: u32 = 4;
}

/// Which register layouts discovery may choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverMode {
    /// Only accept the legacy I/O port transport.
    LegacyOnly,
    /// Prefer modern, fall back to legacy.
    Transitional,
    /// Only accept the modern capability-described transport.
    ModernOnly,
}

/// Probe `device` and construct a [`Transport`] over it.
///
/// On success the device has been claimed, reset and advanced to
/// ACKNOWLEDGE | DRIVER; MSI-X is installed on the modern path when the
/// platform offers it.
pub async fn discover(
    device: Arc<dyn PciDevice>,
    dma: Arc<dyn DmaSpace>,
    mode: DiscoverMode,
) -> Result<Transport, VirtioError> {
    let info = device.pci_info().await?;
    let irq = device.access_irq().await?;
    device.claim_device().await?;
    device.enable_busmaster().await?;
    device.enable_bus_irq().await?;

    if mode != DiscoverMode::LegacyOnly {
        let mut common = None;
        let mut notify = None;
        let mut isr = None;
        let mut device_config = None;
        let mut notify_multiplier = 0;

        for (index, capability) in info.caps.iter().enumerate() {
            if capability.kind != VENDOR_CAPABILITY {
                continue;
            }
            let subtype = device.load_pci_capability(index, 3, 1).await?;
            if !(cap_subtype::COMMON..=cap_subtype::DEVICE).contains(&subtype) {
                continue;
            }
            let bar_index = device.load_pci_capability(index, 4, 1).await? as usize;
            let offset = device.load_pci_capability(index, 8, 4).await? as usize;
            let length = device.load_pci_capability(index, 12, 4).await? as usize;
            log::debug!(
                "virtio: structure {} in BAR {} at {:#x}, length {:#x}",
                subtype,
                bar_index,
                offset,
                length
            );

            let object = match device.access_bar(bar_index).await? {
                Bar::Memory(object) => object,
                Bar::Port(_) => {
                    log::warn!("virtio: capability points into a port BAR, skipping");
                    continue;
                }
            };
            let mapping = PhysicalMapping::new(object, offset, length)?;
            let space: Arc<dyn RegisterSpace> = Arc::new(MmioSpace::new(mapping));

            match subtype {
                cap_subtype::COMMON => common = Some(space),
                cap_subtype::NOTIFY => {
                    notify_multiplier = device.load_pci_capability(index, 16, 4).await?;
                    notify = Some(space);
                }
                cap_subtype::ISR => isr = Some(space),
                cap_subtype::DEVICE => device_config = Some(space),
                _ => unreachable!(),
            }
        }

        if let (Some(common), Some(notify), Some(isr), Some(device_config)) =
            (common, notify, isr, device_config)
        {
            transport::reset_device(&*common, common_regs::DEVICE_STATUS)?;

            let msix_irq = if device.enable_msi().await? {
                Some(device.install_msi(0).await?)
            } else {
                None
            };

            transport::acknowledge_device(&*common, common_regs::DEVICE_STATUS);
            log::info!("virtio: using standard PCI transport");
            return Ok(Transport::Modern(ModernTransport::new(
                device,
                dma,
                common,
                notify,
                isr,
                device_config,
                notify_multiplier,
                irq,
                msix_irq,
            )));
        }
    }

    if mode != DiscoverMode::ModernOnly && info.bars[0].kind == BarKind::Port {
        #[cfg(target_arch = "x86_64")]
        {
            let base = match device.access_bar(0).await? {
                Bar::Port(base) => base,
                _ => return Err(VirtioError::NoSuitableTransport),
            };
            let io: Arc<dyn RegisterSpace> = Arc::new(PortSpace::new(base));

            transport::reset_device(&*io, legacy_regs::DEVICE_STATUS)?;
            transport::acknowledge_device(&*io, legacy_regs::DEVICE_STATUS);
            log::info!("virtio: using legacy PCI transport");
            return Ok(Transport::Legacy(LegacyTransport::new(device, dma, io, irq)));
        }
        #[cfg(not(target_arch = "x86_64"))]
        log::warn!("virtio: legacy transport needs port I/O, unavailable on this architecture");
    }

    log::error!("virtio: no usable transport on this device");
    Err(VirtioError::NoSuitableTransport)
}
