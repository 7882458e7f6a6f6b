//! Modern (virtio 1.0+) PCI transport.
//!
//! Registers are spread over four MMIO windows described by vendor
//! capabilities: common configuration, notify, ISR and device-specific
//! configuration. Feature words are 64 bits wide and accessed through a
//! select/window pair, queue rings are programmed as three separate
//! physical addresses and negotiation concludes with an explicit
//! FEATURES_OK handshake.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::hw::{DmaSpace, IrqObject, PciDevice, Runtime};
use crate::mapping::PhysicalMapping;
use crate::queue::Queue;
use crate::regs::{common_regs, DeviceStatus, RegisterSpace, ISR_STATUS};
use crate::ring::{RingLayout, QUEUE_REGION_LIMIT};
use crate::transport::{set_status_bits, IrqLoop, MsixLoop, QueueSlots};
use crate::VirtioError;

pub struct ModernTransport {
    device: Arc<dyn PciDevice>,
    dma: Arc<dyn DmaSpace>,
    common: Arc<dyn RegisterSpace>,
    notify: Arc<dyn RegisterSpace>,
    isr: Arc<dyn RegisterSpace>,
    device_config: Arc<dyn RegisterSpace>,
    /// Scales each queue's notify offset into the notify window.
    notify_multiplier: u32,
    irq: Arc<dyn IrqObject>,
    msix_irq: Option<Arc<dyn IrqObject>>,
    queues: QueueSlots,
}

impl ModernTransport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device: Arc<dyn PciDevice>,
        dma: Arc<dyn DmaSpace>,
        common: Arc<dyn RegisterSpace>,
        notify: Arc<dyn RegisterSpace>,
        isr: Arc<dyn RegisterSpace>,
        device_config: Arc<dyn RegisterSpace>,
        notify_multiplier: u32,
        irq: Arc<dyn IrqObject>,
        msix_irq: Option<Arc<dyn IrqObject>>,
    ) -> ModernTransport {
        ModernTransport {
            device,
            dma,
            common,
            notify,
            isr,
            device_config,
            notify_multiplier,
            irq,
            msix_irq,
            queues: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn load_config8(&self, offset: usize) -> u8 {
        self.device_config.load8(offset)
    }

    pub fn load_config16(&self, offset: usize) -> u16 {
        self.device_config.load16(offset)
    }

    pub fn load_config32(&self, offset: usize) -> u32 {
        self.device_config.load32(offset)
    }

    /// Query one bit of the 64-bit device feature space through the
    /// select/window pair.
    pub fn check_device_feature(&self, feature: u32) -> bool {
        self.common
            .store32(common_regs::DEVICE_FEATURE_SELECT, feature >> 5);
        let window = self.common.load32(common_regs::DEVICE_FEATURE_WINDOW);
        window & (1 << (feature & 31)) != 0
    }

    pub fn acknowledge_driver_feature(&self, feature: u32) {
        self.common
            .store32(common_regs::DRIVER_FEATURE_SELECT, feature >> 5);
        let window = self.common.load32(common_regs::DRIVER_FEATURE_WINDOW);
        self.common.store32(
            common_regs::DRIVER_FEATURE_WINDOW,
            window | (1 << (feature & 31)),
        );
    }

    /// Conclude negotiation: demand VERSION_1, set FEATURES_OK and verify
    /// the device accepted it. Either failure marks the device FAILED.
    pub fn finalize_features(&self) -> Result<(), VirtioError> {
        if !self.check_device_feature(crate::regs::features::VERSION_1) {
            log::error!("virtio: device does not offer VERSION_1");
            set_status_bits(
                &*self.common,
                common_regs::DEVICE_STATUS,
                DeviceStatus::FAILED,
            );
            return Err(VirtioError::FeatureNegotiationFailed);
        }
        self.acknowledge_driver_feature(crate::regs::features::VERSION_1);

        set_status_bits(
            &*self.common,
            common_regs::DEVICE_STATUS,
            DeviceStatus::FEATURES_OK,
        );
        let status = self.common.load8(common_regs::DEVICE_STATUS);
        if status & DeviceStatus::FEATURES_OK.bits() == 0 {
            log::error!("virtio: device rejected the negotiated feature set");
            set_status_bits(
                &*self.common,
                common_regs::DEVICE_STATUS,
                DeviceStatus::FAILED,
            );
            return Err(VirtioError::FeatureNegotiationFailed);
        }
        Ok(())
    }

    pub fn claim_queues(&self, count: u16) {
        let mut slots = self.queues.lock();
        assert!(slots.is_empty(), "queues already claimed");
        slots.resize_with(count as usize, || None);
    }

    pub fn setup_queue(&self, index: u16) -> Result<Arc<Queue>, VirtioError> {
        let mut slots = self.queues.lock();
        assert!(
            (index as usize) < slots.len(),
            "queue {} was not claimed",
            index
        );
        assert!(slots[index as usize].is_none(), "queue {} already set up", index);

        self.common.store16(common_regs::QUEUE_SELECT, index);
        let queue_size = self.common.load16(common_regs::QUEUE_SIZE);
        if queue_size == 0 {
            log::warn!("virtio: device does not provide queue {}", index);
            return Err(VirtioError::QueueNotAvailable);
        }
        let notify_index = self.common.load16(common_regs::QUEUE_NOTIFY_OFF);

        let layout = RingLayout::compute(queue_size as usize, 2, 4)?;
        let memory = self.dma.allocate(QUEUE_REGION_LIMIT)?;
        let region = PhysicalMapping::new(memory, 0, QUEUE_REGION_LIMIT)?;
        let table = self.dma.translate(region.get())?;
        let available = table + layout.available_offset as u64;
        let used = table + layout.used_offset as u64;

        let queue = Queue::new(
            index,
            queue_size,
            region,
            &layout,
            self.dma.clone(),
            self.notify.clone(),
            notify_index as usize * self.notify_multiplier as usize,
        );

        self.common
            .store32(common_regs::QUEUE_TABLE[0], table as u32);
        self.common
            .store32(common_regs::QUEUE_TABLE[1], (table >> 32) as u32);
        self.common
            .store32(common_regs::QUEUE_AVAILABLE[0], available as u32);
        self.common
            .store32(common_regs::QUEUE_AVAILABLE[1], (available >> 32) as u32);
        self.common.store32(common_regs::QUEUE_USED[0], used as u32);
        self.common
            .store32(common_regs::QUEUE_USED[1], (used >> 32) as u32);

        if self.msix_irq.is_some() {
            // All queues share vector 0; the readback confirms acceptance.
            self.common.store16(common_regs::QUEUE_MSIX_VECTOR, 0);
            if self.common.load16(common_regs::QUEUE_MSIX_VECTOR) != 0 {
                log::error!("virtio: device rejected MSI-X vector for queue {}", index);
                return Err(VirtioError::MsixVectorRejected);
            }
        }

        self.common.store16(common_regs::QUEUE_ENABLE, 1);

        log::debug!(
            "virtio: queue {} ready with {} descriptors, notify offset {:#x}",
            index,
            queue_size,
            notify_index as usize * self.notify_multiplier as usize
        );
        slots[index as usize] = Some(queue.clone());
        Ok(queue)
    }

    pub fn run_device(&self, runtime: &dyn Runtime) {
        set_status_bits(
            &*self.common,
            common_regs::DEVICE_STATUS,
            DeviceStatus::DRIVER_OK,
        );

        let task = IrqLoop {
            irq: self.irq.clone(),
            isr_space: self.isr.clone(),
            isr_offset: ISR_STATUS,
            status_space: self.common.clone(),
            status_offset: common_regs::DEVICE_STATUS,
            queues: self.queues.clone(),
        };
        runtime.spawn(alloc::boxed::Box::pin(task.run()));

        if let Some(msix_irq) = &self.msix_irq {
            let task = MsixLoop {
                irq: msix_irq.clone(),
                queues: self.queues.clone(),
            };
            runtime.spawn(alloc::boxed::Box::pin(task.run()));
        }
    }

    pub fn pci_device(&self) -> &Arc<dyn PciDevice> {
        &self.device
    }
}
