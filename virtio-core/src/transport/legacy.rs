//! Legacy (pre-1.0) virtio PCI transport.
//!
//! All registers live in one I/O port block at BAR0. Feature words are
//! 32 bits wide, queue memory is programmed as a single page number and the
//! used ring must start on a page boundary within the queue region.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::hw::{DmaSpace, IrqObject, PciDevice, Runtime};
use crate::mapping::{PhysicalMapping, PAGE_SIZE};
use crate::queue::Queue;
use crate::regs::{legacy_regs, DeviceStatus, RegisterSpace};
use crate::ring::{RingLayout, QUEUE_REGION_LIMIT};
use crate::transport::{set_status_bits, IrqLoop, QueueSlots};
use crate::VirtioError;

pub struct LegacyTransport {
    device: Arc<dyn PciDevice>,
    dma: Arc<dyn DmaSpace>,
    io: Arc<dyn RegisterSpace>,
    irq: Arc<dyn IrqObject>,
    queues: QueueSlots,
}

impl LegacyTransport {
    pub(crate) fn new(
        device: Arc<dyn PciDevice>,
        dma: Arc<dyn DmaSpace>,
        io: Arc<dyn RegisterSpace>,
        irq: Arc<dyn IrqObject>,
    ) -> LegacyTransport {
        LegacyTransport {
            device,
            dma,
            io,
            irq,
            queues: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn load_config8(&self, offset: usize) -> u8 {
        self.io.load8(legacy_regs::DEVICE_SPECIFIC + offset)
    }

    pub fn load_config16(&self, offset: usize) -> u16 {
        self.io.load16(legacy_regs::DEVICE_SPECIFIC + offset)
    }

    pub fn load_config32(&self, offset: usize) -> u32 {
        self.io.load32(legacy_regs::DEVICE_SPECIFIC + offset)
    }

    /// Legacy devices only expose feature bits 0-31.
    pub fn check_device_feature(&self, feature: u32) -> bool {
        if feature >= 32 {
            log::warn!(
                "virtio: legacy transport cannot query feature bit {}",
                feature
            );
            return false;
        }
        self.io.load32(legacy_regs::DEVICE_FEATURES) & (1 << feature) != 0
    }

    pub fn acknowledge_driver_feature(&self, feature: u32) {
        if feature >= 32 {
            log::warn!(
                "virtio: legacy transport cannot acknowledge feature bit {}",
                feature
            );
            return;
        }
        let features = self.io.load32(legacy_regs::DRIVER_FEATURES);
        self.io
            .store32(legacy_regs::DRIVER_FEATURES, features | (1 << feature));
    }

    /// Legacy devices have no FEATURES_OK handshake; negotiation ends when
    /// the driver stops writing feature bits.
    pub fn finalize_features(&self) -> Result<(), VirtioError> {
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

        self.io.store16(legacy_regs::QUEUE_SELECT, index);
        let queue_size = self.io.load16(legacy_regs::QUEUE_SIZE);
        if queue_size == 0 {
            log::warn!("virtio: device does not provide queue {}", index);
            return Err(VirtioError::QueueNotAvailable);
        }

        // Legacy layout: 2-byte available alignment, used ring on a page.
        let layout = RingLayout::compute(queue_size as usize, 2, PAGE_SIZE)?;
        let memory = self.dma.allocate(QUEUE_REGION_LIMIT)?;
        let region = PhysicalMapping::new(memory, 0, QUEUE_REGION_LIMIT)?;
        let physical = self.dma.translate(region.get())?;
        debug_assert!(physical & (PAGE_SIZE as u64 - 1) == 0);

        let queue = Queue::new(
            index,
            queue_size,
            region,
            &layout,
            self.dma.clone(),
            self.io.clone(),
            legacy_regs::QUEUE_NOTIFY,
        );

        // The device derives all three ring addresses from one page number.
        self.io
            .store32(legacy_regs::QUEUE_ADDRESS, (physical >> 12) as u32);

        log::debug!(
            "virtio: queue {} ready with {} descriptors",
            index,
            queue_size
        );
        slots[index as usize] = Some(queue.clone());
        Ok(queue)
    }

    pub fn run_device(&self, runtime: &dyn Runtime) {
        set_status_bits(&*self.io, legacy_regs::DEVICE_STATUS, DeviceStatus::DRIVER_OK);

        let task = IrqLoop {
            irq: self.irq.clone(),
            isr_space: self.io.clone(),
            isr_offset: legacy_regs::ISR_STATUS,
            status_space: self.io.clone(),
            status_offset: legacy_regs::DEVICE_STATUS,
            queues: self.queues.clone(),
        };
        runtime.spawn(alloc::boxed::Box::pin(task.run()));
    }

    pub fn pci_device(&self) -> &Arc<dyn PciDevice> {
        &self.device
    }
}
