//! In-memory device models and a minimal executor for the test suite.
//!
//! Nothing here touches real hardware: DMA memory comes from the test
//! heap, register windows are plain RAM or scripted models and interrupts
//! are queues of sequence numbers.

use alloc::alloc::Layout;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use async_trait::async_trait;
use futures_util::future::LocalBoxFuture;
use spin::Mutex;

use crate::hw::{
    Bar, BarInfo, BarKind, DmaSpace, IrqAck, IrqObject, MemoryObject, PciCapability, PciDevice,
    PciInfo, Runtime,
};
use crate::mapping::{PhysicalMapping, PAGE_SIZE};
use crate::queue::Queue;
use crate::regs::{common_regs, DeviceStatus, RegisterSpace, MSIX_NO_VECTOR};
use crate::ring::{RingLayout, QUEUE_REGION_LIMIT};
use crate::VirtioError;

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    RawWaker::new(core::ptr::null(), &VTABLE)
}

fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

/// Poll a future to completion on the current thread. Only suitable for
/// futures whose progress does not depend on another task running.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut future = std::boxed::Box::pin(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
    }
}

/// Poll a future exactly once.
pub(crate) fn poll_once<F: Future + ?Sized>(future: Pin<&mut F>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    future.poll(&mut cx)
}

/// Page-aligned zeroed heap allocation standing in for DMA memory.
pub(crate) struct HeapChunk {
    base: NonNull<u8>,
    layout: Layout,
    pub unmap_count: AtomicUsize,
}

// Exclusively owned allocation; tests synchronize through the queue lock.
unsafe impl Send for HeapChunk {}
unsafe impl Sync for HeapChunk {}

impl MemoryObject for HeapChunk {
    fn map(&self, offset: usize, size: usize) -> Result<NonNull<u8>, VirtioError> {
        if offset + size > self.layout.size() {
            return Err(VirtioError::MappingFailed);
        }
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    fn unmap(&self, _ptr: NonNull<u8>, _size: usize) {
        self.unmap_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for HeapChunk {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Heap-backed [`DmaSpace`] with identity address translation.
pub(crate) struct HeapDma;

impl HeapDma {
    pub fn allocate_chunk(&self, size: usize) -> Arc<HeapChunk> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let base = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) }).unwrap();
        Arc::new(HeapChunk {
            base,
            layout,
            unmap_count: AtomicUsize::new(0),
        })
    }
}

impl DmaSpace for HeapDma {
    fn allocate(&self, size: usize) -> Result<Arc<dyn MemoryObject>, VirtioError> {
        Ok(self.allocate_chunk(size))
    }

    fn translate(&self, ptr: *const u8) -> Result<u64, VirtioError> {
        Ok(ptr as u64)
    }
}

/// Plain RAM register window that records every store.
pub(crate) struct RamSpace {
    bytes: Mutex<BTreeMap<usize, u8>>,
    /// Every store, in order, as `(offset, value)` regardless of width.
    pub writes: Mutex<Vec<(usize, u32)>>,
    /// Byte-load overrides that stores cannot clear.
    sticky: Mutex<BTreeMap<usize, u8>>,
}

impl RamSpace {
    pub fn new() -> RamSpace {
        RamSpace {
            bytes: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            sticky: Mutex::new(BTreeMap::new()),
        }
    }

    /// Force `load8(offset)` to always return `value`.
    pub fn stick8(&self, offset: usize, value: u8) {
        self.sticky.lock().insert(offset, value);
    }

    fn get(&self, offset: usize) -> u8 {
        *self.bytes.lock().get(&offset).unwrap_or(&0)
    }

    fn put(&self, offset: usize, value: u8) {
        self.bytes.lock().insert(offset, value);
    }

    pub fn set8(&self, offset: usize, value: u8) {
        self.put(offset, value);
    }

    pub fn set16(&self, offset: usize, value: u16) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.put(offset + i, *byte);
        }
    }

    pub fn set32(&self, offset: usize, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.put(offset + i, *byte);
        }
    }

    pub fn read8(&self, offset: usize) -> u8 {
        self.get(offset)
    }

    pub fn read32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.get(offset),
            self.get(offset + 1),
            self.get(offset + 2),
            self.get(offset + 3),
        ])
    }
}

impl RegisterSpace for RamSpace {
    fn load8(&self, offset: usize) -> u8 {
        if let Some(value) = self.sticky.lock().get(&offset) {
            return *value;
        }
        self.get(offset)
    }

    fn load16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.get(offset), self.get(offset + 1)])
    }

    fn load32(&self, offset: usize) -> u32 {
        self.read32(offset)
    }

    fn store8(&self, offset: usize, value: u8) {
        self.put(offset, value);
        self.writes.lock().push((offset, value as u32));
    }

    fn store16(&self, offset: usize, value: u16) {
        self.set16(offset, value);
        self.writes.lock().push((offset, value as u32));
    }

    fn store32(&self, offset: usize, value: u32) {
        self.set32(offset, value);
        self.writes.lock().push((offset, value));
    }
}

/// Notify window that records doorbell writes.
pub(crate) struct FakeNotify {
    pub stores: Mutex<Vec<(usize, u16)>>,
}

impl FakeNotify {
    pub fn new() -> FakeNotify {
        FakeNotify {
            stores: Mutex::new(Vec::new()),
        }
    }
}

impl RegisterSpace for FakeNotify {
    fn load8(&self, _offset: usize) -> u8 {
        0
    }

    fn load16(&self, _offset: usize) -> u16 {
        0
    }

    fn load32(&self, _offset: usize) -> u32 {
        0
    }

    fn store8(&self, _offset: usize, _value: u8) {}

    fn store16(&self, offset: usize, value: u16) {
        self.stores.lock().push((offset, value));
    }

    fn store32(&self, _offset: usize, _value: u32) {}
}

/// A ready-to-use queue over heap memory, notify doorbell at offset 0x10.
pub(crate) fn test_queue(queue_size: u16) -> (Arc<Queue>, Arc<FakeNotify>) {
    let layout = RingLayout::compute(queue_size as usize, 2, 4).unwrap();
    let chunk = HeapDma.allocate_chunk(QUEUE_REGION_LIMIT);
    let region = PhysicalMapping::new(chunk, 0, QUEUE_REGION_LIMIT).unwrap();
    let notify = Arc::new(FakeNotify::new());
    let queue = Queue::new(
        0,
        queue_size,
        region,
        &layout,
        Arc::new(HeapDma),
        notify.clone(),
        0x10,
    );
    (queue, notify)
}

/// Scripted interrupt source: a queue of sequence numbers and a log of
/// acknowledgements. `wait` suspends forever once the script runs dry.
pub(crate) struct MockIrq {
    events: Mutex<VecDeque<u64>>,
    pub acks: Mutex<Vec<(IrqAck, u64)>>,
}

impl MockIrq {
    pub fn new() -> MockIrq {
        MockIrq {
            events: Mutex::new(VecDeque::new()),
            acks: Mutex::new(Vec::new()),
        }
    }

    pub fn push_event(&self, sequence: u64) {
        self.events.lock().push_back(sequence);
    }
}

#[async_trait(?Send)]
impl IrqObject for MockIrq {
    async fn wait(&self, _sequence: u64) -> Result<u64, VirtioError> {
        let next = self.events.lock().pop_front();
        match next {
            Some(sequence) => Ok(sequence),
            None => futures_util::future::pending().await,
        }
    }

    fn acknowledge(&self, ack: IrqAck, sequence: u64) -> Result<(), VirtioError> {
        self.acks.lock().push((ack, sequence));
        Ok(())
    }
}

/// Behavioral model of the modern common-configuration window.
pub(crate) struct FakeCommonCfg {
    device_features: u64,
    queue_size: u16,
    pub notify_off: u16,
    pub msix_accepts: bool,
    pub reject_features_ok: bool,
    driver_features: Mutex<u64>,
    device_select: Mutex<u32>,
    driver_select: Mutex<u32>,
    status: Mutex<u8>,
    queue_select: Mutex<u16>,
    msix_vector: Mutex<u16>,
    queue_enable: Mutex<u16>,
    /// table lo/hi, available lo/hi, used lo/hi.
    ring_addresses: Mutex<[u32; 6]>,
}

impl FakeCommonCfg {
    pub fn new(device_features: u64, queue_size: u16) -> FakeCommonCfg {
        FakeCommonCfg {
            device_features,
            queue_size,
            notify_off: 0,
            msix_accepts: true,
            reject_features_ok: false,
            driver_features: Mutex::new(0),
            device_select: Mutex::new(0),
            driver_select: Mutex::new(0),
            status: Mutex::new(0),
            queue_select: Mutex::new(0),
            msix_vector: Mutex::new(MSIX_NO_VECTOR),
            queue_enable: Mutex::new(0),
            ring_addresses: Mutex::new([0; 6]),
        }
    }

    pub fn driver_features(&self) -> u64 {
        *self.driver_features.lock()
    }

    pub fn status(&self) -> u8 {
        *self.status.lock()
    }

    pub fn queue_enabled(&self) -> bool {
        *self.queue_enable.lock() != 0
    }

    pub fn ring_addresses(&self) -> [u32; 6] {
        *self.ring_addresses.lock()
    }

    fn feature_word(features: u64, select: u32) -> u32 {
        match select {
            0 => features as u32,
            1 => (features >> 32) as u32,
            _ => 0,
        }
    }
}

impl RegisterSpace for FakeCommonCfg {
    fn load8(&self, offset: usize) -> u8 {
        match offset {
            common_regs::DEVICE_STATUS => *self.status.lock(),
            _ => 0,
        }
    }

    fn load16(&self, offset: usize) -> u16 {
        match offset {
            common_regs::QUEUE_SELECT => *self.queue_select.lock(),
            common_regs::QUEUE_SIZE => {
                if *self.queue_select.lock() == 0 {
                    self.queue_size
                } else {
                    0
                }
            }
            common_regs::QUEUE_MSIX_VECTOR => {
                if self.msix_accepts {
                    *self.msix_vector.lock()
                } else {
                    MSIX_NO_VECTOR
                }
            }
            common_regs::QUEUE_ENABLE => *self.queue_enable.lock(),
            common_regs::QUEUE_NOTIFY_OFF => self.notify_off,
            _ => 0,
        }
    }

    fn load32(&self, offset: usize) -> u32 {
        match offset {
            common_regs::DEVICE_FEATURE_SELECT => *self.device_select.lock(),
            common_regs::DEVICE_FEATURE_WINDOW => {
                Self::feature_word(self.device_features, *self.device_select.lock())
            }
            common_regs::DRIVER_FEATURE_SELECT => *self.driver_select.lock(),
            common_regs::DRIVER_FEATURE_WINDOW => {
                Self::feature_word(*self.driver_features.lock(), *self.driver_select.lock())
            }
            _ => 0,
        }
    }

    fn store8(&self, offset: usize, value: u8) {
        if offset == common_regs::DEVICE_STATUS {
            let mut value = value;
            if self.reject_features_ok {
                value &= !DeviceStatus::FEATURES_OK.bits();
            }
            *self.status.lock() = value;
        }
    }

    fn store16(&self, offset: usize, value: u16) {
        match offset {
            common_regs::QUEUE_SELECT => *self.queue_select.lock() = value,
            common_regs::QUEUE_MSIX_VECTOR => *self.msix_vector.lock() = value,
            common_regs::QUEUE_ENABLE => *self.queue_enable.lock() = value,
            _ => {}
        }
    }

    fn store32(&self, offset: usize, value: u32) {
        match offset {
            common_regs::DEVICE_FEATURE_SELECT => *self.device_select.lock() = value,
            common_regs::DRIVER_FEATURE_SELECT => *self.driver_select.lock() = value,
            common_regs::DRIVER_FEATURE_WINDOW => {
                let select = *self.driver_select.lock();
                if select < 2 {
                    let shift = select * 32;
                    let mut features = self.driver_features.lock();
                    *features =
                        (*features & !(0xffff_ffffu64 << shift)) | ((value as u64) << shift);
                }
            }
            offset if (common_regs::QUEUE_TABLE[0]..=common_regs::QUEUE_USED[1])
                .contains(&offset) =>
            {
                self.ring_addresses.lock()[(offset - common_regs::QUEUE_TABLE[0]) / 4] = value;
            }
            _ => {}
        }
    }
}

/// One scripted entry of a device's capability list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MockCap {
    pub kind: u8,
    pub subtype: u32,
    pub bar: u32,
    pub offset: u32,
    pub length: u32,
    pub multiplier: u32,
}

/// Scripted PCI function: capability list, BARs and heap-backed BAR memory.
pub(crate) struct MockPciDevice {
    pub caps: Vec<MockCap>,
    pub bars: [BarInfo; 6],
    pub msi: Option<Arc<MockIrq>>,
    bar_memory: Mutex<BTreeMap<usize, Arc<HeapChunk>>>,
    irq: Arc<MockIrq>,
}

impl MockPciDevice {
    pub fn new() -> MockPciDevice {
        MockPciDevice {
            caps: Vec::new(),
            bars: [BarInfo {
                kind: BarKind::Unused,
                address: 0,
                length: 0,
            }; 6],
            msi: None,
            bar_memory: Mutex::new(BTreeMap::new()),
            irq: Arc::new(MockIrq::new()),
        }
    }

    /// Back BAR `index` with `size` bytes of zeroed heap memory.
    pub fn install_bar_memory(&mut self, index: usize, size: usize) {
        self.bar_memory
            .lock()
            .insert(index, HeapDma.allocate_chunk(size));
    }

    pub fn read_bar_memory8(&self, index: usize, offset: usize) -> u8 {
        let chunks = self.bar_memory.lock();
        let chunk = chunks.get(&index).expect("BAR has no memory installed");
        let base = chunk.map(0, PAGE_SIZE).unwrap();
        unsafe { base.as_ptr().add(offset).read() }
    }
}

#[async_trait(?Send)]
impl PciDevice for MockPciDevice {
    async fn pci_info(&self) -> Result<PciInfo, VirtioError> {
        Ok(PciInfo {
            caps: self
                .caps
                .iter()
                .map(|cap| PciCapability { kind: cap.kind })
                .collect(),
            bars: self.bars,
        })
    }

    async fn access_bar(&self, index: usize) -> Result<Bar, VirtioError> {
        if let Some(chunk) = self.bar_memory.lock().get(&index) {
            return Ok(Bar::Memory(chunk.clone()));
        }
        match self.bars[index].kind {
            BarKind::Port => Ok(Bar::Port(self.bars[index].address as u16)),
            _ => Err(VirtioError::HostDeviceFailure),
        }
    }

    async fn access_irq(&self) -> Result<Arc<dyn IrqObject>, VirtioError> {
        Ok(self.irq.clone())
    }

    async fn install_msi(&self, _vector: u32) -> Result<Arc<dyn IrqObject>, VirtioError> {
        match &self.msi {
            Some(msi) => Ok(msi.clone()),
            None => Err(VirtioError::IrqFailure),
        }
    }

    async fn enable_msi(&self) -> Result<bool, VirtioError> {
        Ok(self.msi.is_some())
    }

    async fn enable_busmaster(&self) -> Result<(), VirtioError> {
        Ok(())
    }

    async fn enable_bus_irq(&self) -> Result<(), VirtioError> {
        Ok(())
    }

    async fn load_pci_capability(
        &self,
        index: usize,
        offset: u32,
        _size: u32,
    ) -> Result<u32, VirtioError> {
        let cap = &self.caps[index];
        Ok(match offset {
            3 => cap.subtype,
            4 => cap.bar,
            8 => cap.offset,
            12 => cap.length,
            16 => cap.multiplier,
            _ => 0,
        })
    }

    async fn claim_device(&self) -> Result<(), VirtioError> {
        Ok(())
    }
}

/// Task dispatcher that collects spawned futures instead of running them.
pub(crate) struct CollectRuntime {
    pub tasks: Mutex<Vec<LocalBoxFuture<'static, ()>>>,
}

impl CollectRuntime {
    pub fn new() -> CollectRuntime {
        CollectRuntime {
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Runtime for CollectRuntime {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        self.tasks.lock().push(task);
    }
}
