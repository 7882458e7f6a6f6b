//! Driver-side virtqueue state and request assembly.
//!
//! A [`Queue`] owns one virtqueue's hardware rings plus the software
//! bookkeeping around them: a free list of descriptor indices and the
//! completion slot for every in-flight chain. Requests are assembled by
//! obtaining descriptor [`Handle`]s, linking them into a [`Chain`] and
//! posting the chain head to the available ring.
//!
//! Every table index is in exactly one of two places at any time: the free
//! stack, or the active slot of an in-flight request. Violations are caller
//! bugs and assert.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{fence, Ordering};
use core::task::{Context, Poll, Waker};

use spin::Mutex;

use crate::hw::DmaSpace;
use crate::mapping::{PhysicalMapping, PAGE_SIZE};
use crate::regs::RegisterSpace;
use crate::ring::{desc_flags, ring_flags, Descriptor, RingLayout, RingView};
use crate::VirtioError;

/// Transfer direction of one buffer, seen from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device reads the buffer.
    HostToDevice,
    /// Device writes the buffer.
    DeviceToHost,
}

/// A borrowed view of a DMA-capable buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferView {
    ptr: *const u8,
    len: usize,
}

impl BufferView {
    /// View over arbitrary memory the caller guarantees to be DMA-capable
    /// and alive until the request completes.
    pub fn new(ptr: *const u8, len: usize) -> BufferView {
        BufferView { ptr, len }
    }

    pub fn from_slice(slice: &[u8]) -> BufferView {
        BufferView {
            ptr: slice.as_ptr(),
            len: slice.len(),
        }
    }

    pub fn from_mut_slice(slice: &mut [u8]) -> BufferView {
        BufferView {
            ptr: slice.as_ptr(),
            len: slice.len(),
        }
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn subview(&self, offset: usize, len: usize) -> BufferView {
        debug_assert!(offset + len <= self.len);
        BufferView {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }
}

/// Completion callback for one posted chain. Receives the number of bytes
/// the device wrote into the chain. Invoked exactly once, from the
/// interrupt-processing task, in used-ring order.
pub type Completion = Box<dyn FnOnce(usize) + Send>;

/// Wake primitive for tasks waiting on descriptor availability.
struct Doorbell {
    waiters: Mutex<Vec<Waker>>,
}

impl Doorbell {
    const fn new() -> Doorbell {
        Doorbell {
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn ring(&self) {
        let wakers: Vec<Waker> = {
            let mut waiters = self.waiters.lock();
            waiters.drain(..).collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn wait(&self) -> DoorbellWait<'_> {
        DoorbellWait {
            doorbell: self,
            registered: false,
        }
    }
}

struct DoorbellWait<'a> {
    doorbell: &'a Doorbell,
    registered: bool,
}

impl Future for DoorbellWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.registered {
            Poll::Ready(())
        } else {
            self.doorbell.waiters.lock().push(cx.waker().clone());
            self.registered = true;
            Poll::Pending
        }
    }
}

/// Mutable queue bookkeeping, guarded by one lock.
struct QueueState {
    /// LIFO stack of free table indices.
    free: Vec<u16>,
    /// Completion slot per table index; `Some` while the chain headed by
    /// that index is in flight.
    active: Vec<Option<Completion>>,
    /// Driver-side cursor into the used ring. Lives in a wider domain than
    /// the ring's 16-bit head so total throughput can be tracked.
    progress_head: u32,
}

/// One virtqueue, exclusively owned by the transport that set it up.
///
/// Never destroyed or resized; queue memory lives for the process.
pub struct Queue {
    queue_index: u16,
    queue_size: u16,
    ring: RingView,
    /// Keeps the ring region mapped.
    _region: PhysicalMapping,
    dma: Arc<dyn DmaSpace>,
    notify_space: Arc<dyn RegisterSpace>,
    notify_offset: usize,
    doorbell: Doorbell,
    state: Mutex<QueueState>,
}

// The ring pointers target memory owned by `_region`, all device-visible
// access is volatile and all software state is behind the mutex.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl core::fmt::Debug for Queue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Queue")
            .field("queue_index", &self.queue_index)
            .field("queue_size", &self.queue_size)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub(crate) fn new(
        queue_index: u16,
        queue_size: u16,
        region: PhysicalMapping,
        layout: &RingLayout,
        dma: Arc<dyn DmaSpace>,
        notify_space: Arc<dyn RegisterSpace>,
        notify_offset: usize,
    ) -> Arc<Queue> {
        debug_assert!(layout.region_size <= region.size());
        let ring = unsafe { RingView::new(region.get(), layout) };
        ring.initialize();

        // Lowest index on top of the stack; devices echo the indices back,
        // so predictable allocation order aids debugging.
        let free: Vec<u16> = (0..queue_size).rev().collect();
        let mut active = Vec::new();
        active.resize_with(queue_size as usize, || None);

        Arc::new(Queue {
            queue_index,
            queue_size,
            ring,
            _region: region,
            dma,
            notify_space,
            notify_offset,
            doorbell: Doorbell::new(),
            state: Mutex::new(QueueState {
                free,
                active,
                progress_head: 0,
            }),
        })
    }

    /// Index of this queue within its owning device.
    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    /// Number of descriptors in this virtqueue.
    pub fn num_descriptors(&self) -> usize {
        self.queue_size as usize
    }

    /// Number of currently free descriptors.
    pub fn free_descriptors(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Allocate a single descriptor, suspending until one is free.
    ///
    /// The descriptor returns to the free list automatically when the
    /// device retires the chain containing it.
    pub async fn obtain_descriptor(&self) -> Handle<'_> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(table_index) = state.free.pop() {
                    drop(state);
                    self.ring.write_descriptor(table_index, Descriptor::default());
                    return Handle {
                        queue: self,
                        table_index,
                    };
                }
            }
            self.doorbell.wait().await;
        }
    }

    /// Post a descriptor chain to the available ring.
    ///
    /// `handle` must be the head of the chain. Submission order is
    /// preserved; completion order is whatever order the device retires
    /// chains in.
    pub fn post_descriptor(&self, handle: Handle<'_>, complete: Completion) {
        debug_assert!(core::ptr::eq(handle.queue, self));

        let mut state = self.state.lock();
        let slot = &mut state.active[handle.table_index as usize];
        assert!(
            slot.is_none(),
            "descriptor {} posted while still in flight",
            handle.table_index
        );
        *slot = Some(complete);

        let head = self.ring.available_head();
        self.ring.publish_available(head, handle.table_index);

        // The device must observe the ring entry before the new head.
        fence(Ordering::SeqCst);
        self.ring.set_available_head(head.wrapping_add(1));
    }

    /// Ring the device doorbell for this queue.
    ///
    /// Skipped when the device set NO_NOTIFY in the used-ring flags; that
    /// is an optimization hint, the device promises to poll anyway.
    pub fn notify(&self) {
        fence(Ordering::SeqCst);
        if self.ring.used_flags() & ring_flags::NO_NOTIFY == 0 {
            self.notify_space
                .store16(self.notify_offset, self.queue_index);
        }
    }

    /// Drain the used ring and complete retired chains.
    ///
    /// Called from the transport's interrupt-processing task for every
    /// queue-activity interrupt. Completion callbacks run synchronously
    /// here, in used-ring order, at most once per chain.
    pub fn process_interrupt(&self) {
        loop {
            let used_head = self.ring.used_head();

            let (element, complete) = {
                let mut state = self.state.lock();
                if state.progress_head as u16 == used_head {
                    break;
                }

                // The head publication must be observed before the element.
                fence(Ordering::SeqCst);
                let element = self.ring.used_element(state.progress_head as u16);
                let table_index = element.table_index as u16;
                assert!(
                    table_index < self.queue_size,
                    "device completed invalid descriptor {}",
                    element.table_index
                );

                let complete = state.active[table_index as usize]
                    .take()
                    .unwrap_or_else(|| {
                        panic!("device completed idle descriptor {}", table_index)
                    });

                // Free the whole descriptor chain.
                let mut chain_index = table_index;
                loop {
                    let descriptor = self.ring.read_descriptor(chain_index);
                    state.free.push(chain_index);
                    if descriptor.flags & desc_flags::NEXT == 0 {
                        break;
                    }
                    chain_index = descriptor.next;
                }

                state.progress_head = state.progress_head.wrapping_add(1);
                (element, complete)
            };

            // Wake obtain_descriptor() waiters before running the callback;
            // the callback frequently posts a follow-up request.
            self.doorbell.ring();
            complete(element.written as usize);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_ring(&self) -> &RingView {
        &self.ring
    }

    #[cfg(test)]
    pub(crate) fn test_partition(&self) -> (Vec<u16>, Vec<u16>) {
        let state = self.state.lock();
        let free = state.free.clone();
        let active = state
            .active
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| i as u16)
            .collect();
        (free, active)
    }
}

/// Non-owning reference to one descriptor slot of a queue.
///
/// Only populates the slot and links chains; ownership of the index stays
/// with the queue's free list / active tracking.
#[derive(Clone, Copy)]
pub struct Handle<'q> {
    queue: &'q Queue,
    table_index: u16,
}

impl<'q> Handle<'q> {
    pub fn table_index(&self) -> u16 {
        self.table_index
    }

    /// Point the descriptor at a buffer. Device-writable buffers get the
    /// WRITE flag.
    pub fn setup_buffer(
        &self,
        direction: Direction,
        view: BufferView,
    ) -> Result<(), VirtioError> {
        assert!(!view.is_empty(), "zero-length buffer in a descriptor");

        let physical = self.queue.dma.translate(view.ptr())?;
        let mut descriptor = self.queue.ring.read_descriptor(self.table_index);
        descriptor.address = physical;
        descriptor.length = view.len() as u32;
        if direction == Direction::DeviceToHost {
            descriptor.flags |= desc_flags::WRITE;
        }
        self.queue.ring.write_descriptor(self.table_index, descriptor);
        Ok(())
    }

    /// Chain `next` after this descriptor.
    pub fn setup_link(&self, next: Handle<'q>) {
        let mut descriptor = self.queue.ring.read_descriptor(self.table_index);
        descriptor.next = next.table_index;
        descriptor.flags |= desc_flags::NEXT;
        self.queue.ring.write_descriptor(self.table_index, descriptor);
    }
}

/// An ordered sequence of descriptors forming one request.
pub struct Chain<'q> {
    handles: Vec<Handle<'q>>,
}

impl<'q> Chain<'q> {
    pub fn new() -> Chain<'q> {
        Chain {
            handles: Vec::new(),
        }
    }

    /// Append a descriptor, linking it after the current tail.
    pub fn append(&mut self, handle: Handle<'q>) {
        if let Some(tail) = self.handles.last() {
            tail.setup_link(handle);
        }
        self.handles.push(handle);
    }

    /// Head descriptor of the chain; this is what gets posted.
    pub fn front(&self) -> Handle<'q> {
        *self.handles.first().expect("empty descriptor chain")
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<'q> Default for Chain<'q> {
    fn default() -> Chain<'q> {
        Chain::new()
    }
}

/// Split an arbitrarily aligned buffer into descriptors along page
/// boundaries and append them to `chain`.
///
/// A descriptor carries one physical address and length, so a chunk must
/// never straddle a page of the underlying virtual mapping. Suspends when
/// the queue runs out of descriptors.
pub async fn scatter_gather<'q>(
    direction: Direction,
    chain: &mut Chain<'q>,
    queue: &'q Queue,
    view: BufferView,
) -> Result<(), VirtioError> {
    assert!(!view.is_empty(), "zero-length buffer in a descriptor chain");

    let mut progress = 0;
    while progress < view.len() {
        let address = view.ptr() as usize + progress;
        let until_page_end = PAGE_SIZE - (address & (PAGE_SIZE - 1));
        let chunk = core::cmp::min(view.len() - progress, until_page_end);

        let handle = queue.obtain_descriptor().await;
        handle.setup_buffer(direction, view.subview(progress, chunk))?;
        chain.append(handle);
        progress += chunk;
    }
    Ok(())
}
