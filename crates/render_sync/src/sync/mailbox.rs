//! # Lock-Free Mailbox Queue
//!
//! Unbounded multiple-producer / single-consumer queue used as the inbox of
//! every actor.
//!
//! ## Layout
//!
//! Messages live in fixed-size blocks of [`BLOCK_SLOTS`] slots. Blocks are
//! chained newest to oldest: the head block receives new messages, filling
//! its slots from the last index down to zero, and links to the previous
//! head through `next`. Reading the chain as one run of slots starting at
//! the head's newest slot gives messages from newest to oldest, so the
//! oldest message sits at offset `first + count - 1`.
//!
//! The triple (head block, newest slot, message count) is packed into one
//! 64-bit word and updated with compare-and-swap, so producers and the
//! consumer always observe a consistent triple.
//!
//! ## Slot publication
//!
//! A producer reserves a slot through the CAS and writes the payload after
//! it, then sets the slot's `written` flag. A consumer that reaches a
//! reserved slot before the payload is visible spins on that flag. This is
//! the only busy-wait in the queue and lasts at most as long as the
//! producer's move of the payload.
//!
//! ## Block recycling
//!
//! Blocks behind the one holding the oldest live message are fully consumed.
//! The consumer unlinks them and pushes them onto a tagged lock-free free
//! list, where producers pick them up again. Blocks are only deallocated
//! when the queue is dropped.

use std::cell::UnsafeCell;
use std::hint;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Number of message slots per block
pub const BLOCK_SLOTS: usize = 32;

const SEGMENT_LEN: usize = 256;
const SEGMENT_COUNT: usize = 256;
/// Block ids are 16 bits wide in the packed state; id 0 means "no block"
const MAX_BLOCKS: u32 = (SEGMENT_LEN * SEGMENT_COUNT - 1) as u32;
const NO_BLOCK: u32 = 0;

/// Queue state packed into one word: head block, newest slot, count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    head: u32,
    first: u32,
    count: u32,
}

impl State {
    fn unpack(word: u64) -> Self {
        Self {
            head: (word & 0xFFFF) as u32,
            first: ((word >> 16) & 0xFFFF) as u32,
            count: (word >> 32) as u32,
        }
    }
    
    fn pack(self) -> u64 {
        u64::from(self.head) | (u64::from(self.first) << 16) | (u64::from(self.count) << 32)
    }
}

struct Slot<T> {
    written: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Block<T> {
    slots: [Slot<T>; BLOCK_SLOTS],
    /// Next older block in the message chain
    next: AtomicU32,
    /// Next block on the free list
    free_next: AtomicU32,
}

impl<T> Block<T> {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot {
                written: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            }),
            next: AtomicU32::new(NO_BLOCK),
            free_next: AtomicU32::new(NO_BLOCK),
        }
    }
}

type Segment<T> = [AtomicPtr<Block<T>>; SEGMENT_LEN];

/// Lock-free MPSC queue
///
/// [`enqueue`](Self::enqueue) may be called from any number of threads.
/// [`pop`](Self::pop) must only be called from the single consumer thread;
/// the actor harness guarantees this by owning the consumer side.
pub struct MailboxQueue<T> {
    state: AtomicU64,
    /// Tagged free list head: `tag << 32 | block id`
    free_list: AtomicU64,
    next_block_id: AtomicU32,
    segments: Box<[AtomicPtr<Segment<T>>]>,
}

// Payloads are moved between threads but never shared.
unsafe impl<T: Send> Send for MailboxQueue<T> {}
unsafe impl<T: Send> Sync for MailboxQueue<T> {}

impl<T> MailboxQueue<T> {
    /// Create a queue with `initial_blocks` blocks ready on the free list
    pub fn new(initial_blocks: usize) -> Self {
        let queue = Self {
            state: AtomicU64::new(0),
            free_list: AtomicU64::new(0),
            next_block_id: AtomicU32::new(1),
            segments: (0..SEGMENT_COUNT).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        };
        for _ in 0..initial_blocks {
            let id = queue.allocate_block();
            queue.release_block(id);
        }
        queue
    }
    
    /// Append a message; never blocks and never fails
    ///
    /// # Panics
    /// Panics if more than `65535 * 32` messages are outstanding at once.
    pub fn enqueue(&self, value: T) {
        let mut spare = NO_BLOCK;
        let mut current = self.state.load(Ordering::Acquire);
        
        let (block_id, index) = loop {
            let state = State::unpack(current);
            let (head, index) = if state.head == NO_BLOCK || state.first == 0 {
                if spare == NO_BLOCK {
                    spare = self.take_block();
                }
                self.block(spare).next.store(state.head, Ordering::Relaxed);
                (spare, BLOCK_SLOTS as u32 - 1)
            } else {
                (state.head, state.first - 1)
            };
            
            let next = State { head, first: index, count: state.count + 1 };
            match self.state.compare_exchange_weak(current, next.pack(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break (head, index),
                Err(actual) => current = actual,
            }
        };
        
        if spare != NO_BLOCK && spare != block_id {
            self.release_block(spare);
        }
        
        let slot = &self.block(block_id).slots[index as usize];
        // The CAS above reserved this slot for this producer alone.
        unsafe { (*slot.value.get()).write(value) };
        slot.written.store(true, Ordering::Release);
    }
    
    /// Remove the oldest message, or `None` when the queue is empty
    ///
    /// Must only be called from the consumer thread.
    pub fn pop(&self) -> Option<T> {
        let mut current = self.state.load(Ordering::Acquire);
        let state = loop {
            let state = State::unpack(current);
            if state.count == 0 {
                return None;
            }
            let next = State { count: state.count - 1, ..state };
            match self.state.compare_exchange_weak(current, next.pack(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break state,
                Err(actual) => current = actual,
            }
        };
        
        let offset = state.first as usize + state.count as usize - 1;
        let mut block_id = state.head;
        for _ in 0..offset / BLOCK_SLOTS {
            block_id = self.block(block_id).next.load(Ordering::Acquire);
        }
        
        let block = self.block(block_id);
        let stale = block.next.swap(NO_BLOCK, Ordering::AcqRel);
        if stale != NO_BLOCK {
            self.release_chain(stale);
        }
        
        let slot = &block.slots[offset % BLOCK_SLOTS];
        while !slot.written.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        // Written flag observed; the consumer is the only reader of this slot.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.written.store(false, Ordering::Relaxed);
        Some(value)
    }
    
    /// Number of reserved messages not yet popped
    pub fn len(&self) -> usize {
        State::unpack(self.state.load(Ordering::Acquire)).count as usize
    }
    
    /// Check whether the queue holds no messages
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    
    /// Number of blocks allocated over the queue's lifetime
    pub fn allocated_blocks(&self) -> usize {
        (self.next_block_id.load(Ordering::Acquire) - 1) as usize
    }
    
    fn block(&self, id: u32) -> &Block<T> {
        debug_assert!(id != NO_BLOCK);
        let segment = self.segments[id as usize / SEGMENT_LEN].load(Ordering::Acquire);
        debug_assert!(!segment.is_null());
        // Ids are only handed out after their segment entry is stored, and
        // blocks live until the queue is dropped.
        unsafe {
            let block = (*segment)[id as usize % SEGMENT_LEN].load(Ordering::Acquire);
            &*block
        }
    }
    
    fn take_block(&self) -> u32 {
        let mut current = self.free_list.load(Ordering::Acquire);
        loop {
            let id = (current & 0xFFFF_FFFF) as u32;
            if id == NO_BLOCK {
                return self.allocate_block();
            }
            let tag = (current >> 32) + 1;
            let next = u64::from(self.block(id).free_next.load(Ordering::Relaxed));
            match self.free_list.compare_exchange_weak(current, (tag << 32) | next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.block(id).next.store(NO_BLOCK, Ordering::Relaxed);
                    return id;
                }
                Err(actual) => current = actual,
            }
        }
    }
    
    fn release_block(&self, id: u32) {
        let block = self.block(id);
        let mut current = self.free_list.load(Ordering::Acquire);
        loop {
            block.free_next.store((current & 0xFFFF_FFFF) as u32, Ordering::Relaxed);
            let tag = (current >> 32) + 1;
            match self.free_list.compare_exchange_weak(current, (tag << 32) | u64::from(id), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
    
    fn release_chain(&self, mut id: u32) {
        while id != NO_BLOCK {
            let next = self.block(id).next.swap(NO_BLOCK, Ordering::AcqRel);
            self.release_block(id);
            id = next;
        }
    }
    
    fn allocate_block(&self) -> u32 {
        let id = self.next_block_id.fetch_add(1, Ordering::AcqRel);
        assert!(id <= MAX_BLOCKS, "mailbox exhausted its {MAX_BLOCKS} block ids");
        
        let entry = &self.segments[id as usize / SEGMENT_LEN];
        let mut segment = entry.load(Ordering::Acquire);
        if segment.is_null() {
            let fresh: Box<Segment<T>> = Box::new(std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())));
            let fresh = Box::into_raw(fresh);
            segment = match entry.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => fresh,
                Err(existing) => {
                    // Another producer installed the segment first.
                    drop(unsafe { Box::from_raw(fresh) });
                    existing
                }
            };
        }
        
        let block = Box::into_raw(Box::new(Block::<T>::new()));
        unsafe { (*segment)[id as usize % SEGMENT_LEN].store(block, Ordering::Release) };
        id
    }
}

impl<T> Drop for MailboxQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        
        for entry in self.segments.iter() {
            let segment = entry.load(Ordering::Acquire);
            if segment.is_null() {
                continue;
            }
            // Exclusive access: no producer or consumer can observe the queue.
            unsafe {
                for block in (*segment).iter() {
                    let block = block.load(Ordering::Acquire);
                    if !block.is_null() {
                        drop(Box::from_raw(block));
                    }
                }
                drop(Box::from_raw(segment));
            }
        }
    }
}

impl<T> Default for MailboxQueue<T> {
    fn default() -> Self {
        Self::new(3)
    }
}

impl<T> std::fmt::Debug for MailboxQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxQueue")
            .field("len", &self.len())
            .field("allocated_blocks", &self.allocated_blocks())
            .finish()
    }
}
