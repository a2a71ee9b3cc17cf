//! Fixed pool of USB write slots.
//!
//! Each slot owns a message buffer and is lent to exactly one in-flight
//! transfer. Free indices live on a stack guarded by a short lock; a
//! semaphore counts them so `acquire` can wait for several at once.

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::Semaphore;

use crate::protocol::UsbMessage;

use super::{DriverError, Result};

/// Largest number of slots a pool may hold, equal to the largest batch.
pub const MAX_SLOTS: usize = 16;

pub type SlotIndex = u8;
pub type SlotSet = SmallVec<[SlotIndex; MAX_SLOTS]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotOwner {
    #[default]
    Idle,
    Standalone,
    Firmware,
    Batch {
        position: u8,
    },
}

#[derive(Debug, Default)]
struct Slot {
    message: UsbMessage,
    owner: SlotOwner,
    armed: bool,
    reuse_count: u64,
}

impl Slot {
    fn reset(&mut self) {
        self.owner = SlotOwner::Idle;
        self.armed = false;
        self.reuse_count = self.reuse_count.wrapping_add(1);
    }
}

pub struct SlotPool {
    slots: Box<[Mutex<Slot>]>,
    free: Mutex<SlotSet>,
    available: Semaphore,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_SLOTS {
            return Err(DriverError::InvalidArgument(format!(
                "slot pool capacity {} not in 1..={}",
                capacity, MAX_SLOTS
            )));
        }
        let slots = (0..capacity).map(|_| Mutex::new(Slot::default())).collect();
        // Reversed so the first acquire hands out index 0.
        let free = (0..capacity as SlotIndex).rev().collect();
        Ok(Self {
            slots,
            free: Mutex::new(free),
            available: Semaphore::new(capacity),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Wait until `count` slots are free at the same time and take them.
    ///
    /// Asking for more slots than the pool holds is a caller bug and fails
    /// right away with [`DriverError::ResourceExhausted`].
    pub async fn acquire(&self, count: usize) -> Result<SlotSet> {
        if count == 0 {
            return Err(DriverError::InvalidArgument("cannot acquire zero slots".into()));
        }
        if count > self.capacity() {
            log::error!(
                "requested {} slots but the pool only holds {}",
                count,
                self.capacity()
            );
            return Err(DriverError::ResourceExhausted("slot request exceeds pool capacity"));
        }

        let permit = self.available.acquire_many(count as u32).await?;
        permit.forget();

        let mut free = self.free.lock();
        let Some(start) = free.len().checked_sub(count) else {
            drop(free);
            self.available.add_permits(count);
            return Err(DriverError::ResourceExhausted("slot free list out of sync"));
        };
        let taken: SlotSet = free.drain(start..).collect();
        debug_assert!(check_free_indices(&free, self.capacity()));
        drop(free);

        log::trace!("acquired slots {:?}", taken.as_slice());
        Ok(taken)
    }

    /// Store the message a slot will carry and tag it with its owner.
    pub(crate) fn arm(&self, index: SlotIndex, owner: SlotOwner, message: UsbMessage) {
        if let Some(slot) = self.slots.get(usize::from(index)) {
            let mut slot = slot.lock();
            debug_assert!(!slot.armed, "slot {} armed twice", index);
            slot.message = message;
            slot.owner = owner;
            slot.armed = true;
        }
    }

    #[cfg(test)]
    fn message(&self, index: SlotIndex) -> Option<UsbMessage> {
        self.slots.get(usize::from(index)).map(|slot| slot.lock().message)
    }

    #[cfg(test)]
    fn owner(&self, index: SlotIndex) -> Option<SlotOwner> {
        self.slots.get(usize::from(index)).map(|slot| slot.lock().owner)
    }

    /// Ready slots for another submission. The message buffers are kept.
    pub fn reuse(&self, indices: &[SlotIndex]) {
        for &index in indices {
            if let Some(slot) = self.slots.get(usize::from(index)) {
                slot.lock().reset();
            }
        }
    }

    pub fn release(&self, indices: &[SlotIndex]) {
        if indices.is_empty() {
            return;
        }
        let mut free = self.free.lock();
        free.extend_from_slice(indices);
        debug_assert!(check_free_indices(&free, self.capacity()));
        drop(free);

        self.available.add_permits(indices.len());
        log::trace!("released slots {:?}", indices);
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("free", &self.free.lock().as_slice())
            .finish()
    }
}

/// No index twice, none out of range.
fn check_free_indices(free: &[SlotIndex], capacity: usize) -> bool {
    if free.len() > capacity {
        log::error!("free index count {} exceeds capacity {}", free.len(), capacity);
        return false;
    }
    let mut seen = 0u32;
    for &index in free {
        if usize::from(index) >= capacity {
            log::error!("free index {} out of bounds {}", index, capacity);
            return false;
        }
        let bit = 1u32 << index;
        if seen & bit != 0 {
            log::error!("free index {} listed twice", index);
            return false;
        }
        seen |= bit;
    }
    true
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;
    use crate::protocol::CommandId;

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = SlotPool::new(4).unwrap();
        let first = pool.acquire(3).await.unwrap();
        assert_eq!(first.as_slice(), &[2, 1, 0]);
        assert_eq!(pool.free_count(), 1);

        pool.arm(first[0], SlotOwner::Batch { position: 0 }, UsbMessage::new(CommandId::TransmitMessageEv));
        assert_eq!(pool.owner(first[0]), Some(SlotOwner::Batch { position: 0 }));
        pool.reuse(&first);
        assert_eq!(pool.owner(first[0]), Some(SlotOwner::Idle));
        assert_eq!(pool.message(first[0]).unwrap().command(), 0xA3);

        pool.release(&first);
        assert_eq!(pool.free_count(), 4);
    }

    #[tokio::test]
    async fn test_acquire_errors() {
        let pool = SlotPool::new(2).unwrap();
        assert!(matches!(pool.acquire(0).await, Err(DriverError::InvalidArgument(_))));
        assert!(matches!(pool.acquire(3).await, Err(DriverError::ResourceExhausted(_))));
        assert!(SlotPool::new(0).is_err());
        assert!(SlotPool::new(17).is_err());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(SlotPool::new(2).unwrap());
        let held = pool.acquire(2).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(&held[..1]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(&held[1..]);
        let taken = waiter.await.unwrap().unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(pool.free_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_release() {
        let pool = Arc::new(SlotPool::new(MAX_SLOTS).unwrap());
        let outstanding = Arc::new(AtomicUsize::new(0));
        let owners: Arc<Vec<AtomicUsize>> = Arc::new((0..MAX_SLOTS).map(|_| AtomicUsize::new(0)).collect());

        let mut tasks = Vec::new();
        for worker in 0..8usize {
            let pool = Arc::clone(&pool);
            let outstanding = Arc::clone(&outstanding);
            let owners = Arc::clone(&owners);
            tasks.push(tokio::spawn(async move {
                for round in 0..200usize {
                    let count = 1 + (worker + round) % 5;
                    let slots = pool.acquire(count).await.unwrap();
                    outstanding.fetch_add(count, Ordering::SeqCst);
                    for &index in &slots {
                        assert_eq!(owners[index as usize].fetch_add(1, Ordering::SeqCst), 0);
                    }
                    assert!(outstanding.load(Ordering::SeqCst) <= MAX_SLOTS);
                    tokio::task::yield_now().await;
                    for &index in &slots {
                        owners[index as usize].fetch_sub(1, Ordering::SeqCst);
                    }
                    outstanding.fetch_sub(count, Ordering::SeqCst);
                    pool.release(&slots);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.free_count(), MAX_SLOTS);
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_check_free_indices() {
        assert!(check_free_indices(&[0, 3, 1], 4));
        assert!(!check_free_indices(&[0, 0], 4));
        assert!(!check_free_indices(&[4], 4));
    }
}
