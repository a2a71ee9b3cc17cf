//! Shared storage for received frames waiting in client queues.
//!
//! Items are carved out of pages. The first item of each page is marked as
//! the page head; the page lives until the pool is dropped.

use std::mem::size_of;

use parking_lot::Mutex;

use crate::{
    adaptor::{DriverError, Result},
    protocol::ReceivedFrame,
};

pub type ItemIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOwner {
    PageHead,
    Interior,
}

#[derive(Debug, Clone, Copy)]
struct MessageItem {
    frame: ReceivedFrame,
    owner: BlockOwner,
}

struct PoolInner {
    items: Vec<MessageItem>,
    free: Vec<ItemIndex>,
    pages: usize,
}

pub struct MessageBufferPool {
    inner: Mutex<PoolInner>,
    items_per_page: usize,
    max_pages: Option<usize>,
}

impl MessageBufferPool {
    pub fn new(page_size: usize, max_pages: Option<usize>) -> Self {
        let items_per_page = (page_size / size_of::<MessageItem>()).max(1);
        Self {
            inner: Mutex::new(PoolInner {
                items: Vec::new(),
                free: Vec::new(),
                pages: 0,
            }),
            items_per_page,
            max_pages,
        }
    }

    pub fn items_per_page(&self) -> usize {
        self.items_per_page
    }

    pub fn pages(&self) -> usize {
        self.inner.lock().pages
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Copy `frame` into a free item, adding a page when none is left.
    pub fn store(&self, frame: ReceivedFrame) -> Result<ItemIndex> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            self.grow(&mut inner)?;
        }
        let index = inner
            .free
            .pop()
            .ok_or(DriverError::ResourceExhausted("message buffer free list empty"))?;
        inner.items[index].frame = frame;
        Ok(index)
    }

    fn grow(&self, inner: &mut PoolInner) -> Result<()> {
        if self.max_pages.is_some_and(|max| inner.pages >= max) {
            return Err(DriverError::ResourceExhausted("message buffer page limit reached"));
        }
        let n = self.items_per_page;
        inner
            .items
            .try_reserve_exact(n)
            .and_then(|()| inner.free.try_reserve(n))
            .map_err(|_| DriverError::ResourceExhausted("message buffer page allocation failed"))?;

        let base = inner.items.len();
        inner.items.extend((0..n).map(|i| MessageItem {
            frame: ReceivedFrame::default(),
            owner: if i == 0 {
                BlockOwner::PageHead
            } else {
                BlockOwner::Interior
            },
        }));
        inner.free.extend((base..base + n).rev());
        inner.pages += 1;
        log::debug!(
            "message buffer page {} allocated with {} items",
            inner.pages,
            n
        );
        Ok(())
    }

    /// Read an item and return it to the free list.
    pub fn take(&self, index: ItemIndex) -> ReceivedFrame {
        let mut inner = self.inner.lock();
        let frame = inner.items[index].frame;
        debug_assert!(!inner.free.contains(&index), "item {} freed twice", index);
        inner.free.push(index);
        frame
    }

    /// Replace the contents of an item that stays borrowed.
    pub fn overwrite(&self, index: ItemIndex, frame: ReceivedFrame) {
        self.inner.lock().items[index].frame = frame;
    }

    pub fn release_all(&self, indices: impl IntoIterator<Item = ItemIndex>) {
        let mut inner = self.inner.lock();
        inner.free.extend(indices);
    }
}

impl Drop for MessageBufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let heads = inner
            .items
            .iter()
            .filter(|item| item.owner == BlockOwner::PageHead)
            .count();
        if inner.free.len() != inner.items.len() {
            log::warn!(
                "{} message buffers still queued at teardown",
                inner.items.len() - inner.free.len()
            );
        }
        log::debug!("releasing {} message buffer pages", heads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CanFrame;

    fn received(n: u16) -> ReceivedFrame {
        ReceivedFrame::new(CanFrame::new_standard(n, &[]).unwrap(), u64::from(n))
    }

    #[test]
    fn test_page_growth() {
        let pool = MessageBufferPool::new(3 * size_of::<MessageItem>(), None);
        assert_eq!(pool.items_per_page(), 3);
        let first = pool.store(received(1)).unwrap();
        assert_eq!(pool.pages(), 1);
        assert_eq!(pool.free_count(), 2);
        let _ = pool.store(received(2)).unwrap();
        let _ = pool.store(received(3)).unwrap();
        let _ = pool.store(received(4)).unwrap();
        assert_eq!(pool.pages(), 2);

        assert_eq!(pool.take(first), received(1));
        assert_eq!(pool.store(received(5)).unwrap(), first);
    }

    #[test]
    fn test_page_limit() {
        let pool = MessageBufferPool::new(1, Some(2));
        assert_eq!(pool.items_per_page(), 1);
        let a = pool.store(received(1)).unwrap();
        let _ = pool.store(received(2)).unwrap();
        assert!(matches!(
            pool.store(received(3)),
            Err(DriverError::ResourceExhausted(_))
        ));
        pool.release_all([a]);
        assert!(pool.store(received(3)).is_ok());
    }

    #[test]
    fn test_overwrite() {
        let pool = MessageBufferPool::new(4096, None);
        let index = pool.store(received(1)).unwrap();
        pool.overwrite(index, received(9));
        assert_eq!(pool.take(index), received(9));
    }
}
