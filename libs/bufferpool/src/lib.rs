//! A process-wide pool of reusable byte buffers for the packet path.
//!
//! Every hop on the data path (TUN read, UDP read, heartbeat injection)
//! pulls a buffer and hands it down the queue chain. Returning is tied to
//! `Drop`, so a buffer is released exactly once along every path and can
//! never be touched after release.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::BytesMut;

#[derive(Clone)]
pub struct BufferPool<B> {
    inner: Arc<lockfree_object_pool::MutexObjectPool<B>>,
}

impl<B> BufferPool<B>
where
    B: Buf,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            // Recycled buffers are restored to full capacity so a fresh pull
            // can always hold a whole packet.
            inner: Arc::new(lockfree_object_pool::MutexObjectPool::new(
                move || B::with_capacity(capacity),
                move |buf| buf.resize_to(capacity),
            )),
        }
    }

    pub fn pull(&self) -> Buffer<B> {
        Buffer {
            inner: self.inner.pull_owned(),
            pool: self.inner.clone(),
        }
    }
}

impl<B> BufferPool<B>
where
    B: Buf + DerefMut<Target = [u8]>,
{
    /// Pulls a buffer and initialises it with `data`, truncated to its length.
    pub fn pull_initialised(&self, data: &[u8]) -> Buffer<B> {
        let mut buffer = self.pull();
        let len = data.len();

        buffer.resize_to(len);
        buffer.copy_from_slice(data);

        buffer
    }
}

pub struct Buffer<B> {
    inner: lockfree_object_pool::MutexOwnedReusable<B>,
    pool: Arc<lockfree_object_pool::MutexObjectPool<B>>,
}

impl<B> Clone for Buffer<B>
where
    B: Buf,
{
    fn clone(&self) -> Self {
        let mut copy = self.pool.pull_owned();

        self.inner.deref().clone_into_buf(&mut copy);

        Self {
            inner: copy,
            pool: self.pool.clone(),
        }
    }
}

impl<B> PartialEq for Buffer<B>
where
    B: Deref<Target = [u8]>,
{
    fn eq(&self, other: &Self) -> bool {
        self.inner.deref().deref() == other.inner.deref().deref()
    }
}

impl<B> Eq for Buffer<B> where B: Deref<Target = [u8]> {}

impl<B> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Buffer").finish()
    }
}

impl<B> Deref for Buffer<B> {
    type Target = B;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl<B> DerefMut for Buffer<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.deref_mut()
    }
}

pub trait Buf: Sized + Send + 'static {
    fn with_capacity(capacity: usize) -> Self;
    fn clone_into_buf(&self, dst: &mut Self);
    fn resize_to(&mut self, len: usize);
}

impl Buf for Vec<u8> {
    fn with_capacity(capacity: usize) -> Self {
        vec![0; capacity]
    }

    fn clone_into_buf(&self, dst: &mut Self) {
        dst.resize(self.len(), 0);
        dst.copy_from_slice(self);
    }

    fn resize_to(&mut self, len: usize) {
        self.resize(len, 0);
    }
}

impl Buf for BytesMut {
    fn with_capacity(capacity: usize) -> Self {
        BytesMut::zeroed(capacity)
    }

    fn clone_into_buf(&self, dst: &mut Self) {
        dst.resize(self.len(), 0);
        dst.copy_from_slice(self);
    }

    fn resize_to(&mut self, len: usize) {
        self.resize(len, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_can_be_cloned() {
        let pool = BufferPool::<Vec<u8>>::new(1024);

        let buffer = pool.pull_initialised(b"hello world");

        #[allow(clippy::redundant_clone)]
        let buffer2 = buffer.clone();

        assert_eq!(&buffer2[..], &buffer[..]);
    }

    #[test]
    fn cloned_buffer_owns_its_own_memory() {
        let pool = BufferPool::<Vec<u8>>::new(1024);

        let buffer = pool.pull_initialised(b"hello world");

        let buffer2 = buffer.clone();
        drop(buffer);

        assert_eq!(&buffer2[..11], b"hello world");
    }

    #[test]
    fn initialised_buffer_is_only_as_long_as_content() {
        let pool = BufferPool::<Vec<u8>>::new(1024);

        let buffer = pool.pull_initialised(b"hello world");

        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn returned_buffer_is_reused() {
        let pool = BufferPool::<Vec<u8>>::new(16);

        let first = pool.pull_initialised(b"first");
        drop(first);

        let second = pool.pull_initialised(b"second");
        assert_eq!(&second[..6], b"second");
        assert_eq!(second.len(), 6);

        // A plain pull always comes back at full capacity.
        assert_eq!(pool.pull().len(), 16);
    }
}
