//! 缓冲区对象池
//!
//! 流式转码每个分片都要序列化一次 JSON，复用缓冲区可避免反复分配。

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

/// `BytesMut` 缓冲区池
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    buffer_capacity: usize,
    /// 超过该容量的缓冲区不回收
    max_retained_capacity: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(max_pooled: usize, buffer_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::with_capacity(max_pooled)),
                max_pooled,
                buffer_capacity,
                max_retained_capacity: buffer_capacity * 8,
            }),
        }
    }

    /// 取出一个清空的缓冲区，守卫释放时自动归还
    #[must_use]
    pub fn get(&self) -> PooledBuffer {
        let buffer = self
            .inner
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.buffer_capacity));
        PooledBuffer {
            buffer,
            pool: Arc::clone(&self.inner),
        }
    }

    /// 当前空闲缓冲区数量
    #[must_use]
    pub fn idle(&self) -> usize {
        self.inner
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64, 4096)
    }
}

/// 池化缓冲区守卫
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: BytesMut,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// 按 UTF-8 读取内容
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self).unwrap_or_default()
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        if buffer.capacity() > self.pool.max_retained_capacity {
            return;
        }
        buffer.clear();
        let mut buffers = self
            .pool
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.pool.max_pooled {
            buffers.push(buffer);
        }
    }
}
