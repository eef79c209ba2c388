// 客户端队列与扇出
//
// 每个客户端拥有独立的有界队列，一个慢客户端不会影响其他客户端。
// 订阅对象被丢弃时（响应体被丢弃）自动从注册表中移除。

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// 队列满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// 丢弃最旧的条目（MJPEG）
    DropOldest,
    /// 清空队列并标记不连续，客户端在下一个关键帧重新同步（FLV）
    Discontinuity,
}

/// 从队列取出的结果
#[derive(Debug, PartialEq)]
pub enum Pulled<T> {
    Item(T),
    /// 中间有数据被丢弃
    Discontinuity,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    discontinuity: bool,
    closed: bool,
    last_pull: Instant,
}

/// 单个客户端的有界队列（单消费者）
#[derive(Debug)]
pub struct ClientQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> ClientQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(64)),
                discontinuity: false,
                closed: false,
                last_pull: Instant::now(),
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // 持锁期间不会panic，中毒时沿用内部数据
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: T) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            if state.items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                    }
                    OverflowPolicy::Discontinuity => {
                        state.items.clear();
                        state.discontinuity = true;
                    }
                }
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// 等待下一个条目；队列被关闭后返回None（取消安全）
    pub async fn pull(&self) -> Option<Pulled<T>> {
        loop {
            {
                let mut state = self.lock();
                state.last_pull = Instant::now();
                if state.closed {
                    return None;
                }
                if std::mem::take(&mut state.discontinuity) {
                    return Some(Pulled::Discontinuity);
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(Pulled::Item(item));
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 有数据积压且长时间没有被读取
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        let state = self.lock();
        !state.items.is_empty() && now.saturating_duration_since(state.last_pull) > timeout
    }
}

type Registry<T> = DashMap<u64, Arc<ClientQueue<T>>>;

/// 一对多扇出
#[derive(Debug)]
pub struct Fanout<T> {
    clients: Arc<Registry<T>>,
    next_id: AtomicU64,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T: Clone> Fanout<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
            policy,
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ClientQueue::new(self.capacity, self.policy));
        self.clients.insert(id, queue.clone());
        Subscription {
            id,
            queue,
            registry: self.clients.clone(),
        }
    }

    pub fn publish(&self, item: T) {
        for entry in self.clients.iter() {
            entry.value().push(item.clone());
        }
    }

    /// 在线订阅数
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// 驱逐失活订阅，返回驱逐数量
    pub fn reap(&self, now: Instant, timeout: Duration) -> usize {
        let stale: Vec<u64> = self
            .clients
            .iter()
            .filter(|entry| entry.value().is_stale(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        for id in &stale {
            if let Some((_, queue)) = self.clients.remove(id) {
                debug!("Evicting stale subscription {}", id);
                queue.close();
            }
        }
        stale.len()
    }
}

/// 客户端订阅（RAII）
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    queue: Arc<ClientQueue<T>>,
    registry: Arc<Registry<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn pull(&self) -> Option<Pulled<T>> {
        self.queue.pull().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
