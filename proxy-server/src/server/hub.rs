// 每个设备的媒体分发中心
//
// 监督器是唯一的写入方：JPEG帧、H.264访问单元都从这里扇出到各客户端队列，
// HLS分段器在这里共享。

use bytes::Bytes;
use common::{ClientCounts, EncodedPacket, MediaFrame};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::queue::{Fanout, OverflowPolicy, Subscription};
use crate::config::{ClientsConfig, HlsConfig};
use crate::mux::{HlsSegmenter, PlaylistKind};

/// 新FLV客户端的起始数据：最近GOP + 后续订阅
pub struct FlvSubscription {
    pub seed: Vec<EncodedPacket>,
    pub subscription: Subscription<EncodedPacket>,
}

/// 设备媒体分发中心
pub struct MediaHub {
    device_id: String,
    clients: ClientsConfig,
    latest_jpeg: watch::Sender<Option<Bytes>>,
    mjpeg: Fanout<Bytes>,
    flv: Fanout<EncodedPacket>,
    /// 从最近关键帧开始的GOP；发布和订阅都在此锁内完成
    gop: Mutex<Vec<EncodedPacket>>,
    hls: Mutex<HlsSegmenter>,
    hls_version: watch::Sender<u64>,
    hls_viewers: DashMap<IpAddr, Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MediaHub {
    pub fn new(device_id: impl Into<String>, clients: ClientsConfig, hls: &HlsConfig) -> Self {
        Self {
            device_id: device_id.into(),
            mjpeg: Fanout::new(clients.mjpeg_queue, OverflowPolicy::DropOldest),
            flv: Fanout::new(clients.flv_queue, OverflowPolicy::Discontinuity),
            clients,
            latest_jpeg: watch::channel(None).0,
            gop: Mutex::new(Vec::new()),
            hls: Mutex::new(HlsSegmenter::new(hls)),
            hls_version: watch::channel(0).0,
            hls_viewers: DashMap::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn clients_config(&self) -> &ClientsConfig {
        &self.clients
    }

    /// 发布一帧JPEG
    pub fn publish_frame(&self, frame: &MediaFrame) {
        self.latest_jpeg.send_replace(Some(frame.data.clone()));
        self.mjpeg.publish(frame.data.clone());
    }

    /// 发布一个H.264访问单元
    pub fn publish_packet(&self, packet: &EncodedPacket) {
        {
            let mut gop = lock(&self.gop);
            if packet.keyframe {
                gop.clear();
                gop.push(packet.clone());
            } else if !gop.is_empty() {
                if gop.len() >= self.clients.gop_cache_limit {
                    // GOP过长，等待下一个关键帧
                    gop.clear();
                } else {
                    gop.push(packet.clone());
                }
            }
            self.flv.publish(packet.clone());
        }

        let changed = {
            let mut segmenter = lock(&self.hls);
            match segmenter.push(packet) {
                Ok(changed) => changed,
                Err(e) => {
                    warn!("⚠️  HLS segmenter rejected packet for {}: {}", self.device_id, e);
                    false
                }
            }
        };
        if changed {
            self.hls_version.send_modify(|version| *version += 1);
        }
    }

    /// 媒体流中断（重连前调用）；最后一帧JPEG保留
    pub fn stream_interrupted(&self) {
        lock(&self.gop).clear();
        lock(&self.hls).mark_discontinuity();
        self.hls_version.send_modify(|version| *version += 1);
    }

    /// 最近一帧JPEG
    pub fn latest_jpeg(&self) -> Option<Bytes> {
        self.latest_jpeg.borrow().clone()
    }

    /// 等待下一帧JPEG（快照恢复）
    pub async fn wait_for_jpeg(&self, timeout: Duration) -> Option<Bytes> {
        let mut rx = self.latest_jpeg.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|frame| frame.is_some())).await;
        match result {
            Ok(Ok(frame)) => frame.clone(),
            _ => None,
        }
    }

    pub fn subscribe_mjpeg(&self) -> Subscription<Bytes> {
        let subscription = self.mjpeg.subscribe();
        debug!("MJPEG client {} joined {}", subscription.id(), self.device_id);
        subscription
    }

    pub fn subscribe_flv(&self) -> FlvSubscription {
        let gop = lock(&self.gop);
        let subscription = self.flv.subscribe();
        debug!("FLV client {} joined {} ({} cached packets)", subscription.id(), self.device_id, gop.len());
        FlvSubscription {
            seed: gop.clone(),
            subscription,
        }
    }

    /// 记录一次HLS播放列表请求
    pub fn touch_hls_viewer(&self, viewer: IpAddr) {
        self.hls_viewers.insert(viewer, Instant::now());
    }

    pub fn hls_playlist(&self, kind: PlaylistKind) -> Option<String> {
        lock(&self.hls).playlist(kind)
    }

    pub fn hls_init(&self, generation: u32) -> Option<Bytes> {
        lock(&self.hls).init_segment(generation)
    }

    pub fn hls_segment(&self, msn: u64) -> Option<Bytes> {
        lock(&self.hls).segment(msn)
    }

    pub fn hls_part(&self, msn: u64, index: usize) -> Option<Bytes> {
        lock(&self.hls).part(msn, index)
    }

    /// 阻塞刷新：等待指定分段/部分分段可用，超时后返回false
    pub async fn wait_hls_ready(&self, msn: u64, part: Option<usize>, timeout: Duration) -> bool {
        let mut version = self.hls_version.subscribe();
        let wait = async {
            loop {
                let ready = lock(&self.hls).is_ready(msn, part);
                if ready {
                    return true;
                }
                if version.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// 等待预加载提示指向的部分分段
    pub async fn wait_hls_part(&self, msn: u64, index: usize, timeout: Duration) -> Option<Bytes> {
        let mut version = self.hls_version.subscribe();
        let wait = async {
            loop {
                {
                    let segmenter = lock(&self.hls);
                    if let Some(part) = segmenter.part(msn, index) {
                        return Some(part);
                    }
                    if !segmenter.is_upcoming_part(msn, index) {
                        return None;
                    }
                }
                if version.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// 当前客户端数
    pub fn client_counts(&self) -> ClientCounts {
        let cutoff = self.clients.liveness_timeout;
        let now = Instant::now();
        ClientCounts {
            mjpeg: self.mjpeg.len(),
            flv: self.flv.len(),
            hls: self
                .hls_viewers
                .iter()
                .filter(|entry| now.saturating_duration_since(*entry.value()) <= cutoff)
                .count(),
        }
    }

    /// 驱逐失活的客户端
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let timeout = self.clients.liveness_timeout;
        let evicted = self.mjpeg.reap(now, timeout) + self.flv.reap(now, timeout);
        self.hls_viewers
            .retain(|_, seen| now.saturating_duration_since(*seen) <= timeout);
        if evicted > 0 {
            debug!("Evicted {} stale clients from {}", evicted, self.device_id);
        }
        evicted
    }
}
