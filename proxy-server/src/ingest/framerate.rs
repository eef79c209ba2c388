// 输入帧率测量
//
// 基于接收时间的滑动窗口测量，不依赖源端声明的帧率。
// 测得的帧率作为编码器的速率提示，并写入状态快照。

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// 默认窗口长度
const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// 窗口内最少样本数
const MIN_SAMPLES: usize = 3;

/// 滑动窗口帧率计
#[derive(Debug)]
pub struct FrameRateMeter {
    window: Duration,
    arrivals: VecDeque<Instant>,
    /// 上一次上报的帧率（用于变化检测）
    reported_fps: Option<f64>,
}

impl FrameRateMeter {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            arrivals: VecDeque::new(),
            reported_fps: None,
        }
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    /// 记录一帧的到达时间
    pub fn record_at(&mut self, at: Instant) {
        self.arrivals.push_back(at);
        while let Some(front) = self.arrivals.front() {
            if at.duration_since(*front) > self.window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
    }

    /// 当前帧率；样本不足时返回None
    pub fn fps(&self) -> Option<f64> {
        if self.arrivals.len() < MIN_SAMPLES {
            return None;
        }
        let first = self.arrivals.front()?;
        let last = self.arrivals.back()?;
        let span = last.duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return None;
        }
        Some((self.arrivals.len() - 1) as f64 / span)
    }

    /// 取帧率，若与上次上报相差超过10%则返回Some
    pub fn changed(&mut self) -> Option<f64> {
        let fps = self.fps()?;
        let changed = match self.reported_fps {
            Some(previous) => ((fps - previous).abs() / previous) > 0.10,
            None => true,
        };
        if changed {
            debug!("Input frame rate now {:.2} fps", fps);
            self.reported_fps = Some(fps);
            Some(fps)
        } else {
            None
        }
    }

    /// 流中断后重新计量
    pub fn reset(&mut self) {
        self.arrivals.clear();
        self.reported_fps = None;
    }
}

impl Default for FrameRateMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_rate() {
        let mut meter = FrameRateMeter::new();
        let start = Instant::now();
        for i in 0..30 {
            meter.record_at(start + Duration::from_millis(i * 50));
        }
        let fps = meter.fps().unwrap();
        assert!((fps - 20.0).abs() < 0.5, "fps = {}", fps);
    }

    #[test]
    fn test_window_follows_rate_change() {
        let mut meter = FrameRateMeter::with_window(Duration::from_secs(2));
        let start = Instant::now();
        // 先30fps，再10fps
        let mut t = start;
        for _ in 0..60 {
            t += Duration::from_millis(33);
            meter.record_at(t);
        }
        for _ in 0..30 {
            t += Duration::from_millis(100);
            meter.record_at(t);
        }
        let fps = meter.fps().unwrap();
        assert!((fps - 10.0).abs() < 0.5, "fps = {}", fps);
    }

    #[test]
    fn test_insufficient_samples() {
        let mut meter = FrameRateMeter::new();
        assert!(meter.fps().is_none());
        meter.record();
        meter.record();
        assert!(meter.fps().is_none());
        assert!(meter.changed().is_none());
    }

    #[test]
    fn test_change_detection() {
        let mut meter = FrameRateMeter::new();
        let start = Instant::now();
        for i in 0..10 {
            meter.record_at(start + Duration::from_millis(i * 100));
        }
        assert!(meter.changed().is_some());
        // 帧率不变时不重复上报
        meter.record_at(start + Duration::from_millis(1000));
        assert!(meter.changed().is_none());
    }
}
