use tokio::task::JoinHandle;

/// 持有后台任务，离开作用域时中止
///
/// 各阶段的读取任务（ffmpeg输出、MQTT事件循环）都挂在这个守卫上，
/// 阶段对象被丢弃时任务随之结束。
#[derive(Debug)]
pub struct AbortOnDrop<T = ()>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
