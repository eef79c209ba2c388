// 设备会话
//
// 每台设备一个会话：监督器是会话内所有状态的唯一写入方，外部通过命令通道驱动它，
// 通过 watch 通道读取整体替换的状态快照。

mod affinity;
mod manager;
mod policy;
mod supervisor;

pub use affinity::CoreAllocator;
pub use manager::SessionManager;
pub use policy::{backoff_interval, choose_tier, QuickRestartBudget};

#[cfg(test)]
pub(crate) use manager::tests::offline_manager;

use common::{SessionState, StatusSnapshot};
use core_affinity::CoreId;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ClientsConfig, DeviceConfig, HlsConfig, PolicyConfig};
use crate::control::ControlConnector;
use crate::credentials::CredentialResolver;
use crate::encoder::{DecoderFactory, EncoderBackend};
use crate::ingest::MediaConnector;
use crate::server::MediaHub;
use supervisor::Supervisor;

/// 命令通道容量
const COMMAND_QUEUE: usize = 16;

/// 外部发给会话的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Enable,
    Disable,
    Pause,
    Resume,
    /// 快照请求时没有缓存帧：让设备重新开始推流
    SnapshotRecovery,
}

/// 会话使用的配置
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub policy: PolicyConfig,
    pub clients: ClientsConfig,
    pub hls: HlsConfig,
    pub failure_threshold: u32,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            policy: config.policy.clone(),
            clients: config.clients.clone(),
            hls: config.hls.clone(),
            failure_threshold: config.encoder.failure_threshold,
        }
    }
}

/// 会话依赖的外部组件
#[derive(Clone)]
pub struct SessionDeps {
    pub credentials: Arc<dyn CredentialResolver>,
    pub control: Arc<dyn ControlConnector>,
    pub media: Arc<dyn MediaConnector>,
    pub decoders: Arc<dyn DecoderFactory>,
    /// 按优先顺序排列的编码候选
    pub encoders: Vec<Arc<dyn EncoderBackend>>,
}

/// 会话句柄
pub struct SessionHandle {
    device: DeviceConfig,
    hub: Arc<MediaHub>,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<Arc<StatusSnapshot>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn hub(&self) -> &Arc<MediaHub> {
        &self.hub
    }

    /// 当前状态快照
    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// 订阅状态变化
    pub fn watch_status(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.status.clone()
    }

    /// 发送命令；会话已经退出时返回false
    pub async fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// 请求快照恢复；已有请求在排队时直接忽略
    pub fn request_snapshot_recovery(&self) {
        if self.commands.try_send(SessionCommand::SnapshotRecovery).is_err() {
            debug!("Snapshot recovery already pending for {}", self.device.id);
        }
    }

    /// 停止会话并释放全部资源
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// 等待会话任务退出
    pub async fn stopped(&self) {
        let mut status = self.status.clone();
        while status.changed().await.is_ok() {}
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 启动一个会话
///
/// 指定核心时会话运行在独占的绑核线程上（单线程运行时），否则作为普通任务运行。
pub fn spawn_session(
    device: DeviceConfig,
    settings: &SessionSettings,
    deps: SessionDeps,
    core: Option<CoreId>,
) -> SessionHandle {
    let hub = Arc::new(MediaHub::new(device.id.clone(), settings.clients.clone(), &settings.hls));
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (status_tx, status_rx) = watch::channel(Arc::new(StatusSnapshot::new(device.id.clone())));
    let cancel = CancellationToken::new();

    let parts = supervisor::Parts {
        device: device.clone(),
        policy: settings.policy.clone(),
        failure_threshold: settings.failure_threshold,
        deps,
        hub: hub.clone(),
        commands: command_rx,
        status: status_tx,
        cancel: cancel.clone(),
    };

    match core {
        Some(core) => spawn_pinned(parts, core),
        None => {
            tokio::spawn(async move { Supervisor::new(parts).run().await });
        }
    }

    SessionHandle {
        device,
        hub,
        commands: command_tx,
        status: status_rx,
        cancel,
    }
}

fn spawn_pinned(parts: supervisor::Parts, core: CoreId) {
    let name = format!("session-{}", parts.device.id);
    let device_id = parts.device.id.clone();

    // 线程创建失败时退回普通任务，parts 需要留在这一侧
    let (tx, rx) = std::sync::mpsc::sync_channel::<supervisor::Parts>(1);
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        let Ok(parts) = rx.recv() else {
            return;
        };
        if !core_affinity::set_for_current(core) {
            warn!("⚠️  Failed to pin {} to core {}", parts.device.id, core.id);
        }
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(async move { Supervisor::new(parts).run().await }),
            Err(e) => error!("Failed to build runtime for {}: {}", parts.device.id, e),
        }
    });

    match spawned {
        Ok(_) => {
            info!("✓ Session {} pinned to core {}", device_id, core.id);
            let _ = tx.send(parts);
        }
        Err(e) => {
            warn!("⚠️  Failed to spawn session thread for {}: {}, using shared runtime", device_id, e);
            tokio::spawn(async move { Supervisor::new(parts).run().await });
        }
    }
}
