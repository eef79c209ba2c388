use common::{SessionError, StatusSnapshot};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::affinity::CoreAllocator;
use super::{spawn_session, SessionDeps, SessionHandle, SessionSettings};
use crate::config::DeviceConfig;

/// 会话注册表
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Arc<SessionHandle>>>,
    settings: SessionSettings,
    deps: SessionDeps,
    /// 启用绑核时的核心分配器
    cores: Option<Arc<Mutex<CoreAllocator>>>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings, deps: SessionDeps, pin_sessions: bool) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            settings,
            deps,
            cores: pin_sessions.then(|| Arc::new(Mutex::new(CoreAllocator::detect()))),
        }
    }

    /// 为设备启动会话
    pub fn add(&self, device: DeviceConfig) -> Result<Arc<SessionHandle>, SessionError> {
        if self.sessions.contains_key(&device.id) {
            return Err(SessionError::Configuration(format!(
                "Device {} already has a session",
                device.id
            )));
        }

        let core = self.cores.as_ref().and_then(|cores| {
            cores
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .next_core()
        });

        info!("Adding session for device {} ({})", device.id, device.address);
        let id = device.id.clone();
        let handle = Arc::new(spawn_session(device, &self.settings, self.deps.clone(), core));
        self.sessions.insert(id, handle.clone());
        Ok(handle)
    }

    /// 移除并停止会话
    pub fn remove(&self, device_id: &str) -> Option<Arc<SessionHandle>> {
        let (_, handle) = self.sessions.remove(device_id)?;
        info!("Removing session for device {}", device_id);
        handle.shutdown();
        Some(handle)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// 所有会话的状态快照（按设备ID排序）
    pub fn statuses(&self) -> Vec<Arc<StatusSnapshot>> {
        let mut statuses: Vec<_> = self.sessions.iter().map(|entry| entry.value().status()).collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 停止全部会话并等待退出
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let handles: Vec<_> = ids.iter().filter_map(|id| self.remove(id)).collect();
        for handle in handles {
            handle.stopped().await;
        }
    }
}
