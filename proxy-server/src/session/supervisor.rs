// 会话监督器
//
// 状态机：Stopped → Initializing → Connecting → Running ⇄ Paused，
// 失败时经 Retrying 回到 Connecting，不可恢复错误进入 Failed，Disabled 抑制一切重试。
// 每个状态持有自己需要的阶段对象，离开状态时随 Drop 释放。

use bytes::Bytes;
use chrono::Utc;
use common::{
    BackoffTier, ControlChannelError, Credentials, ErrorRecord, SessionError, SessionState, StatusSnapshot,
    StreamError,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{backoff_interval, choose_tier, QuickRestartBudget};
use super::{SessionCommand, SessionDeps};
use crate::config::{DeviceConfig, PolicyConfig};
use crate::control::{ControlChannel, ControlEvent};
use crate::encoder::{EncoderPipeline, H264Output, PipelineEvent, PipelineOutput, PipelineState, Produced};
use crate::ingest::{FrameRateMeter, FrameStream, IngestFrame, MediaSource};
use crate::server::MediaHub;

/// 状态统计刷新间隔
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// 构建监督器所需的全部对象
pub(super) struct Parts {
    pub device: DeviceConfig,
    pub policy: PolicyConfig,
    pub failure_threshold: u32,
    pub deps: SessionDeps,
    pub hub: Arc<MediaHub>,
    pub commands: mpsc::Receiver<SessionCommand>,
    pub status: watch::Sender<Arc<StatusSnapshot>>,
    pub cancel: CancellationToken,
}

/// 阻塞操作被打断的原因
enum Interrupt {
    Disable,
    Shutdown,
}

impl Interrupt {
    fn next_state(self) -> Option<SessionState> {
        match self {
            Interrupt::Disable => Some(SessionState::Disabled),
            Interrupt::Shutdown => None,
        }
    }
}

/// 状态内的操作无法继续的原因
enum Halt {
    Error(SessionError),
    Interrupted(Interrupt),
}

impl From<SessionError> for Halt {
    fn from(error: SessionError) -> Self {
        Halt::Error(error)
    }
}

/// 运行期间的唤醒来源
enum Wake {
    Shutdown,
    Command(SessionCommand),
    Control(Option<ControlEvent>),
    Tick,
    Frame(Result<Option<IngestFrame>, StreamError>),
    Produced(Produced),
    Stalled,
}

pub(super) struct Supervisor {
    device: DeviceConfig,
    policy: PolicyConfig,
    failure_threshold: u32,
    deps: SessionDeps,
    source: Arc<dyn MediaSource>,
    hub: Arc<MediaHub>,

    commands: mpsc::Receiver<SessionCommand>,
    /// 阻塞操作期间收到、留给后续状态处理的命令
    deferred: VecDeque<SessionCommand>,
    cancel: CancellationToken,
    status: watch::Sender<Arc<StatusSnapshot>>,
    snapshot: StatusSnapshot,
    ticker: Interval,

    credentials: Option<Credentials>,
    control: Option<Box<dyn ControlChannel>>,
    stream: Option<Box<dyn FrameStream>>,
    pipeline: Option<EncoderPipeline>,
    pipeline_state: Option<PipelineState>,

    meter: FrameRateMeter,
    budget: QuickRestartBudget,
    last_frame: Instant,
}

impl Supervisor {
    /// 必须在会话所在的运行时内调用
    pub(super) fn new(parts: Parts) -> Self {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            source: parts.deps.media.source(&parts.device),
            snapshot: StatusSnapshot::new(parts.device.id.clone()),
            budget: QuickRestartBudget::new(parts.policy.quick_restart_attempts),
            pipeline_state: Some(PipelineState::new(parts.deps.encoders.clone())),
            device: parts.device,
            policy: parts.policy,
            failure_threshold: parts.failure_threshold,
            deps: parts.deps,
            hub: parts.hub,
            commands: parts.commands,
            deferred: VecDeque::new(),
            cancel: parts.cancel,
            status: parts.status,
            ticker,
            credentials: None,
            control: None,
            stream: None,
            pipeline: None,
            meter: FrameRateMeter::new(),
            last_frame: Instant::now(),
        }
    }

    pub(super) async fn run(mut self) {
        info!("🚀 Session {} started ({})", self.device.id, self.source.describe());

        let mut state = if self.device.enabled {
            SessionState::Initializing
        } else {
            SessionState::Stopped
        };

        loop {
            self.enter(state);
            let next = match state {
                SessionState::Stopped => self.stopped().await,
                SessionState::Initializing => self.initialize().await,
                SessionState::Connecting => self.connect().await,
                SessionState::Running => self.running().await,
                SessionState::Paused => self.paused().await,
                SessionState::Retrying => self.retrying().await,
                SessionState::Failed => self.failed().await,
                SessionState::Disabled => self.disabled().await,
            };
            match next {
                Some(next) => state = next,
                None => break,
            }
        }

        self.release_all().await;
        self.enter(SessionState::Stopped);
        info!("Session {} stopped", self.device.id);
    }

    // ---------------------------------------------------------------
    // 状态
    // ---------------------------------------------------------------

    async fn stopped(&mut self) -> Option<SessionState> {
        self.release_all().await;
        loop {
            match self.next_command().await? {
                SessionCommand::Enable => return Some(SessionState::Initializing),
                SessionCommand::Disable => return Some(SessionState::Disabled),
                other => debug!("{}: ignoring {:?} while stopped", self.device.id, other),
            }
        }
    }

    async fn initialize(&mut self) -> Option<SessionState> {
        self.release_stream();
        self.close_control().await;
        self.credentials = None;

        let resolved = match race(
            &mut self.commands,
            &mut self.deferred,
            &self.cancel,
            self.deps.credentials.resolve(&self.device),
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(interrupt) => return interrupt.next_state(),
        };

        match resolved {
            Ok(credentials) => {
                info!("✓ Credentials resolved for {}", self.device.id);
                self.credentials = Some(credentials);
                Some(SessionState::Connecting)
            }
            Err(e) => self.fail_with(e.into()).await,
        }
    }

    async fn connect(&mut self) -> Option<SessionState> {
        self.budget.reset();
        self.snapshot.quick_restarts = 0;

        let Some(credentials) = self.credentials.clone() else {
            return Some(SessionState::Initializing);
        };

        if !self.control.as_ref().is_some_and(|control| control.is_connected()) {
            self.close_control().await;
            let mut channel = self.deps.control.channel(&self.device, &credentials);
            let connected = match race(&mut self.commands, &mut self.deferred, &self.cancel, channel.connect()).await
            {
                Ok(connected) => connected,
                Err(interrupt) => return interrupt.next_state(),
            };
            match connected {
                Ok(identity) => {
                    info!(
                        "✓ Control channel active for {}: {} ({})",
                        self.device.id, identity.device_id, identity.model_code
                    );
                    self.snapshot.identity = Some(identity);
                    self.control = Some(channel);
                }
                Err(e) => {
                    channel.close().await;
                    // 凭据可能已经轮换，下次重新读取
                    self.credentials = None;
                    return self.fail_with(e.into()).await;
                }
            }

            if self.device.announce_upstream {
                if let Some(control) = self.control.as_mut() {
                    if let Err(e) = control.announce_proxy().await {
                        warn!("⚠️  Proxy announcement failed for {}: {}", self.device.id, e);
                    }
                }
            }
        }

        if let Err(e) = self.issue_start().await {
            return self.fail_with(e).await;
        }

        match self.open_stream().await {
            Ok(stream) => self.attach_stream(stream),
            Err(halt) => return self.halt(halt).await,
        }

        // 等待第一帧
        let deadline = Instant::now() + self.policy.first_frame_timeout;
        loop {
            match self.wait(deadline, false).await {
                Wake::Shutdown => return None,
                Wake::Command(SessionCommand::Disable) => return Some(SessionState::Disabled),
                Wake::Command(other) => self.deferred.push_back(other),
                Wake::Control(Some(ControlEvent::ExternalStopDetected { msgid })) => {
                    debug!("{}: external stop {} before first frame", self.device.id, msgid);
                    if let Err(e) = self.issue_start().await {
                        return self.fail_with(e).await;
                    }
                }
                Wake::Control(Some(ControlEvent::ChannelLost(e))) => return self.fail_with(e.into()).await,
                Wake::Control(None) => return self.fail_with(ControlChannelError::ChannelClosed.into()).await,
                Wake::Tick => self.on_tick(),
                Wake::Frame(Ok(Some(frame))) => {
                    return match self.on_frame(frame).await {
                        Ok(()) => Some(SessionState::Running),
                        Err(e) => self.fail_with(e).await,
                    };
                }
                Wake::Frame(Ok(None)) => {
                    let e = StreamError::MidStreamDrop("stream ended before the first frame".to_string());
                    return self.fail_with(e.into()).await;
                }
                Wake::Frame(Err(e)) => return self.fail_with(e.into()).await,
                Wake::Produced(produced) => {
                    if let Err(e) = self.on_produced(produced).await {
                        return self.fail_with(e).await;
                    }
                }
                Wake::Stalled => {
                    let e = StreamError::Stalled(self.policy.first_frame_timeout.as_millis() as u64);
                    return self.fail_with(e.into()).await;
                }
            }
        }
    }

    async fn running(&mut self) -> Option<SessionState> {
        loop {
            let deadline = self.last_frame + self.policy.stall_timeout;
            match self.wait(deadline, true).await {
                Wake::Shutdown => return None,
                Wake::Command(command) => match command {
                    SessionCommand::Disable => return Some(SessionState::Disabled),
                    SessionCommand::Pause => return Some(SessionState::Paused),
                    SessionCommand::SnapshotRecovery => {
                        if let Err(e) = self.issue_start().await {
                            return self.fail_with(e).await;
                        }
                    }
                    SessionCommand::Enable | SessionCommand::Resume => {}
                },
                Wake::Control(Some(ControlEvent::ExternalStopDetected { msgid })) => {
                    warn!("⚠️  {}: capture stopped externally ({}), restarting", self.device.id, msgid);
                    let reason = SessionError::Stream(StreamError::MidStreamDrop(
                        "capture stopped by another client".to_string(),
                    ));
                    if let Err(halt) = self.quick_restart(reason).await {
                        return self.halt(halt).await;
                    }
                }
                Wake::Control(Some(ControlEvent::ChannelLost(e))) => return self.fail_with(e.into()).await,
                Wake::Control(None) => return self.fail_with(ControlChannelError::ChannelClosed.into()).await,
                Wake::Tick => self.on_tick(),
                Wake::Frame(Ok(Some(frame))) => {
                    if let Err(e) = self.on_frame(frame).await {
                        return self.fail_with(e).await;
                    }
                }
                Wake::Frame(Ok(None)) => {
                    let reason = StreamError::MidStreamDrop("stream ended".to_string()).into();
                    if let Err(halt) = self.quick_restart(reason).await {
                        return self.halt(halt).await;
                    }
                }
                Wake::Frame(Err(e @ StreamError::MidStreamDrop(_))) => {
                    if let Err(halt) = self.quick_restart(e.into()).await {
                        return self.halt(halt).await;
                    }
                }
                Wake::Frame(Err(e)) => return self.fail_with(e.into()).await,
                Wake::Produced(produced) => {
                    if let Err(e) = self.on_produced(produced).await {
                        return self.fail_with(e).await;
                    }
                }
                Wake::Stalled => {
                    warn!(
                        "⚠️  {}: no frames for {:?}",
                        self.device.id, self.policy.stall_timeout
                    );
                    let e = StreamError::Stalled(self.policy.stall_timeout.as_millis() as u64);
                    return self.fail_with(e.into()).await;
                }
            }
        }
    }

    async fn paused(&mut self) -> Option<SessionState> {
        // 下游工作暂停，控制通道保持连接
        self.release_stream();

        loop {
            let wake = {
                let Self {
                    commands,
                    deferred,
                    cancel,
                    control,
                    ticker,
                    ..
                } = self;
                tokio::select! {
                    biased;
                    command = next_command(deferred, commands, cancel) => command.map_or(Wake::Shutdown, Wake::Command),
                    event = next_control_event(control) => Wake::Control(event),
                    _ = ticker.tick() => Wake::Tick,
                }
            };

            match wake {
                Wake::Shutdown => return None,
                Wake::Command(SessionCommand::Disable) => return Some(SessionState::Disabled),
                Wake::Command(SessionCommand::Resume) => {
                    if let Err(e) = self.issue_start().await {
                        return self.fail_with(e).await;
                    }
                    return match self.open_stream().await {
                        Ok(stream) => {
                            self.attach_stream(stream);
                            Some(SessionState::Running)
                        }
                        Err(halt) => self.halt(halt).await,
                    };
                }
                Wake::Command(SessionCommand::SnapshotRecovery) => {
                    if let Err(e) = self.issue_start().await {
                        return self.fail_with(e).await;
                    }
                }
                Wake::Command(_) => {}
                Wake::Control(Some(ControlEvent::ExternalStopDetected { msgid })) => {
                    debug!("{}: external stop {} while paused", self.device.id, msgid);
                }
                Wake::Control(Some(ControlEvent::ChannelLost(e))) => return self.fail_with(e.into()).await,
                Wake::Control(None) => return self.fail_with(ControlChannelError::ChannelClosed.into()).await,
                _ => self.on_tick(),
            }
        }
    }

    async fn retrying(&mut self) -> Option<SessionState> {
        self.release_stream();
        self.release_pipeline();
        if !self.control.as_ref().is_some_and(|control| control.is_connected()) {
            self.close_control().await;
        }

        let tier = self.snapshot.backoff.unwrap_or(BackoffTier::Long);
        let delay = backoff_interval(&self.policy, tier);
        info!("{}: retrying in {:?} ({:?} backoff)", self.device.id, delay, tier);

        if !self.sleep_interruptible(delay).await? {
            return Some(SessionState::Disabled);
        }

        Some(if self.credentials.is_some() {
            SessionState::Connecting
        } else {
            SessionState::Initializing
        })
    }

    async fn failed(&mut self) -> Option<SessionState> {
        self.release_stream();
        self.release_pipeline();
        self.close_control().await;
        self.credentials = None;

        info!(
            "{}: failed, next attempt in {:?}",
            self.device.id, self.policy.failed_retry_interval
        );
        if !self.sleep_interruptible(self.policy.failed_retry_interval).await? {
            return Some(SessionState::Disabled);
        }
        Some(SessionState::Initializing)
    }

    async fn disabled(&mut self) -> Option<SessionState> {
        self.release_all().await;
        self.snapshot.backoff = None;

        loop {
            match self.next_command().await? {
                SessionCommand::Enable => {
                    // 重新启用时重新探测编码器
                    if let Some(state) = self.pipeline_state.as_mut() {
                        state.reprobe();
                    }
                    return Some(SessionState::Initializing);
                }
                other => debug!("{}: ignoring {:?} while disabled", self.device.id, other),
            }
        }
    }

    // ---------------------------------------------------------------
    // 辅助
    // ---------------------------------------------------------------

    async fn next_command(&mut self) -> Option<SessionCommand> {
        next_command(&mut self.deferred, &mut self.commands, &self.cancel).await
    }

    /// 等待退避时间
    ///
    /// # 返回
    ///
    /// - `None`: 会话被关闭
    /// - `Some(false)`: 收到禁用命令
    /// - `Some(true)`: 时间到，或者快照恢复/启用命令要求立即重试
    async fn sleep_interruptible(&mut self, delay: Duration) -> Option<bool> {
        let deadline = Instant::now() + delay;
        loop {
            let wake = {
                let Self {
                    commands,
                    deferred,
                    cancel,
                    ticker,
                    ..
                } = self;
                tokio::select! {
                    biased;
                    command = next_command(deferred, commands, cancel) => command.map_or(Wake::Shutdown, Wake::Command),
                    _ = ticker.tick() => Wake::Tick,
                    _ = tokio::time::sleep_until(deadline) => Wake::Stalled,
                }
            };
            match wake {
                Wake::Shutdown => return None,
                Wake::Command(SessionCommand::Disable) => return Some(false),
                Wake::Command(SessionCommand::SnapshotRecovery | SessionCommand::Enable) => return Some(true),
                Wake::Command(other) => debug!("{}: ignoring {:?} while waiting", self.device.id, other),
                Wake::Stalled => return Some(true),
                _ => self.on_tick(),
            }
        }
    }

    /// 等待下一个事件
    async fn wait(&mut self, deadline: Instant, drain_deferred: bool) -> Wake {
        if drain_deferred {
            if let Some(command) = self.deferred.pop_front() {
                return Wake::Command(command);
            }
        }

        let Self {
            commands,
            cancel,
            control,
            ticker,
            stream,
            pipeline,
            ..
        } = self;
        tokio::select! {
            biased;
            command = recv_command(commands, cancel) => command.map_or(Wake::Shutdown, Wake::Command),
            event = next_control_event(control) => Wake::Control(event),
            _ = ticker.tick() => Wake::Tick,
            produced = next_produced(pipeline) => Wake::Produced(produced),
            frame = next_stream_frame(stream) => Wake::Frame(frame),
            _ = tokio::time::sleep_until(deadline) => Wake::Stalled,
        }
    }

    async fn issue_start(&mut self) -> Result<(), SessionError> {
        let control = self.control.as_mut().ok_or(ControlChannelError::ChannelClosed)?;
        let msgid = control.send_start().await?;
        debug!("{}: start command {} sent", self.device.id, msgid);
        Ok(())
    }

    /// 打开媒体流
    ///
    /// 打开本身受 `first_frame_timeout` 限制，等待期间仍然响应禁用和关闭。
    async fn open_stream(&mut self) -> Result<Box<dyn FrameStream>, Halt> {
        let limit = self.policy.first_frame_timeout;
        let open = tokio::time::timeout(limit, self.source.open());
        let opened = race(&mut self.commands, &mut self.deferred, &self.cancel, open)
            .await
            .map_err(Halt::Interrupted)?;
        match opened {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(SessionError::from(e).into()),
            Err(_) => {
                warn!("⚠️  {}: media stream did not open within {:?}", self.device.id, limit);
                Err(SessionError::from(StreamError::Stalled(limit.as_millis() as u64)).into())
            }
        }
    }

    async fn halt(&mut self, halt: Halt) -> Option<SessionState> {
        match halt {
            Halt::Error(e) => self.fail_with(e).await,
            Halt::Interrupted(interrupt) => interrupt.next_state(),
        }
    }

    /// 连接内快速重启：复用控制通道，重新下发开始命令并重新打开媒体流
    async fn quick_restart(&mut self, reason: SessionError) -> Result<(), Halt> {
        if !self.budget.try_consume() {
            warn!(
                "⚠️  {}: quick restart budget ({}) exhausted",
                self.device.id,
                self.budget.limit()
            );
            return Err(reason.into());
        }
        self.snapshot.quick_restarts = self.budget.used();
        self.record_error(&reason);
        info!(
            "{}: quick restart {}/{}",
            self.device.id,
            self.budget.used(),
            self.budget.limit()
        );

        self.release_stream();
        self.issue_start().await?;
        let stream = self.open_stream().await?;
        self.attach_stream(stream);
        Ok(())
    }

    fn attach_stream(&mut self, stream: Box<dyn FrameStream>) {
        if self.pipeline.is_none() {
            let state = self
                .pipeline_state
                .take()
                .unwrap_or_else(|| PipelineState::new(self.deps.encoders.clone()));
            self.pipeline = Some(EncoderPipeline::new(
                H264Output::for_device(&self.device),
                state,
                self.deps.decoders.clone(),
                self.failure_threshold,
            ));
        }
        self.stream = Some(stream);
        self.last_frame = Instant::now();
    }

    async fn on_frame(&mut self, frame: IngestFrame) -> Result<(), SessionError> {
        self.last_frame = Instant::now();
        self.meter.record();
        self.budget.recovered();

        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(());
        };
        let output = pipeline.ingest(frame).await?;
        self.publish(output);
        Ok(())
    }

    async fn on_produced(&mut self, produced: Produced) -> Result<(), SessionError> {
        match produced {
            Produced::Image(decoded) => self.on_decoded(decoded).await,
            Produced::Packet(Ok(packet)) => {
                self.hub.publish_packet(&packet);
                Ok(())
            }
            Produced::Packet(Err(e)) => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.on_encoder_error(e);
                }
                Ok(())
            }
        }
    }

    async fn on_decoded(&mut self, decoded: Result<Bytes, StreamError>) -> Result<(), SessionError> {
        let image = decoded?;
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(());
        };
        let output = pipeline.on_decoded(image).await;
        self.publish(output);
        Ok(())
    }

    fn publish(&mut self, output: PipelineOutput) {
        for frame in &output.frames {
            self.hub.publish_frame(frame);
            self.snapshot.frames += 1;
        }
        for packet in &output.packets {
            self.hub.publish_packet(packet);
        }
        for event in output.events {
            match event {
                PipelineEvent::Dimensions(width, height) => {
                    info!("{}: frame size {}x{}", self.device.id, width, height);
                    self.snapshot.width = Some(width);
                    self.snapshot.height = Some(height);
                }
                PipelineEvent::EncoderSelected(name) => self.snapshot.encoder = Some(name),
                PipelineEvent::EncoderFallback { to, reason, .. } => {
                    self.record_error(&reason.into());
                    self.snapshot.encoder = Some(to);
                }
                PipelineEvent::EncoderUnavailable(reason) => {
                    self.record_error(&reason.into());
                    self.snapshot.encoder = None;
                }
            }
        }
    }

    fn on_tick(&mut self) {
        if let Some(fps) = self.meter.changed() {
            if let Some(pipeline) = self.pipeline.as_mut() {
                pipeline.set_rate_hint(fps);
            }
        }
        self.snapshot.fps = self.meter.fps().unwrap_or(0.0);
        if let Some(pipeline) = self.pipeline.as_ref() {
            if let Some(encoder) = pipeline.active_encoder() {
                self.snapshot.encoder = Some(encoder);
            }
        }
        self.publish_status();
    }

    /// 记录错误并决定下一个状态
    async fn fail_with(&mut self, error: SessionError) -> Option<SessionState> {
        self.record_error(&error);
        if error.is_unrecoverable() {
            return Some(SessionState::Failed);
        }
        let connected = self.control.as_ref().is_some_and(|control| control.is_connected());
        let tier = choose_tier(connected, self.deps.control.as_ref(), &self.device).await;
        self.snapshot.backoff = Some(tier);
        Some(SessionState::Retrying)
    }

    fn record_error(&mut self, error: &SessionError) {
        warn!("⚠️  {}: {}", self.device.id, error);
        self.snapshot.last_error = Some(ErrorRecord::from(error));
    }

    fn enter(&mut self, state: SessionState) {
        if self.snapshot.state != state {
            info!("{}: {:?} -> {:?}", self.device.id, self.snapshot.state, state);
        }
        self.snapshot.state = state;
        if state == SessionState::Running {
            self.snapshot.backoff = None;
        }
        if state != SessionState::Running {
            self.snapshot.fps = 0.0;
        }
        self.publish_status();
    }

    fn publish_status(&mut self) {
        self.snapshot.clients = self.hub.client_counts();
        self.snapshot.updated_at = Utc::now();
        self.status.send_replace(Arc::new(self.snapshot.clone()));
    }

    /// 丢弃媒体流和解码/编码进程，保留管线的跨重连状态
    fn release_stream(&mut self) {
        let had_stream = self.stream.take().is_some();
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.reset_stream();
        }
        self.meter.reset();
        if had_stream {
            self.hub.stream_interrupted();
        }
    }

    fn release_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            self.pipeline_state = Some(pipeline.into_state());
        }
    }

    async fn close_control(&mut self) {
        if let Some(mut control) = self.control.take() {
            control.close().await;
        }
    }

    async fn release_all(&mut self) {
        self.release_stream();
        self.release_pipeline();
        self.close_control().await;
    }
}

async fn recv_command(
    commands: &mut mpsc::Receiver<SessionCommand>,
    cancel: &CancellationToken,
) -> Option<SessionCommand> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        command = commands.recv() => command,
    }
}

/// 先取积压的命令，再等待新命令；会话被关闭时返回None
async fn next_command(
    deferred: &mut VecDeque<SessionCommand>,
    commands: &mut mpsc::Receiver<SessionCommand>,
    cancel: &CancellationToken,
) -> Option<SessionCommand> {
    if let Some(command) = deferred.pop_front() {
        return Some(command);
    }
    recv_command(commands, cancel).await
}

/// 在等待阻塞操作的同时处理命令
///
/// 禁用和关闭会打断操作（操作的future被丢弃）；其他命令留给后续状态。
async fn race<F: Future>(
    commands: &mut mpsc::Receiver<SessionCommand>,
    deferred: &mut VecDeque<SessionCommand>,
    cancel: &CancellationToken,
    operation: F,
) -> Result<F::Output, Interrupt> {
    tokio::pin!(operation);
    loop {
        tokio::select! {
            biased;
            command = recv_command(commands, cancel) => match command {
                None => return Err(Interrupt::Shutdown),
                Some(SessionCommand::Disable) => return Err(Interrupt::Disable),
                Some(other) => deferred.push_back(other),
            },
            output = &mut operation => return Ok(output),
        }
    }
}

async fn next_control_event(control: &mut Option<Box<dyn ControlChannel>>) -> Option<ControlEvent> {
    match control.as_mut() {
        Some(control) => control.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_stream_frame(
    stream: &mut Option<Box<dyn FrameStream>>,
) -> Result<Option<IngestFrame>, StreamError> {
    match stream.as_mut() {
        Some(stream) => stream.next_frame().await,
        None => std::future::pending().await,
    }
}

async fn next_produced(pipeline: &mut Option<EncoderPipeline>) -> Produced {
    match pipeline.as_mut() {
        Some(pipeline) => pipeline.next_produced().await,
        None => std::future::pending().await,
    }
}
