use async_trait::async_trait;
use bytes::Bytes;
use common::{
    video_topic, ControlChannelError, Credentials, DeviceIdentity, VideoAction, VideoCommand,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::filter::{IdentityDetector, InboundVerdict, OutstandingCommands};
use super::{ControlChannel, ControlConnector, ControlEvent, ControlState};
use crate::config::{ControlConfig, DeviceConfig};
use crate::task::AbortOnDrop;

/// 事件循环转发的消息
#[derive(Debug)]
enum LoopMessage {
    Connected,
    Subscribed,
    Publish { topic: String, payload: Bytes },
    Failed(String),
}

// 设备代理使用自签证书，跳过证书验证
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn tls_transport() -> Transport {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(crypto)))
}

/// MQTT/TLS控制通道
pub struct MqttControlChannel {
    device: DeviceConfig,
    credentials: Credentials,
    settings: ControlConfig,
    state: ControlState,
    identity: Option<DeviceIdentity>,
    outstanding: OutstandingCommands,
    client: Option<AsyncClient>,
    inbound: Option<mpsc::Receiver<LoopMessage>>,
    event_loop: Option<AbortOnDrop>,
}

impl MqttControlChannel {
    pub fn new(device: DeviceConfig, credentials: Credentials, settings: ControlConfig) -> Self {
        let outstanding = OutstandingCommands::new(settings.command_expiry);
        Self {
            device,
            credentials,
            settings,
            state: ControlState::Disconnected,
            identity: None,
            outstanding,
            client: None,
            inbound: None,
            event_loop: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("camproxy-{}", Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, self.device.address.clone(), self.device.mqtt_port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_credentials(self.credentials.username.clone(), self.credentials.password.clone());
        options.set_clean_session(true);
        // 设备状态报文较大
        options.set_max_packet_size(1024 * 1024, 64 * 1024);
        options.set_transport(tls_transport());
        options
    }

    fn spawn_event_loop(&mut self) {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 64);
        let (tx, rx) = mpsc::channel(256);
        let device_id = self.device.id.clone();

        let handle = tokio::spawn(async move {
            loop {
                let message = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => LoopMessage::Connected,
                    Ok(Event::Incoming(Packet::SubAck(_))) => LoopMessage::Subscribed,
                    Ok(Event::Incoming(Packet::Publish(publish))) => LoopMessage::Publish {
                        topic: publish.topic,
                        payload: publish.payload,
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("[{}] MQTT event loop ended: {}", device_id, e);
                        let _ = tx.send(LoopMessage::Failed(e.to_string())).await;
                        break;
                    }
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        self.client = Some(client);
        self.inbound = Some(rx);
        self.event_loop = Some(AbortOnDrop::new(handle));
    }

    async fn recv_until(&mut self, deadline: tokio::time::Instant) -> Result<Option<LoopMessage>, ()> {
        let rx = match self.inbound.as_mut() {
            Some(rx) => rx,
            None => return Ok(None),
        };
        tokio::time::timeout_at(deadline, rx.recv()).await.map_err(|_| ())
    }

    fn note_identity(&mut self, detector: &IdentityDetector, topic: &str, payload: &[u8]) {
        if self.identity.is_none() {
            if let Some(identity) = detector.detect(topic, payload) {
                info!(
                    "✓ [{}] Detected device identity: {} ({})",
                    self.device.id, identity.device_id, identity.model_code
                );
                self.identity = Some(identity);
            }
        }
    }

    async fn establish(&mut self) -> Result<DeviceIdentity, ControlChannelError> {
        let detector =
            IdentityDetector::new().map_err(|e| ControlChannelError::ConnectFailed(e.to_string()))?;

        self.state = ControlState::Connecting;
        self.spawn_event_loop();

        // 等待 ConnAck
        let deadline = tokio::time::Instant::now() + self.settings.subscribe_timeout;
        loop {
            match self.recv_until(deadline).await {
                Ok(Some(LoopMessage::Connected)) => break,
                Ok(Some(LoopMessage::Failed(reason))) => {
                    return Err(ControlChannelError::ConnectFailed(reason))
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Err(ControlChannelError::ChannelClosed),
                Err(()) => {
                    return Err(ControlChannelError::ConnectFailed(
                        "timed out waiting for broker acknowledgement".to_string(),
                    ))
                }
            }
        }

        // 订阅全部主题
        let client = self.client.clone().ok_or(ControlChannelError::ChannelClosed)?;
        client
            .subscribe("#", QoS::AtMostOnce)
            .await
            .map_err(|e| ControlChannelError::ConnectFailed(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + self.settings.subscribe_timeout;
        loop {
            match self.recv_until(deadline).await {
                Ok(Some(LoopMessage::Subscribed)) => break,
                Ok(Some(LoopMessage::Publish { topic, payload })) => {
                    self.note_identity(&detector, &topic, &payload)
                }
                Ok(Some(LoopMessage::Failed(reason))) => {
                    return Err(ControlChannelError::ConnectFailed(reason))
                }
                Ok(Some(LoopMessage::Connected)) => continue,
                Ok(None) => return Err(ControlChannelError::ChannelClosed),
                Err(()) => return Err(ControlChannelError::SubscribeTimeout),
            }
        }
        self.state = ControlState::Subscribed;
        debug!("[{}] Subscribed to all topics", self.device.id);

        // 从流量中识别设备身份
        self.state = ControlState::Detecting;
        let deadline = tokio::time::Instant::now() + self.settings.detection_timeout;
        while self.identity.is_none() {
            match self.recv_until(deadline).await {
                Ok(Some(LoopMessage::Publish { topic, payload })) => {
                    self.note_identity(&detector, &topic, &payload)
                }
                Ok(Some(LoopMessage::Failed(reason))) => {
                    return Err(ControlChannelError::ConnectFailed(reason))
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Err(ControlChannelError::ChannelClosed),
                Err(()) => return Err(ControlChannelError::DetectionTimeout),
            }
        }

        self.state = ControlState::Active;
        self.identity.clone().ok_or(ControlChannelError::DetectionTimeout)
    }

    async fn publish_command(&mut self, command: VideoCommand) -> Result<String, ControlChannelError> {
        if self.state != ControlState::Active {
            return Err(ControlChannelError::ChannelClosed);
        }
        let identity = self.identity.as_ref().ok_or(ControlChannelError::ChannelClosed)?;
        let client = self.client.as_ref().ok_or(ControlChannelError::ChannelClosed)?;

        let payload = serde_json::to_vec(&command)
            .map_err(|e| ControlChannelError::PublishFailed(e.to_string()))?;
        let topic = video_topic(identity);

        self.outstanding.record(command.msgid.clone(), Instant::now());
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ControlChannelError::PublishFailed(e.to_string()))?;

        debug!("[{}] Published {:?} ({})", self.device.id, command.action, command.msgid);
        Ok(command.msgid)
    }

    fn mark_lost(&mut self) {
        self.state = ControlState::Disconnected;
        self.client = None;
        self.inbound = None;
        self.event_loop = None;
    }
}

#[async_trait]
impl ControlChannel for MqttControlChannel {
    fn state(&self) -> ControlState {
        self.state
    }

    fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    async fn connect(&mut self) -> Result<DeviceIdentity, ControlChannelError> {
        self.close().await;
        info!(
            "[{}] Connecting control channel to {}:{}",
            self.device.id, self.device.address, self.device.mqtt_port
        );

        match self.establish().await {
            Ok(identity) => {
                info!("✓ [{}] Control channel active", self.device.id);
                Ok(identity)
            }
            Err(e) => {
                warn!("⚠️  [{}] Control channel setup failed: {}", self.device.id, e);
                self.mark_lost();
                Err(e)
            }
        }
    }

    async fn send_start(&mut self) -> Result<String, ControlChannelError> {
        self.publish_command(VideoCommand::new(VideoAction::StartCapture)).await
    }

    async fn send_stop(&mut self) -> Result<String, ControlChannelError> {
        self.publish_command(VideoCommand::new(VideoAction::StopCapture)).await
    }

    async fn announce_proxy(&mut self) -> Result<(), ControlChannelError> {
        let command = VideoCommand::new(VideoAction::ProxyTakeover)
            .with_data(serde_json::json!({ "encoder": "external" }));
        self.publish_command(command).await?;
        info!("✓ [{}] Announced proxy takeover", self.device.id);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ControlEvent> {
        loop {
            let message = match self.inbound.as_mut() {
                Some(rx) => rx.recv().await,
                None => return None,
            };

            match message {
                Some(LoopMessage::Publish { payload, .. }) => {
                    if let InboundVerdict::ExternalStop { msgid } =
                        self.outstanding.classify(&payload, Instant::now())
                    {
                        return Some(ControlEvent::ExternalStopDetected { msgid });
                    }
                }
                Some(LoopMessage::Failed(reason)) => {
                    self.mark_lost();
                    return Some(ControlEvent::ChannelLost(ControlChannelError::ConnectFailed(
                        reason,
                    )));
                }
                Some(_) => continue,
                None => {
                    self.mark_lost();
                    return Some(ControlEvent::ChannelLost(ControlChannelError::ChannelClosed));
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        self.mark_lost();
    }
}

/// MQTT控制通道工厂
pub struct MqttConnector {
    settings: ControlConfig,
    reachability_timeout: Duration,
}

impl MqttConnector {
    pub fn new(settings: ControlConfig, reachability_timeout: Duration) -> Self {
        Self {
            settings,
            reachability_timeout,
        }
    }
}

#[async_trait]
impl ControlConnector for MqttConnector {
    fn channel(&self, device: &DeviceConfig, credentials: &Credentials) -> Box<dyn ControlChannel> {
        Box::new(MqttControlChannel::new(
            device.clone(),
            credentials.clone(),
            self.settings.clone(),
        ))
    }

    async fn probe(&self, device: &DeviceConfig) -> bool {
        let target = (device.address.as_str(), device.mqtt_port);
        matches!(
            tokio::time::timeout(self.reachability_timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}
