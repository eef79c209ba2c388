use async_trait::async_trait;
use common::{CredentialError, Credentials, CREDENTIALS_PATH};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

use super::{parse_account_document, CredentialResolver};
use crate::config::DeviceConfig;

/// 通过SSH读取设备上的凭据文件
///
/// libssh2是阻塞接口，整个会话在 `spawn_blocking` 中完成。
pub struct SshCredentialResolver {
    timeout: Duration,
}

impl SshCredentialResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SshCredentialResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CredentialResolver for SshCredentialResolver {
    async fn resolve(&self, device: &DeviceConfig) -> Result<Credentials, CredentialError> {
        let address = device.address.clone();
        let port = device.ssh_port;
        let username = device.ssh_username.clone();
        let password = device.ssh_password.clone();
        let timeout = self.timeout;

        debug!("Reading credentials from {}:{} over SSH", address, port);

        let content = tokio::task::spawn_blocking(move || {
            read_remote_file(&address, port, &username, &password, timeout)
        })
        .await
        .map_err(|e| CredentialError::Unreachable(format!("SSH task aborted: {}", e)))??;

        let credentials = parse_account_document(&content)?;
        info!("✓ Credentials resolved for device {}", device.id);
        Ok(credentials)
    }
}

fn read_remote_file(
    address: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<String, CredentialError> {
    let unreachable = |e: &dyn std::fmt::Display| CredentialError::Unreachable(e.to_string());

    let addr = (address, port)
        .to_socket_addrs()
        .map_err(|e| unreachable(&e))?
        .next()
        .ok_or_else(|| CredentialError::Unreachable(format!("cannot resolve {}", address)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| unreachable(&e))?;

    let mut session = ssh2::Session::new().map_err(|e| unreachable(&e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis() as u32);
    session.handshake().map_err(|e| unreachable(&e))?;

    session
        .userauth_password(username, password)
        .map_err(|e| CredentialError::AuthFailed(e.to_string()))?;
    if !session.authenticated() {
        return Err(CredentialError::AuthFailed(format!(
            "server rejected user {}",
            username
        )));
    }

    let mut channel = session.channel_session().map_err(|e| unreachable(&e))?;
    channel
        .exec(&format!("cat {}", CREDENTIALS_PATH))
        .map_err(|e| unreachable(&e))?;

    let mut content = String::new();
    channel
        .read_to_string(&mut content)
        .map_err(read_error)?;
    let _ = channel.wait_close();

    match channel.exit_status() {
        Ok(0) => Ok(content),
        Ok(code) => Err(CredentialError::MalformedPayload(format!(
            "reading {} exited with status {}",
            CREDENTIALS_PATH, code
        ))),
        Err(e) => Err(unreachable(&e)),
    }
}

/// 读取文件内容时的错误分类
///
/// 只有内容本身不是合法文本才算文档错误；超时、连接重置等都按不可达处理，走退避重试。
fn read_error(e: std::io::Error) -> CredentialError {
    match e.kind() {
        std::io::ErrorKind::InvalidData => CredentialError::MalformedPayload(e.to_string()),
        _ => CredentialError::Unreachable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_read_error_classification() {
        assert!(matches!(
            read_error(Error::new(ErrorKind::InvalidData, "stream did not contain valid UTF-8")),
            CredentialError::MalformedPayload(_)
        ));
        assert!(matches!(
            read_error(Error::new(ErrorKind::TimedOut, "timed out waiting on socket")),
            CredentialError::Unreachable(_)
        ));
        assert!(matches!(
            read_error(Error::new(ErrorKind::ConnectionReset, "connection reset by peer")),
            CredentialError::Unreachable(_)
        ));
    }

    #[test]
    fn test_read_failures_stay_recoverable() {
        let error: common::SessionError = read_error(Error::new(ErrorKind::Other, "channel eof")).into();
        assert!(!error.is_unrecoverable());
    }
}
