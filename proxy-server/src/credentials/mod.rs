// 凭据解析
//
// 每次连接尝试前通过设备的管理通道读取控制凭据。
// 解析器只做一次请求/响应，不做内部重试，重试由会话监督器决定。

mod ssh;

pub use ssh::SshCredentialResolver;

use async_trait::async_trait;
use common::{CredentialError, Credentials, DeviceAccount};

use crate::config::DeviceConfig;

/// 凭据解析器
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, device: &DeviceConfig) -> Result<Credentials, CredentialError>;
}

/// 解析设备凭据文件
///
/// 用户名和密码都必须存在且非空，否则视为格式错误。
pub fn parse_account_document(content: &str) -> Result<Credentials, CredentialError> {
    let account: DeviceAccount = serde_json::from_str(content.trim())
        .map_err(|e| CredentialError::MalformedPayload(e.to_string()))?;

    let username = account
        .username
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CredentialError::MalformedPayload("missing username".to_string()))?;
    let password = account
        .password
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CredentialError::MalformedPayload("missing password".to_string()))?;

    Ok(Credentials {
        username,
        password,
        device_id: account.device_id.filter(|s| !s.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_document() {
        let creds = parse_account_document(
            r#"{"username":"ac_user","password":"p4ss","deviceId":"ABC123"}"#,
        )
        .unwrap();
        assert_eq!(creds.username, "ac_user");
        assert_eq!(creds.password, "p4ss");
        assert_eq!(creds.device_id.as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_parse_malformed_document() {
        let cases = [
            "",
            "{not json",
            r#"{"username":"u"}"#,
            r#"{"username":"","password":"p"}"#,
        ];
        for case in cases {
            assert!(
                matches!(parse_account_document(case), Err(CredentialError::MalformedPayload(_))),
                "accepted {:?}",
                case
            );
        }
    }
}
