//! Agent-token resolution from SSM Parameter Store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to read parameter {name}: {message}")]
    Fetch { name: String, message: String },

    #[error("parameter {0} has no value")]
    Empty(String),
}

pub struct SecretResolver {
    client: aws_sdk_ssm::Client,
}

impl SecretResolver {
    pub fn new(cfg: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(cfg),
        }
    }

    /// Fetch a single decrypted parameter.
    pub async fn fetch_token(&self, key: &str) -> Result<String, SecretError> {
        let output = self
            .client
            .get_parameter()
            .name(key)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| SecretError::Fetch {
                name: key.to_string(),
                message: e.to_string(),
            })?;

        output
            .parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| SecretError::Empty(key.to_string()))
    }
}
