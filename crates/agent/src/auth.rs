use async_trait::async_trait;
use common::{issue_device_token, AgentKeypair};

/// Issues the credential a device uses to talk to the registry on its own.
#[async_trait]
pub trait DeviceTokenIssuer: Send + Sync {
    async fn create_device_token(&self, device_id: &str) -> anyhow::Result<String>;
}

/// Signs device credentials with the agent's own key.
pub struct KeypairTokenIssuer {
    keypair: AgentKeypair,
    agent_id: String,
    ttl_secs: u64,
}

impl KeypairTokenIssuer {
    pub fn new(keypair: AgentKeypair, agent_id: impl Into<String>, ttl_secs: u64) -> Self {
        Self { keypair, agent_id: agent_id.into(), ttl_secs }
    }
}

#[async_trait]
impl DeviceTokenIssuer for KeypairTokenIssuer {
    async fn create_device_token(&self, device_id: &str) -> anyhow::Result<String> {
        issue_device_token(&self.keypair, device_id, &self.agent_id, self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_token_is_scoped_to_device() {
        let keys = AgentKeypair::generate();
        let issuer = KeypairTokenIssuer::new(keys.clone(), "agent-1", 60);
        let token = issuer.create_device_token("dev-9").await.unwrap();
        let claims = common::verify_device_token(&keys.public_bs58, &token).unwrap();
        assert_eq!(claims.sub, "dev-9");
        assert_eq!(claims.agent, "agent-1");
    }
}
