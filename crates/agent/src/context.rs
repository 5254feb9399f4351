use std::sync::Arc;

use common::{doc_path, Registry, AGENTS};

use crate::auth::DeviceTokenIssuer;
use crate::bridge::BridgeClient;
use crate::state::AgentSettings;

/// Collaborators shared by the controller and the actions it starts.
pub struct AgentContext {
    pub agent_id: String,
    pub settings: AgentSettings,
    pub bridge: Arc<dyn BridgeClient>,
    pub registry: Arc<dyn Registry>,
    pub tokens: Arc<dyn DeviceTokenIssuer>,
}

impl AgentContext {
    /// Registry reference stored on devices owned by this agent.
    pub fn agent_ref(&self) -> String {
        doc_path(AGENTS, &self.agent_id)
    }
}
