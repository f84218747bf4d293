//! Agent Registry
//!
//! Process-wide map from role to implementation. Registration is a
//! startup concern; the query path only reads.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::{Agent, AgentRole};

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentRole, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the implementation for a role
    pub async fn register(&self, role: AgentRole, agent: Arc<dyn Agent>) {
        let mut agents = self.agents.write().await;
        if agents.insert(role, agent.clone()).is_some() {
            info!("Replaced agent for role '{}' with '{}'", role, agent.name());
        } else {
            info!("Registered agent '{}' for role '{}'", agent.name(), role);
        }
    }

    /// Register a concrete agent instance
    pub async fn register_instance<A: Agent + 'static>(&self, role: AgentRole, agent: A) {
        self.register(role, Arc::new(agent)).await;
    }

    pub async fn get(&self, role: AgentRole) -> Option<Arc<dyn Agent>> {
        let agents = self.agents.read().await;
        agents.get(&role).cloned()
    }

    pub async fn unregister(&self, role: AgentRole) -> Option<Arc<dyn Agent>> {
        let mut agents = self.agents.write().await;
        agents.remove(&role)
    }

    pub async fn contains(&self, role: AgentRole) -> bool {
        self.agents.read().await.contains_key(&role)
    }

    /// Registered roles, sorted
    pub async fn roles(&self) -> Vec<AgentRole> {
        let agents = self.agents.read().await;
        let mut roles: Vec<_> = agents.keys().copied().collect();
        roles.sort();
        roles
    }
}
