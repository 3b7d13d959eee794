use serde::{Deserialize, Serialize};
use wharf_env::{EnvironmentKind, ResourceUsage, Server, ServerId};

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PowerActionRequest {
    /// Absent decodes as empty, which is then rejected as an unknown action.
    #[serde(default)]
    pub action: String,
}

// ── Responses ──────────────────────────────────────────────────────

/// Read-only view of a server. Built from the last resource snapshot, never
/// from a live backend query.
#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub uuid: ServerId,
    pub environment: EnvironmentKind,
    pub resources: ResourceUsage,
}

impl From<&Server> for ServerResponse {
    fn from(server: &Server) -> Self {
        let env = server.environment();
        Self {
            uuid: server.id().clone(),
            environment: env.name(),
            resources: env.resources(),
        }
    }
}
