use crate::models::events::ServerEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Teacher,
}

struct Member {
    role: Role,
    name: String,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct RegistryInner {
    // session code -> endpoint id -> member
    rooms: HashMap<String, HashMap<Uuid, Member>>,
    // endpoint id -> session code
    endpoints: HashMap<Uuid, String>,
}

/// Transient membership of connected endpoints, authoritative for
/// fan-out. Persisted identity lives in the session store.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<RegistryInner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(
        &self,
        code: &str,
        endpoint: Uuid,
        role: Role,
        name: &str,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let mut inner = self.inner.write().await;
        inner.rooms.entry(code.to_string()).or_default().insert(
            endpoint,
            Member {
                role,
                name: name.to_string(),
                sender,
            },
        );
        inner.endpoints.insert(endpoint, code.to_string());
        info!(session_code = %code, endpoint = %endpoint, "endpoint attached to room");
    }

    /// Drops the endpoint and returns the membership it held. Empty
    /// rooms are removed.
    pub async fn detach(&self, endpoint: Uuid) -> Option<(String, Role, String)> {
        let mut inner = self.inner.write().await;
        let code = inner.endpoints.remove(&endpoint)?;
        let member = inner.rooms.get_mut(&code)?.remove(&endpoint)?;
        if inner.rooms.get(&code).is_some_and(|room| room.is_empty()) {
            inner.rooms.remove(&code);
        }
        info!(session_code = %code, endpoint = %endpoint, "endpoint detached from room");
        Some((code, member.role, member.name))
    }

    /// The room and identity an endpoint is currently joined under.
    pub async fn membership(&self, endpoint: Uuid) -> Option<(String, Role, String)> {
        let inner = self.inner.read().await;
        let code = inner.endpoints.get(&endpoint)?;
        let member = inner.rooms.get(code)?.get(&endpoint)?;
        Some((code.clone(), member.role, member.name.clone()))
    }

    pub async fn broadcast(&self, code: &str, event: &ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(room) = inner.rooms.get(code) {
            for member in room.values() {
                let _ = member.sender.send(event.clone());
            }
        }
    }

    /// Room-wide emission minus the originating endpoint.
    pub async fn broadcast_except(&self, code: &str, except: Uuid, event: &ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(room) = inner.rooms.get(code) {
            for (endpoint, member) in room.iter() {
                if *endpoint != except {
                    let _ = member.sender.send(event.clone());
                }
            }
        }
    }

    /// Targeted emission to one role, e.g. summaries to teachers only.
    pub async fn send_role(&self, code: &str, role: Role, event: &ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(room) = inner.rooms.get(code) {
            for member in room.values() {
                if member.role == role {
                    let _ = member.sender.send(event.clone());
                }
            }
        }
    }

    pub async fn role_count(&self, code: &str, role: Role) -> usize {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(code)
            .map(|room| room.values().filter(|m| m.role == role).count())
            .unwrap_or(0)
    }

    pub async fn list_role(&self, code: &str, role: Role) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(code)
            .map(|room| {
                room.values()
                    .filter(|m| m.role == role)
                    .map(|m| m.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
