//! Producer notification fan-out under the configured scope.

use super::{RoomRegistry, SessionDirectory};
use crate::config::NotificationScope;
use common::types::SessionId;
use signaling_protocol::Notification;
use std::sync::Arc;
use tracing::debug;

pub struct NotificationFanout {
    sessions: Arc<SessionDirectory>,
    rooms: Arc<RoomRegistry>,
    scope: NotificationScope,
}

impl NotificationFanout {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionDirectory>,
        rooms: Arc<RoomRegistry>,
        scope: NotificationScope,
    ) -> Self {
        Self {
            sessions,
            rooms,
            scope,
        }
    }

    /// Sessions that hear about producers owned by `owner`.
    ///
    /// With room scope, an owner outside any room notifies nobody.
    #[must_use]
    pub fn recipients(&self, owner: SessionId) -> Vec<SessionId> {
        match self.scope {
            NotificationScope::All => self.sessions.ids_excluding(owner),
            NotificationScope::Room => self
                .rooms
                .room_of(owner)
                .map(|room_id| self.rooms.members_excluding(&room_id, owner))
                .unwrap_or_default(),
        }
    }

    /// Push `notification` to every recipient. Returns how many accepted it.
    pub fn broadcast(&self, owner: SessionId, notification: &Notification) -> usize {
        let delivered = self
            .recipients(owner)
            .into_iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|handle| handle.notify(notification.clone()))
            .count();

        debug!(
            target: "sc.notify",
            owner = %owner,
            scope = self.scope.as_str(),
            delivered,
            "Fanned out producer notification"
        );
        delivered
    }
}
