//! services/api/src/adapters/video.rs
//!
//! This module contains the adapter for the video conferencing provider. It
//! implements the `VideoRoomService` port from the `core` crate against a
//! URL-addressed meeting service (Jitsi-style): rooms exist by virtue of
//! their URL, so provisioning builds a name and a link without any remote
//! call, teardown is a no-op and access tokens are empty.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use skillswap_core::domain::VideoRoom;
use skillswap_core::ports::{PortResult, VideoRoomService};

/// A room adapter for URL-addressed meeting services.
#[derive(Clone)]
pub struct MeetRoomAdapter {
    base_url: String,
}

impl MeetRoomAdapter {
    /// Creates a new `MeetRoomAdapter`. Trailing slashes on the base URL are
    /// tolerated.
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl VideoRoomService for MeetRoomAdapter {
    async fn create_room(&self, session_id: &str, _ttl_minutes: u32) -> PortResult<VideoRoom> {
        let name = format!("SkillSwap-{session_id}");
        let url = format!("{}/{}", self.base_url, name);
        debug!(room = %name, "provisioned video room");
        Ok(VideoRoom { name, url })
    }

    async fn delete_room(&self, room_name: &str) -> PortResult<()> {
        // Nothing to release server-side; the link simply stops being shared.
        debug!(room = %room_name, "released video room");
        Ok(())
    }

    async fn issue_access_token(
        &self,
        _room_name: &str,
        _user_id: Uuid,
        _is_owner: bool,
    ) -> PortResult<String> {
        // Public rooms carry no token auth.
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn room_url_is_built_from_the_base() {
        let adapter = MeetRoomAdapter::new("https://meet.jit.si/".to_string());
        let room = adapter.create_room("session-abc", 120).await.unwrap();
        assert_eq!(room.name, "SkillSwap-session-abc");
        assert_eq!(room.url, "https://meet.jit.si/SkillSwap-session-abc");
    }
}
