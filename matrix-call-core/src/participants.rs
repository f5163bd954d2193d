//! Call participants
//!
//! The people in the current call and whether video is arriving from them.
//! Remote streams are attributed to a user through the msid announced in
//! that user's SDP.

use crate::identity::UserId;
use serde::{Deserialize, Serialize};

/// One person in the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParticipant {
    /// Matrix user
    pub user: UserId,
    /// Whether video is arriving from this user
    pub has_camera: bool,
}

/// Ordered participant list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallParticipants {
    participants: Vec<CallParticipant>,
}

impl CallParticipants {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user; adding someone already present does nothing
    pub fn add(&mut self, user: UserId) -> bool {
        if self.get(&user).is_some() {
            return false;
        }
        self.participants.push(CallParticipant {
            user,
            has_camera: false,
        });
        true
    }

    /// Remove everyone
    pub fn clear(&mut self) {
        self.participants.clear();
    }

    /// Look up a participant
    pub fn get(&self, user: &UserId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| &p.user == user)
    }

    /// Record whether video arrives from `user`; returns whether anything changed
    pub fn set_has_camera(&mut self, user: &UserId, has_camera: bool) -> bool {
        match self.participants.iter_mut().find(|p| &p.user == user) {
            Some(p) if p.has_camera != has_camera => {
                p.has_camera = has_camera;
                true
            }
            _ => false,
        }
    }

    /// Participants in join order
    pub fn iter(&self) -> impl Iterator<Item = &CallParticipant> {
        self.participants.iter()
    }

    /// Number of participants
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Whether nobody is in the call
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
