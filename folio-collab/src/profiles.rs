//! User profile lookups for presence display.
//!
//! Presence records carry whatever the joining peer published. The identity
//! provider usually knows better (current display name, avatar, email), so
//! the UI overlays cached profiles onto the presence table before rendering.
//! Lookups for unknown or expired ids are batched into a single source call.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::presence::PresenceRecord;
use crate::state::PeerId;

/// Default time a profile stays fresh.
pub const PROFILE_TTL: Duration = Duration::from_secs(5 * 60);

/// What the identity provider knows about a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub peer_id: PeerId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("profile source unavailable: {0}")]
    Unavailable(String),
}

/// Identity provider collaborator.
pub trait ProfileSource: Send + Sync {
    /// Fetch profiles for `ids` in one call. Unknown ids are simply absent.
    fn fetch_profiles(&self, ids: &[PeerId]) -> Result<Vec<Profile>, ProfileError>;
}

/// TTL cache in front of a [`ProfileSource`].
pub struct ProfileCache {
    source: Arc<dyn ProfileSource>,
    ttl: Duration,
    entries: HashMap<PeerId, (Profile, Instant)>,
    fetches: u64,
}

impl ProfileCache {
    pub fn new(source: Arc<dyn ProfileSource>) -> Self {
        Self::with_ttl(source, PROFILE_TTL)
    }

    pub fn with_ttl(source: Arc<dyn ProfileSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: HashMap::new(),
            fetches: 0,
        }
    }

    /// Profiles for `ids`. Missing or expired entries are fetched in one
    /// batch; if that fails, whatever is cached (even expired) is returned.
    pub fn get_many(&mut self, ids: &[PeerId], now: Instant) -> HashMap<PeerId, Profile> {
        let mut missing: Vec<PeerId> = ids
            .iter()
            .copied()
            .filter(|id| !self.is_fresh(id, now))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        if !missing.is_empty() {
            self.fetches += 1;
            match self.source.fetch_profiles(&missing) {
                Ok(profiles) => {
                    for profile in profiles {
                        self.entries.insert(profile.peer_id, (profile, now));
                    }
                }
                Err(e) => log::warn!("Profile lookup for {} peers failed: {e}", missing.len()),
            }
        }

        ids.iter()
            .filter_map(|id| self.entries.get(id).map(|(p, _)| (*id, p.clone())))
            .collect()
    }

    /// Overlay cached profile fields onto presence records.
    pub fn enrich_presence(&mut self, records: &mut HashMap<PeerId, PresenceRecord>, now: Instant) {
        let ids: Vec<PeerId> = records.keys().copied().collect();
        let profiles = self.get_many(&ids, now);
        for (id, record) in records.iter_mut() {
            if let Some(profile) = profiles.get(id) {
                apply_profile(record, profile);
            }
        }
    }

    pub fn invalidate(&mut self, peer_id: &PeerId) {
        self.entries.remove(peer_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source calls made so far.
    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    fn is_fresh(&self, id: &PeerId, now: Instant) -> bool {
        self.entries
            .get(id)
            .is_some_and(|(_, at)| now.duration_since(*at) < self.ttl)
    }
}

fn apply_profile(record: &mut PresenceRecord, profile: &Profile) {
    if let Some(name) = &profile.display_name {
        record.display_name = name.clone();
    }
    if profile.avatar_ref.is_some() {
        record.avatar_ref = profile.avatar_ref.clone();
    }
    if profile.email.is_some() {
        record.email = profile.email.clone();
    }
}
