//! Parties, guilds and pending invitations.
//!
//! These registries are shared across connections, so they live in
//! `DashMap`s rather than on the single-threaded replication context.
//! Invitations expire on a background tokio task. Re-inviting a player
//! replaces the pending invitation under a new generation; the older
//! expiry task then finds a different generation and leaves it alone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strata_config::SocialConfig;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::error::SocialError;
use crate::ownership::ConnectionId;

/// Kind of social group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Small adventuring group.
    Party,
    /// Long-lived organisation.
    Guild,
}

/// A party or guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Id, unique across kinds.
    pub id: u32,
    /// Party or guild.
    pub kind: GroupKind,
    /// Member allowed to disband the group.
    pub leader: ConnectionId,
    /// Members in join order, leader included.
    pub members: Vec<ConnectionId>,
}

/// An invitation waiting for the invitee's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Kind of the inviting group.
    pub kind: GroupKind,
    /// Group the invitee would join.
    pub group_id: u32,
    /// Member who sent the invitation.
    pub inviter: ConnectionId,
    /// Player being invited.
    pub invitee: ConnectionId,
    generation: u64,
}

type InvitationMap = DashMap<(GroupKind, ConnectionId), Invitation>;

/// Shared party and guild state.
pub struct SocialRegistry {
    config: SocialConfig,
    runtime: Handle,
    groups: DashMap<(GroupKind, u32), Group>,
    membership: DashMap<(GroupKind, ConnectionId), u32>,
    invitations: Arc<InvitationMap>,
    next_group_id: AtomicU32,
    next_generation: AtomicU64,
}

impl SocialRegistry {
    /// Registry spawning its expiry tasks on `runtime`.
    pub fn new(config: SocialConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            groups: DashMap::new(),
            membership: DashMap::new(),
            invitations: Arc::new(DashMap::new()),
            next_group_id: AtomicU32::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    fn capacity(&self, kind: GroupKind) -> usize {
        match kind {
            GroupKind::Party => self.config.max_party_members,
            GroupKind::Guild => self.config.max_guild_members,
        }
    }

    // --- Groups ---

    /// Reserves `member`'s single membership slot for `kind`. The slot is
    /// taken under the map's entry lock, so concurrent claims for the same
    /// player cannot both win.
    fn claim_membership(&self, kind: GroupKind, member: ConnectionId, group_id: u32) -> Result<(), SocialError> {
        match self.membership.entry((kind, member)) {
            Entry::Occupied(_) => Err(SocialError::AlreadyMember { member, kind }),
            Entry::Vacant(slot) => {
                slot.insert(group_id);
                Ok(())
            }
        }
    }

    fn release_membership(&self, kind: GroupKind, member: ConnectionId, group_id: u32) {
        self.membership.remove_if(&(kind, member), |_, id| *id == group_id);
    }

    /// Creates a group led by `leader`.
    pub fn create(&self, kind: GroupKind, leader: ConnectionId) -> Result<u32, SocialError> {
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        self.claim_membership(kind, leader, id)?;
        self.groups.insert(
            (kind, id),
            Group {
                id,
                kind,
                leader,
                members: vec![leader],
            },
        );
        info!(?kind, group_id = id, %leader, "group created");
        Ok(id)
    }

    /// Adds `member` to an existing group.
    pub fn join(&self, kind: GroupKind, group_id: u32, member: ConnectionId) -> Result<(), SocialError> {
        self.claim_membership(kind, member, group_id)?;
        let capacity = self.capacity(kind);
        let joined = match self.groups.get_mut(&(kind, group_id)) {
            None => Err(SocialError::UnknownGroup { kind, group_id }),
            Some(group) if group.members.len() >= capacity => Err(SocialError::Full {
                kind,
                group_id,
                capacity,
            }),
            Some(mut group) => {
                group.members.push(member);
                Ok(())
            }
        };
        if joined.is_err() {
            self.release_membership(kind, member, group_id);
        } else {
            debug!(?kind, group_id, %member, "member joined");
        }
        joined
    }

    /// Removes `member` from its group. A departing leader hands over to the
    /// longest-standing member; the last member leaving removes the group.
    pub fn leave(&self, kind: GroupKind, member: ConnectionId) -> Result<(), SocialError> {
        let (_, group_id) = self
            .membership
            .remove(&(kind, member))
            .ok_or(SocialError::NotMember { member, kind })?;

        let empty = match self.groups.get_mut(&(kind, group_id)) {
            Some(mut group) => {
                group.members.retain(|m| *m != member);
                if group.leader == member
                    && let Some(next) = group.members.first().copied()
                {
                    group.leader = next;
                    debug!(?kind, group_id, leader = %next, "leadership handed over");
                }
                group.members.is_empty()
            }
            None => false,
        };
        if empty {
            self.groups.remove(&(kind, group_id));
            self.drop_invitations_for(kind, group_id);
            info!(?kind, group_id, "group emptied");
        }
        debug!(?kind, group_id, %member, "member left");
        Ok(())
    }

    /// Dissolves the group `leader` leads.
    pub fn disband(&self, kind: GroupKind, leader: ConnectionId) -> Result<Vec<ConnectionId>, SocialError> {
        let group_id = self
            .group_of(kind, leader)
            .ok_or(SocialError::NotMember { member: leader, kind })?;
        let is_leader = self
            .groups
            .get(&(kind, group_id))
            .is_some_and(|g| g.leader == leader);
        if !is_leader {
            return Err(SocialError::NotLeader(leader));
        }

        let Some((_, group)) = self.groups.remove(&(kind, group_id)) else {
            return Err(SocialError::UnknownGroup { kind, group_id });
        };
        for member in &group.members {
            self.membership.remove(&(kind, *member));
        }
        self.drop_invitations_for(kind, group_id);
        info!(?kind, group_id, members = group.members.len(), "group disbanded");
        Ok(group.members)
    }

    /// Group snapshot.
    pub fn group(&self, kind: GroupKind, group_id: u32) -> Option<Group> {
        self.groups.get(&(kind, group_id)).map(|g| g.value().clone())
    }

    /// Group `member` belongs to.
    pub fn group_of(&self, kind: GroupKind, member: ConnectionId) -> Option<u32> {
        self.membership.get(&(kind, member)).map(|id| *id.value())
    }

    /// Drops a disconnected player from every group and invitation.
    pub fn remove_player(&self, player: ConnectionId) {
        for kind in [GroupKind::Party, GroupKind::Guild] {
            let _ = self.leave(kind, player);
            self.invitations.remove(&(kind, player));
        }
    }

    // --- Invitations ---

    /// Invites `invitee` into `inviter`'s group. Replaces any invitation the
    /// invitee already holds for this kind and restarts its expiry.
    pub fn invite(&self, kind: GroupKind, inviter: ConnectionId, invitee: ConnectionId) -> Result<(), SocialError> {
        let group_id = self
            .group_of(kind, inviter)
            .ok_or(SocialError::NotMember { member: inviter, kind })?;
        if self.membership.contains_key(&(kind, invitee)) {
            return Err(SocialError::AlreadyMember { member: invitee, kind });
        }
        let capacity = self.capacity(kind);
        if self.groups.get(&(kind, group_id)).is_some_and(|g| g.members.len() >= capacity) {
            return Err(SocialError::Full {
                kind,
                group_id,
                capacity,
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let key = (kind, invitee);
        self.invitations.remove(&key);
        self.invitations.insert(
            key,
            Invitation {
                kind,
                group_id,
                inviter,
                invitee,
                generation,
            },
        );

        let invitations = Arc::clone(&self.invitations);
        let lifetime = Duration::from_secs(self.config.invitation_duration_secs);
        self.runtime.spawn(async move {
            tokio::time::sleep(lifetime).await;
            if invitations.remove_if(&key, |_, inv| inv.generation == generation).is_some() {
                debug!(?kind, %invitee, "invitation expired");
            }
        });
        debug!(?kind, group_id, %inviter, %invitee, "invitation sent");
        Ok(())
    }

    /// Pending invitation for `invitee`.
    pub fn pending_invitation(&self, kind: GroupKind, invitee: ConnectionId) -> Option<Invitation> {
        self.invitations.get(&(kind, invitee)).map(|i| i.value().clone())
    }

    /// Accepts the pending invitation and joins its group.
    pub fn accept(&self, kind: GroupKind, invitee: ConnectionId) -> Result<u32, SocialError> {
        let (_, invitation) = self
            .invitations
            .remove(&(kind, invitee))
            .ok_or(SocialError::NoInvitation(invitee))?;
        self.join(kind, invitation.group_id, invitee)?;
        Ok(invitation.group_id)
    }

    /// Declines the pending invitation. Returns `false` if there was none.
    pub fn decline(&self, kind: GroupKind, invitee: ConnectionId) -> bool {
        self.invitations.remove(&(kind, invitee)).is_some()
    }

    fn drop_invitations_for(&self, kind: GroupKind, group_id: u32) {
        self.invitations
            .retain(|(k, _), inv| !(*k == kind && inv.group_id == group_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);
    const C: ConnectionId = ConnectionId(3);

    fn registry() -> SocialRegistry {
        let config = SocialConfig {
            invitation_duration_secs: 10,
            max_party_members: 2,
            max_guild_members: 50,
        };
        SocialRegistry::new(config, Handle::current())
    }

    #[tokio::test]
    async fn test_create_join_leave() {
        let social = registry();
        let party = social.create(GroupKind::Party, A).unwrap();
        assert_eq!(
            social.create(GroupKind::Party, A),
            Err(SocialError::AlreadyMember { member: A, kind: GroupKind::Party })
        );
        // Kinds are independent.
        social.create(GroupKind::Guild, A).unwrap();

        social.join(GroupKind::Party, party, B).unwrap();
        assert_eq!(
            social.join(GroupKind::Party, party, C),
            Err(SocialError::Full { kind: GroupKind::Party, group_id: party, capacity: 2 })
        );

        social.leave(GroupKind::Party, A).unwrap();
        let group = social.group(GroupKind::Party, party).unwrap();
        assert_eq!(group.leader, B);
        assert_eq!(group.members, vec![B]);

        social.leave(GroupKind::Party, B).unwrap();
        assert!(social.group(GroupKind::Party, party).is_none());
        assert!(social.leave(GroupKind::Party, B).is_err());
    }

    #[tokio::test]
    async fn test_disband_requires_leader() {
        let social = registry();
        let guild = social.create(GroupKind::Guild, A).unwrap();
        social.join(GroupKind::Guild, guild, B).unwrap();
        social.invite(GroupKind::Guild, A, C).unwrap();

        assert_eq!(social.disband(GroupKind::Guild, B), Err(SocialError::NotLeader(B)));
        assert_eq!(social.disband(GroupKind::Guild, A).unwrap(), vec![A, B]);
        assert_eq!(social.group_of(GroupKind::Guild, B), None);
        assert!(social.pending_invitation(GroupKind::Guild, C).is_none());
    }

    #[tokio::test]
    async fn test_invitation_accept_and_decline() {
        let social = registry();
        let party = social.create(GroupKind::Party, A).unwrap();
        assert_eq!(
            social.invite(GroupKind::Party, B, C),
            Err(SocialError::NotMember { member: B, kind: GroupKind::Party })
        );

        social.invite(GroupKind::Party, A, B).unwrap();
        assert_eq!(social.accept(GroupKind::Party, B), Ok(party));
        assert_eq!(social.accept(GroupKind::Party, B), Err(SocialError::NoInvitation(B)));

        let solo = social.create(GroupKind::Party, C).unwrap();
        assert_ne!(solo, party);
        assert!(!social.decline(GroupKind::Party, C));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invitation_expires() {
        let social = registry();
        social.create(GroupKind::Party, A).unwrap();
        social.invite(GroupKind::Party, A, B).unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(social.pending_invitation(GroupKind::Party, B).is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(social.pending_invitation(GroupKind::Party, B).is_none());
        assert_eq!(social.accept(GroupKind::Party, B), Err(SocialError::NoInvitation(B)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinvite_outlives_stale_expiry() {
        let social = registry();
        social.create(GroupKind::Party, A).unwrap();
        social.invite(GroupKind::Party, A, B).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        social.invite(GroupKind::Party, A, B).unwrap();

        // Past the first invitation's deadline: the replacement survives.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(social.pending_invitation(GroupKind::Party, B).is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(social.pending_invitation(GroupKind::Party, B).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_joins_leave_one_membership() {
        let social = registry();
        for round in 0..200u64 {
            let leader_a = ConnectionId(1_000 + round * 3);
            let leader_b = ConnectionId(1_001 + round * 3);
            let member = ConnectionId(1_002 + round * 3);
            let first = social.create(GroupKind::Party, leader_a).unwrap();
            let second = social.create(GroupKind::Party, leader_b).unwrap();

            let barrier = std::sync::Barrier::new(2);
            let (joined_first, joined_second) = std::thread::scope(|scope| {
                let one = scope.spawn(|| {
                    barrier.wait();
                    social.join(GroupKind::Party, first, member).is_ok()
                });
                let two = scope.spawn(|| {
                    barrier.wait();
                    social.join(GroupKind::Party, second, member).is_ok()
                });
                (one.join().unwrap(), two.join().unwrap())
            });

            assert!(joined_first ^ joined_second, "round {round}: exactly one join wins");
            let in_first = social.group(GroupKind::Party, first).unwrap().members.contains(&member);
            let in_second = social.group(GroupKind::Party, second).unwrap().members.contains(&member);
            assert_eq!((in_first, in_second), (joined_first, joined_second));
            let expected = if joined_first { first } else { second };
            assert_eq!(social.group_of(GroupKind::Party, member), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_failed_join_releases_membership() {
        let social = registry();
        let party = social.create(GroupKind::Party, A).unwrap();
        social.join(GroupKind::Party, party, B).unwrap();

        assert!(matches!(social.join(GroupKind::Party, party, C), Err(SocialError::Full { .. })));
        assert_eq!(social.group_of(GroupKind::Party, C), None);
        assert!(matches!(
            social.join(GroupKind::Party, 999, C),
            Err(SocialError::UnknownGroup { .. })
        ));
        assert_eq!(social.group_of(GroupKind::Party, C), None);
        assert!(social.create(GroupKind::Party, C).is_ok());
    }

    #[tokio::test]
    async fn test_remove_player_clears_everything() {
        let social = registry();
        let party = social.create(GroupKind::Party, A).unwrap();
        social.join(GroupKind::Party, party, B).unwrap();
        social.create(GroupKind::Guild, C).unwrap();
        social.invite(GroupKind::Guild, C, A).unwrap();

        social.remove_player(A);
        assert_eq!(social.group_of(GroupKind::Party, A), None);
        assert_eq!(social.group(GroupKind::Party, party).unwrap().leader, B);
        assert!(social.pending_invitation(GroupKind::Guild, A).is_none());
    }
}
