use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type GroupId = String;
pub type ParticipantId = String;

/// Smallest group that can hold a draw. Below this a derangement either
/// does not exist (n=1) or degenerates into a single swap (n=2).
pub const MIN_PARTICIPANTS: usize = 3;

/// Independent random permutations tried before a draw is abandoned.
/// Derangements are a near-constant fraction of all permutations (2 of 6
/// at n=3, trending to 1/e), so exhausting this bound is astronomically
/// unlikely; it is still a bound, not a proof.
pub const MAX_SHUFFLE_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub wishes: Vec<String>,
    pub is_admin: bool,
    pub joined_at: u64,
}

impl Participant {
    pub fn new(
        id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
        joined_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            wishes: Vec::new(),
            is_admin: false,
            joined_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub budget: Option<f64>,
    pub currency: Option<String>,
    pub participants: Vec<Participant>,
    pub shuffled: bool,
    pub assignments: HashMap<ParticipantId, ParticipantId>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GroupCommand {
    Join {
        participant: Participant,
    },
    Shuffle {
        requested_by: ParticipantId,
    },
    SetWishes {
        participant_id: ParticipantId,
        wishes: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum GroupEvent {
    ParticipantJoined {
        participant_id: ParticipantId,
        display_name: String,
    },
    AssignmentsDrawn,
    WishesUpdated {
        participant_id: ParticipantId,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SantaError {
    #[error("at least 3 distinct participants required")]
    InsufficientParticipants,
    #[error("no valid pairing found within the attempt bound")]
    ShuffleFailed,
    #[error("assignments already drawn")]
    AlreadyShuffled,
    #[error("group locked, the draw has already happened")]
    GroupLocked,
    #[error("assignments not drawn yet")]
    NotYetShuffled,
    #[error("not a participant of this group")]
    NotAParticipant,
    #[error("only the group admin can draw")]
    NotGroupAdmin,
    #[error("assignments no longer match the participant list")]
    StaleAssignments,
}

impl Group {
    /// The creator becomes the group's only admin.
    pub fn new(
        id: impl Into<GroupId>,
        name: impl Into<String>,
        budget: Option<f64>,
        currency: Option<String>,
        creator: Participant,
        created_at: u64,
    ) -> Self {
        let admin = Participant {
            is_admin: true,
            ..creator
        };
        Self {
            id: id.into(),
            name: name.into(),
            budget,
            currency,
            participants: vec![admin],
            shuffled: false,
            assignments: HashMap::new(),
            created_at,
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.participant(id).is_some()
    }

    pub fn is_admin(&self, id: &str) -> bool {
        self.participant(id).map(|p| p.is_admin).unwrap_or(false)
    }

    /// Who the given participant gives a gift to. Distinguishes "not drawn
    /// yet" from "not a member"; a frozen mapping that no longer covers the
    /// membership is reported as stale, never patched up.
    pub fn assignment_for(&self, participant_id: &str) -> Result<&ParticipantId, SantaError> {
        if !self.is_member(participant_id) {
            return Err(SantaError::NotAParticipant);
        }
        if !self.shuffled {
            return Err(SantaError::NotYetShuffled);
        }
        let recipient = self
            .assignments
            .get(participant_id)
            .ok_or(SantaError::StaleAssignments)?;
        if !self.is_member(recipient) {
            return Err(SantaError::StaleAssignments);
        }
        Ok(recipient)
    }

    /// The assigned recipient with their wish list.
    pub fn recipient_of(&self, participant_id: &str) -> Result<&Participant, SantaError> {
        let recipient = self.assignment_for(participant_id)?;
        self.participant(recipient)
            .ok_or(SantaError::StaleAssignments)
    }
}

/// Draws a giver→recipient derangement over the given ids: a bijection with
/// no participant mapped to themselves. Pure; committing the result to a
/// group is the caller's separate step.
pub fn compute_assignment<R: Rng + ?Sized>(
    participants: &[ParticipantId],
    rng: &mut R,
) -> Result<HashMap<ParticipantId, ParticipantId>, SantaError> {
    let distinct: HashSet<&ParticipantId> = participants.iter().collect();
    if participants.len() < MIN_PARTICIPANTS || distinct.len() != participants.len() {
        return Err(SantaError::InsufficientParticipants);
    }

    let mut recipients = participants.to_vec();
    for _ in 0..MAX_SHUFFLE_ATTEMPTS {
        recipients.shuffle(rng);
        let derangement = participants
            .iter()
            .zip(&recipients)
            .all(|(giver, recipient)| giver != recipient);
        if derangement {
            return Ok(participants
                .iter()
                .cloned()
                .zip(recipients.iter().cloned())
                .collect());
        }
    }
    Err(SantaError::ShuffleFailed)
}

pub fn apply_command<R: Rng + ?Sized>(
    group: &mut Group,
    command: GroupCommand,
    rng: &mut R,
) -> Result<Vec<GroupEvent>, SantaError> {
    match command {
        GroupCommand::Join { participant } => join(group, participant),
        GroupCommand::Shuffle { requested_by } => shuffle(group, &requested_by, rng),
        GroupCommand::SetWishes {
            participant_id,
            wishes,
        } => set_wishes(group, &participant_id, wishes),
    }
}

fn join(group: &mut Group, participant: Participant) -> Result<Vec<GroupEvent>, SantaError> {
    // Membership check first: an existing member re-opening the invite link
    // after the draw gets a no-op, not a lockout.
    if group.is_member(&participant.id) {
        return Ok(Vec::new());
    }
    if group.shuffled {
        return Err(SantaError::GroupLocked);
    }

    let event = GroupEvent::ParticipantJoined {
        participant_id: participant.id.clone(),
        display_name: participant.display_name.clone(),
    };
    // A joiner never arrives as admin, whatever the caller handed in.
    group.participants.push(Participant {
        is_admin: false,
        ..participant
    });
    Ok(vec![event])
}

fn shuffle<R: Rng + ?Sized>(
    group: &mut Group,
    requested_by: &str,
    rng: &mut R,
) -> Result<Vec<GroupEvent>, SantaError> {
    let requester = group
        .participant(requested_by)
        .ok_or(SantaError::NotAParticipant)?;
    if !requester.is_admin {
        return Err(SantaError::NotGroupAdmin);
    }
    if group.shuffled {
        return Err(SantaError::AlreadyShuffled);
    }

    let ids: Vec<ParticipantId> = group.participants.iter().map(|p| p.id.clone()).collect();
    let assignments = compute_assignment(&ids, rng)?;

    // Compute and commit under the same mutable borrow: the membership the
    // draw saw is exactly the membership the mapping freezes.
    group.assignments = assignments;
    group.shuffled = true;
    Ok(vec![GroupEvent::AssignmentsDrawn])
}

fn set_wishes(
    group: &mut Group,
    participant_id: &str,
    wishes: Vec<String>,
) -> Result<Vec<GroupEvent>, SantaError> {
    let participant = group
        .participants
        .iter_mut()
        .find(|p| p.id == participant_id)
        .ok_or(SantaError::NotAParticipant)?;

    // Wishes stay editable after the draw; the assignee reads them.
    participant.wishes = wishes;
    Ok(vec![GroupEvent::WishesUpdated {
        participant_id: participant_id.to_string(),
    }])
}
