//! Core evidence/relationship/story data model.

mod evidence;
mod identity;
mod pair;
mod relationship;
mod story;

pub use evidence::{AttributeValue, Evidence, EvidenceId, EvidenceKind, ScalarValue, SourceTag};
pub use identity::{PersonId, UserIdentityMap};
pub use pair::{CandidatePair, PreFilterRule};
pub use relationship::{
    DetectionMethod, EvidenceOfEvidence, MethodVerdict, Relationship, RelationshipType, VerdictMethod,
};
pub use story::{StoryId, WorkStory};
