use super::{Envelope, EnvelopeQuery};

pub(super) trait Queryable {
    fn matches(&self, envelope: &Envelope) -> bool;
}

impl Queryable for EnvelopeQuery {
    fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Self::Not(inner) => !inner.matches(envelope),
            Self::And(inner) => inner.iter().all(|query| query.matches(envelope)),
            Self::Or(inner) => inner.iter().any(|query| query.matches(envelope)),
            Self::IdEquals(id) => envelope.id == *id,
            Self::KindEqual(kind) => envelope.kind == *kind,
            Self::StatusEqual(status) => envelope.status == *status,
            Self::IdempotencyKeyEqual(key) => envelope.idempotency_key == Some(*key),
            Self::DueBefore(instant) => envelope
                .next_attempt_at
                .is_some_and(|due| due < *instant),
        }
    }
}
