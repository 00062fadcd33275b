//! Append-only log of a channel's declarations, replayed on every bind.

use crate::spec::{
    ConfirmSubscription, ConsumeSpec, ExchangeDeclareSpec, QueueBindSpec, QueueDeclareSpec,
};

/// Kind of a recorded spec. The declaration order of the variants is the
/// replay order: a bind needs its exchange and queue, a consumer needs its
/// queue bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SpecKind {
    Exchange,
    Queue,
    Binding,
    Consumer,
    Confirm,
}

impl SpecKind {
    const COUNT: usize = 5;

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SpecKind::Exchange => "exchange",
            SpecKind::Queue => "queue",
            SpecKind::Binding => "binding",
            SpecKind::Consumer => "consumer",
            SpecKind::Confirm => "confirm",
        }
    }
}

/// An immutable record of one requested operation.
#[derive(Debug, Clone)]
pub(crate) enum Spec {
    Exchange(ExchangeDeclareSpec),
    Queue(QueueDeclareSpec),
    Binding(QueueBindSpec),
    Consumer(ConsumeSpec),
    Confirm(ConfirmSubscription),
}

impl Spec {
    pub(crate) fn kind(&self) -> SpecKind {
        match self {
            Spec::Exchange(_) => SpecKind::Exchange,
            Spec::Queue(_) => SpecKind::Queue,
            Spec::Binding(_) => SpecKind::Binding,
            Spec::Consumer(_) => SpecKind::Consumer,
            Spec::Confirm(_) => SpecKind::Confirm,
        }
    }
}

/// Per-channel spec log.
///
/// Specs are bucketed by kind and kept in issuance order within a bucket.
/// Nothing is ever removed.
#[derive(Debug, Default)]
pub(crate) struct SpecRegistry {
    buckets: [Vec<Spec>; SpecKind::COUNT],
}

impl SpecRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records `spec` and returns a reference to the stored copy.
    pub(crate) fn push(&mut self, spec: Spec) -> &Spec {
        let bucket = &mut self.buckets[spec.kind() as usize];
        bucket.push(spec);
        &bucket[bucket.len() - 1]
    }

    /// Iterates every spec in replay order.
    pub(crate) fn replay_order(&self) -> impl Iterator<Item = &Spec> {
        self.buckets.iter().flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }
}
