//! Which operations displace which
//!
//! Every conflict between a newly enqueued operation and one that already
//! exists is decided by the [`RULES`] table, keyed by the new operation's
//! kind, the existing operation's kind, whether the existing one is
//! executing or still queued, and whether the two share a target. The first
//! matching row wins; no row means the two are unrelated.

use gattmux_core::OperationKind;

use crate::operation::Operation;

/// How a new operation affects an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// No effect
    Unrelated,
    /// End the existing one as CANCELLED
    Cancels,
    /// End the existing one as INTERRUPTED and run it again afterwards
    Interrupts,
    /// The existing one is redundant: executing ones end as
    /// SOFTLY_CANCELLED, queued ones are marked so their removal reports it
    SoftlyCancels,
}

/// Where the existing operation sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// In the executing slot
    Executing,
    /// In the pending queue
    Queued,
}

/// Set of operation kinds a rule applies to
#[derive(Debug, Clone, Copy)]
pub enum KindClass {
    /// One specific kind
    Exactly(OperationKind),
    /// Kinds that need a live link
    RequiresConnection,
    /// Characteristic and descriptor kinds
    Attribute,
    /// Everything
    Any,
}

impl KindClass {
    fn contains(&self, kind: OperationKind) -> bool {
        match self {
            KindClass::Exactly(k) => *k == kind,
            KindClass::RequiresConnection => kind.requires_connection(),
            KindClass::Attribute => kind.is_attribute_op(),
            KindClass::Any => true,
        }
    }
}

/// Extra condition a rule needs
#[derive(Debug, Clone, Copy)]
pub enum Guard {
    /// Always
    Always,
    /// The new operation was not requested by the caller
    NewIsImplicit,
    /// The existing operation allows a Connect to cancel it
    ExistingCancellableByConnect,
    /// The two kinds differ
    DifferentKind,
}

/// One row of the compatibility table
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Slot the existing operation is in
    pub slot: Slot,
    /// Kinds of the new operation
    pub new: KindClass,
    /// Kinds of the existing operation
    pub existing: KindClass,
    /// Whether both must target the same device or adapter
    pub same_target: bool,
    /// Extra condition
    pub guard: Guard,
    /// Outcome
    pub relation: Relation,
}

use KindClass::*;
use OperationKind as K;

/// The compatibility table
pub const RULES: &[Rule] = &[
    // ----- against the executing operation -----
    Rule {
        slot: Slot::Executing,
        new: Exactly(K::TurnAdapterOff),
        existing: Any,
        same_target: false,
        guard: Guard::DifferentKind,
        relation: Relation::Cancels,
    },
    Rule {
        slot: Slot::Executing,
        new: Exactly(K::Disconnect),
        existing: Exactly(K::Connect),
        same_target: true,
        guard: Guard::Always,
        relation: Relation::Cancels,
    },
    Rule {
        slot: Slot::Executing,
        new: Exactly(K::Connect),
        existing: Exactly(K::Disconnect),
        same_target: true,
        guard: Guard::ExistingCancellableByConnect,
        relation: Relation::Cancels,
    },
    Rule {
        slot: Slot::Executing,
        new: Exactly(K::Disconnect),
        existing: RequiresConnection,
        same_target: true,
        guard: Guard::Always,
        relation: Relation::SoftlyCancels,
    },
    Rule {
        slot: Slot::Executing,
        new: Exactly(K::Bond),
        existing: Attribute,
        same_target: true,
        guard: Guard::NewIsImplicit,
        relation: Relation::Interrupts,
    },
    // ----- against queued operations -----
    Rule {
        slot: Slot::Queued,
        new: Exactly(K::Disconnect),
        existing: RequiresConnection,
        same_target: true,
        guard: Guard::Always,
        relation: Relation::SoftlyCancels,
    },
    Rule {
        slot: Slot::Queued,
        new: Exactly(K::Disconnect),
        existing: Exactly(K::Connect),
        same_target: true,
        guard: Guard::Always,
        relation: Relation::SoftlyCancels,
    },
    Rule {
        slot: Slot::Queued,
        new: Exactly(K::Connect),
        existing: Exactly(K::Disconnect),
        same_target: true,
        guard: Guard::ExistingCancellableByConnect,
        relation: Relation::SoftlyCancels,
    },
    Rule {
        slot: Slot::Queued,
        new: Exactly(K::DiscoverServices),
        existing: Exactly(K::DiscoverServices),
        same_target: true,
        guard: Guard::Always,
        relation: Relation::SoftlyCancels,
    },
    Rule {
        slot: Slot::Queued,
        new: Exactly(K::ReadRssi),
        existing: Exactly(K::ReadRssi),
        same_target: true,
        guard: Guard::Always,
        relation: Relation::SoftlyCancels,
    },
];

impl Rule {
    fn applies(&self, slot: Slot, new: &Operation, existing: &Operation) -> bool {
        if self.slot != slot
            || !self.new.contains(new.kind())
            || !self.existing.contains(existing.kind())
        {
            return false;
        }
        if self.same_target && new.target() != existing.target() {
            return false;
        }
        match self.guard {
            Guard::Always => true,
            Guard::NewIsImplicit => !new.is_explicit(),
            Guard::ExistingCancellableByConnect => existing.is_cancellable_by_connect(),
            Guard::DifferentKind => new.kind() != existing.kind(),
        }
    }
}

/// Look up how `new` affects `existing`
pub fn relation(slot: Slot, new: &Operation, existing: &Operation) -> Relation {
    RULES
        .iter()
        .find(|rule| rule.applies(slot, new, existing))
        .map(|rule| rule.relation)
        .unwrap_or(Relation::Unrelated)
}
