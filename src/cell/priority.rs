/// The priority currently occupying a physical cell: a small total order
/// including a distinguished `Free` sentinel, `Opportunistic`, and
/// guaranteed priorities.
///
/// Deriving `Ord` on the enum gives exactly the order preemption needs:
/// `Free < Opportunistic < Guaranteed(_)`, and two `Guaranteed` priorities
/// compare by their inner value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CellPriority {
    Free,
    Opportunistic,
    Guaranteed(i32),
}

impl CellPriority {
    pub fn is_free(self) -> bool {
        matches!(self, CellPriority::Free)
    }

    pub fn is_guaranteed(self) -> bool {
        matches!(self, CellPriority::Guaranteed(_))
    }

    /// `true` iff `self` is a guaranteed priority strictly lower than
    /// `other`, i.e. `other` may preempt `self`.
    pub fn preemptable_by(self, other: CellPriority) -> bool {
        self.is_guaranteed() && self < other
    }
}
