//! Cache-coherency modes and the mode transition table.
//!
//! A buffer shared with the coprocessor can be cached on the host side, the
//! coprocessor side, both, or neither. Because the two cache hierarchies are
//! not coherent with each other, every change of mode has to be driven
//! explicitly; [`transition`] encodes which mode a buffer actually ends up in
//! when a caller asks to move it from one mode to another.
//!
//! The table is deliberately *not* a naive union of the two sides. Dropping a
//! `HostAndCoprocessor` buffer to `None` leaves it in `Coprocessor`, never
//! `None`: the coprocessor's view is not revoked just because the host gave
//! its own up. Do not "fix" the asymmetry.

/// Which side(s) currently hold a cached, non-coherent view of a buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CacheMode {
    /// Neither side caches the buffer.
    #[default]
    None = 0,
    /// Cached by the host CPU only.
    Host = 1,
    /// Cached by the coprocessor only.
    Coprocessor = 2,
    /// Cached by both sides.
    HostAndCoprocessor = 3,
}

impl CacheMode {
    /// Wire representation for control requests.
    #[inline]
    pub(crate) fn to_wire(self) -> u32 {
        self as u32
    }

    /// Decode a wire value; unknown values are rejected.
    pub(crate) fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(CacheMode::None),
            1 => Some(CacheMode::Host),
            2 => Some(CacheMode::Coprocessor),
            3 => Some(CacheMode::HostAndCoprocessor),
            _ => None,
        }
    }

    /// Whether the host CPU holds a cached view in this mode.
    #[inline]
    pub fn host_cached(self) -> bool {
        matches!(self, CacheMode::Host | CacheMode::HostAndCoprocessor)
    }

    /// Whether the coprocessor holds a cached view in this mode.
    #[inline]
    pub fn coprocessor_cached(self) -> bool {
        matches!(self, CacheMode::Coprocessor | CacheMode::HostAndCoprocessor)
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMode::None => write!(f, "none"),
            CacheMode::Host => write!(f, "host"),
            CacheMode::Coprocessor => write!(f, "coprocessor"),
            CacheMode::HostAndCoprocessor => write!(f, "host+coprocessor"),
        }
    }
}

/// Resulting mode when a buffer in `current` mode is asked to move to
/// `requested`.
///
/// Callers short-circuit the diagonal (`current == requested`) before
/// consulting the table; it is never a real transition. The diagonal arms
/// below return `current` only so the function stays total.
pub fn transition(current: CacheMode, requested: CacheMode) -> CacheMode {
    use CacheMode::{Coprocessor, Host, HostAndCoprocessor, None};

    debug_assert_ne!(current, requested, "diagonal is a no-op short-circuit");

    match (current, requested) {
        (None, Host) => Host,
        (None, Coprocessor) => None,
        (None, HostAndCoprocessor) => Host,

        (Host, None) => None,
        (Host, Coprocessor) => Host,
        (Host, HostAndCoprocessor) => Host,

        (Coprocessor, None) => None,
        (Coprocessor, Host) => HostAndCoprocessor,
        (Coprocessor, HostAndCoprocessor) => HostAndCoprocessor,

        (HostAndCoprocessor, None) => Coprocessor,
        (HostAndCoprocessor, Host) => HostAndCoprocessor,
        (HostAndCoprocessor, Coprocessor) => Coprocessor,

        (same, _) => same,
    }
}

#[cfg(test)]
mod tests {
    use super::CacheMode::{Coprocessor, Host, HostAndCoprocessor, None};
    use super::*;

    #[test]
    fn test_all_off_diagonal_transitions() {
        // The full 12-entry table, exactly as the driver behaves.
        let table = [
            ((None, Host), Host),
            ((None, Coprocessor), None),
            ((None, HostAndCoprocessor), Host),
            ((Host, None), None),
            ((Host, Coprocessor), Host),
            ((Host, HostAndCoprocessor), Host),
            ((Coprocessor, None), None),
            ((Coprocessor, Host), HostAndCoprocessor),
            ((Coprocessor, HostAndCoprocessor), HostAndCoprocessor),
            ((HostAndCoprocessor, None), Coprocessor),
            ((HostAndCoprocessor, Host), HostAndCoprocessor),
            ((HostAndCoprocessor, Coprocessor), Coprocessor),
        ];

        for ((current, requested), expected) in table {
            assert_eq!(
                transition(current, requested),
                expected,
                "({current}, {requested})"
            );
        }
    }

    #[test]
    fn test_asymmetry_is_preserved() {
        // The non-obvious row: both-sides dropping to "nothing" keeps the
        // coprocessor view alive.
        assert_eq!(transition(HostAndCoprocessor, None), Coprocessor);
    }

    #[test]
    fn test_wire_round_trip() {
        for mode in [None, Host, Coprocessor, HostAndCoprocessor] {
            assert_eq!(CacheMode::from_wire(mode.to_wire()), Some(mode));
        }
        assert_eq!(CacheMode::from_wire(4), Option::None);
    }

    #[test]
    fn test_side_predicates() {
        assert!(!None.host_cached());
        assert!(Host.host_cached());
        assert!(!Host.coprocessor_cached());
        assert!(HostAndCoprocessor.host_cached());
        assert!(HostAndCoprocessor.coprocessor_cached());
    }
}
