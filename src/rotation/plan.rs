//! Per-run decision.
//!
//! Which branch a run takes depends only on the Slot Secret and on the
//! credential currently written to the shared config file, so it is computed
//! up front by a pure function.

use crate::slot::{Slot, SlotSecret};
use crate::sqlconf::ParsedConfig;

/// What a run will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// The config file matches neither slot: provision both users and point
    /// everything at slot A.
    Bootstrap,

    /// The config file holds the standby slot: the secret's pointer is
    /// stale and is corrected to `to`.
    Drift {
        /// Slot the secret claims is active
        from: Slot,
        /// Slot the application actually uses
        to: Slot,
    },

    /// A previous run flipped but did not finish rotating the old slot.
    Cleanup {
        /// Slot awaiting a fresh password
        stale: Slot,
    },

    /// Normal rotation from the active slot to the standby slot.
    Rotate {
        /// Currently active slot
        from: Slot,
        /// Slot the application is moved to
        to: Slot,
    },
}

impl Plan {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Plan::Bootstrap => "bootstrap",
            Plan::Drift { .. } => "drift",
            Plan::Cleanup { .. } => "cleanup",
            Plan::Rotate { .. } => "rotate",
        }
    }
}

/// Decides the run's branch.
///
/// ```
/// use slotmux::rotation::plan::{plan, Plan};
/// use slotmux::{sqlconf, DbCredential, Slot, SlotSecret};
///
/// let secret = SlotSecret::new(
///     Slot::A,
///     DbCredential::new("openemr_a", "p1", "db", 3306, "openemr"),
///     DbCredential::new("openemr_b", "p2", "db", 3306, "openemr"),
/// );
/// let observed = sqlconf::parse(
///     "$host = 'db';\n$port = '3306';\n$login = 'openemr_a';\n$pass = 'p1';\n$dbase = 'openemr';\n",
/// );
///
/// assert_eq!(plan(&secret, &observed), Plan::Rotate { from: Slot::A, to: Slot::B });
/// ```
pub fn plan(secret: &SlotSecret, observed: &ParsedConfig) -> Plan {
    let active = secret.active_slot;
    let standby = active.standby();

    if observed.matches(secret.active()) {
        return match secret.stale_slot {
            Some(stale) if stale != active => Plan::Cleanup { stale },
            _ => Plan::Rotate {
                from: active,
                to: standby,
            },
        };
    }

    if observed.matches(secret.standby()) {
        return Plan::Drift {
            from: active,
            to: standby,
        };
    }

    Plan::Bootstrap
}
