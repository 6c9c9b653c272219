//! Per-query and coordinator-level policy bits.

use bitflags::bitflags;

bitflags! {
    /// Behavior flags for a submitted query, OR-able into a bitset.
    ///
    /// `Policy::empty()` is the default behavior: tick-driven dispatch, the
    /// query completes once no non-errored keys remain outstanding, and
    /// errored keys surface as `None` entries in the result map.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Policy: u32 {
        /// Keep the query registered while any of its keys are in an error
        /// cool-off window. Errored keys are held back rather than surfaced
        /// as `None`, and partial results are emitted as resolutions arrive.
        const RETRY = 1;
        /// Dispatch immediately on submit instead of waiting for the next
        /// tick, route the query's keys via the high-priority class, and use
        /// the shorter error back-off base.
        const ASAP = 2;
        /// Only emit once every key has a concrete resolution (value or
        /// not-found). Errors never satisfy the query.
        const WAIT = 4;
        /// Evict the listed keys from the value cache on submit and require
        /// a fresh response before a key becomes eligible for completion.
        ///
        /// Eviction covers values only: a key's not-found marker and error
        /// history survive a refresh.
        const REFRESH = 8;
        /// Coordinator-level flag: run the periodic timer in the background.
        /// Accepted for interface compatibility; the tick task always runs
        /// detached and stops on `close()` or drop.
        const DAEMON = 16;
        /// Reject the submit if an equal query (same policy, same listener
        /// identity, same key set) is already registered.
        const UNIQUE = 32;
        /// Emit a partial result whenever the result map changes.
        const PARTIAL = 64;
        /// Reject the submit if a query is already registered under the
        /// supplied token instead of replacing it.
        const NO_REPLACE = 128;
    }
}

impl Policy {
    /// Whether errored keys are held back from the result map rather than
    /// surfaced as `None`.
    pub(crate) fn holds_errors(self) -> bool {
        self.intersects(Policy::RETRY | Policy::WAIT)
    }
}
