//! Debug assertion macros for the object/handle state machine.
//!
//! Active only in debug builds; release builds pay nothing. The broker's
//! test-only `validate()` walks the whole state, while these macros guard
//! the individual transitions where a violation would be introduced.

/// At most one handle awaits unique ownership of a given object.
macro_rules! debug_assert_no_unique_waiter {
    ($slot:expr) => {
        debug_assert!(
            $slot.is_none(),
            "an object can have at most one handle awaiting unique ownership"
        )
    };
}

/// An exclusive writer only exists on an unshared, open, DEFAULT object.
macro_rules! debug_assert_writer_allowed {
    ($policy:expr, $shared:expr, $open_handles:expr) => {
        debug_assert!(
            $policy == partake_proto::Policy::Default && !$shared && $open_handles > 0,
            "exclusive writer requires an open, unshared DEFAULT object"
        )
    };
}

/// An object's open-handle count equals the number of its handles with a
/// nonzero open count.
macro_rules! debug_assert_open_handles_consistent {
    ($object_open:expr, $open_handle_count:expr) => {
        debug_assert!(
            $object_open == $open_handle_count,
            "object open count {} disagrees with its open handles {}",
            $object_open,
            $open_handle_count
        )
    };
}

pub(crate) use debug_assert_no_unique_waiter;
pub(crate) use debug_assert_open_handles_consistent;
pub(crate) use debug_assert_writer_allowed;
