use std::fmt::{Display, Formatter};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Set of dispatch phases an exchange has passed through.
///
/// The dispatcher records every phase it enters on the exchange, so callers
/// (and tests) can see how far a request travelled through the pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DispatchPhase(pub u32);

impl DispatchPhase {
    pub const NONE: Self = Self(0);
    pub const START: Self = Self(1);
    pub const MULTIPART_CHECK: Self = Self(1 << 1);
    pub const ROUTE_LOOKUP: Self = Self(1 << 2);
    pub const ADAPTER_LOOKUP: Self = Self(1 << 3);
    pub const CACHE_CHECK: Self = Self(1 << 4);
    pub const PRE_HANDLE: Self = Self(1 << 5);
    pub const INVOKE: Self = Self(1 << 6);
    pub const POST_HANDLE: Self = Self(1 << 7);
    pub const RESULT_PROCESSING: Self = Self(1 << 8);
    pub const COMPLETION: Self = Self(1 << 9);
    pub const NO_HANDLER: Self = Self(1 << 10);
    pub const EXCEPTION_HANDLING: Self = Self(1 << 11);
    pub const NOT_MODIFIED: Self = Self(1 << 12);
    pub const ASYNC_STARTED: Self = Self(1 << 13);
    pub const CANCELLED: Self = Self(1 << 14);

    pub fn any_flags(&self, flags: DispatchPhase) -> bool {
        self.0 & flags.0 != 0
    }

    pub fn any_flags_clear(&self, flags: DispatchPhase) -> bool {
        self.0 & flags.0 != flags.0
    }

    pub fn all_flags(&self, flags: DispatchPhase) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn all_flags_clear(&self, flags: DispatchPhase) -> bool {
        self.0 & flags.0 == 0
    }

    /// True once completion hooks have run for the exchange.
    pub fn is_complete(&self) -> bool {
        self.all_flags(DispatchPhase::COMPLETION)
    }

    /// True if the handler (or anything before it) raised an error.
    pub fn is_error(&self) -> bool {
        self.any_flags(DispatchPhase::EXCEPTION_HANDLING | DispatchPhase::CANCELLED)
    }

    /// True if the handler was actually invoked.
    pub fn was_invoked(&self) -> bool {
        self.all_flags(DispatchPhase::INVOKE)
    }
}

impl Display for DispatchPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:b}", self.0)
    }
}

impl BitOrAssign for DispatchPhase {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAndAssign for DispatchPhase {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0
    }
}

impl Not for DispatchPhase {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl BitAnd for DispatchPhase {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for DispatchPhase {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
