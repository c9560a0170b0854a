// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stack geometry for carrier threads.

use crate::error::{ThrError, ThrResult};

/// Default stack size in bytes.
pub const DEFAULT_STACK_SIZE_BYTES: usize = 128 * 4096;

/// Smallest stack a thread may ask for.
pub const MIN_STACK_SIZE_BYTES: usize = 16 * 4096;

/// Default size of the guard area below a stack.
pub const DEFAULT_GUARD_SIZE_BYTES: usize = 4096;

/// Stack sizes are rounded up to this.
pub const STACK_ALIGNMENT: usize = 4096;

fn align_up(size: usize) -> usize {
    (size + STACK_ALIGNMENT - 1) & !(STACK_ALIGNMENT - 1)
}

/// The stack a thread wants to run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSpec {
    size: usize,
    guard: usize,
    addr: Option<usize>,
}

impl Default for StackSpec {
    fn default() -> Self {
        StackSpec::from_size(DEFAULT_STACK_SIZE_BYTES)
    }
}

impl StackSpec {
    /// A stack with `size` accessible bytes (rounded up to the alignment).
    pub fn from_size(size: usize) -> StackSpec {
        StackSpec {
            size: align_up(size),
            guard: DEFAULT_GUARD_SIZE_BYTES,
            addr: None,
        }
    }

    /// Memory provided by the caller.
    ///
    /// Carriers are OS threads whose stacks the OS allocates, so threads
    /// created with such a stack are rejected at creation time.
    pub fn from_ptr(addr: usize, size: usize) -> StackSpec {
        StackSpec {
            size,
            guard: 0,
            addr: Some(addr),
        }
    }

    pub fn with_guard(mut self, guard: usize) -> StackSpec {
        self.guard = align_up(guard);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn guard(&self) -> usize {
        self.guard
    }

    pub fn addr(&self) -> Option<usize> {
        self.addr
    }

    /// Checks that a carrier can be created for this stack.
    pub(crate) fn validate(&self) -> ThrResult<StackSpec> {
        if self.addr.is_some() {
            return Err(ThrError::NotSupported);
        }
        if self.size < MIN_STACK_SIZE_BYTES {
            return Err(ThrError::InvalidArgument);
        }
        Ok(*self)
    }

    /// How much stack we ask the OS for (the OS places its own guard page,
    /// so ours is folded into the reservation).
    pub(crate) fn reservation(&self) -> usize {
        self.size + self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_aligned() {
        let s = StackSpec::from_size(MIN_STACK_SIZE_BYTES + 1);
        assert_eq!(s.size() % STACK_ALIGNMENT, 0);
        assert!(s.size() > MIN_STACK_SIZE_BYTES);
        let s = s.with_guard(10);
        assert_eq!(s.guard(), STACK_ALIGNMENT);
        assert_eq!(s.reservation(), s.size() + STACK_ALIGNMENT);
    }

    #[test]
    fn validation() {
        assert_eq!(
            StackSpec::from_size(4096).validate(),
            Err(ThrError::InvalidArgument)
        );
        assert_eq!(
            StackSpec::from_ptr(0x1000, 1 << 20).validate(),
            Err(ThrError::NotSupported)
        );
        assert!(StackSpec::default().validate().is_ok());
    }
}
