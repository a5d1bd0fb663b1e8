// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor types, used to statically define application resources.

/// Number of region slots in a `TaskDesc` record.
pub const REGIONS_PER_TASK: usize = 8;

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth. (This keeps our logic simpler given
/// that the number of priorities can be reconfigured.)
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater /
/// less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Returns whichever of the two priorities is more important. Used to
    /// run shared work (such as a data mover serving two tasks) at the more
    /// urgent of the two levels.
    pub fn max_importance(self, other: Self) -> Self {
        if other.is_more_important_than(self) {
            other
        } else {
            self
        }
    }
}

/// Record describing a single task.
#[derive(Clone, Debug)]
pub struct TaskDesc {
    /// Identifies memory regions this task has access to, with references into
    /// the `RegionDesc` table. If the task needs fewer than `REGIONS_PER_TASK`
    /// regions, it should use remaining entries to name a region that confers
    /// no access; by convention, this region is usually entry 0 in the table.
    /// (This is why we use pointers into a table, to avoid making many copies
    /// of that region.)
    pub regions: [&'static RegionDesc; REGIONS_PER_TASK],
    /// Initial priority of this task.
    pub priority: u8,
    /// Collection of boolean flags controlling task behavior.
    pub flags: TaskFlags,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug)]
    #[repr(transparent)]
    pub struct TaskFlags: u8 {
        const START_AT_BOOT = 1 << 0;
        const RESERVED = !1;
    }
}

/// Description of one memory region.
///
/// A memory region can be used by multiple tasks. This is mostly used to have
/// tasks share a no-access region (often index 0) in unused region slots, but
/// you could also use it for shared peripheral or RAM access.
///
/// Note that regions can overlap. This can be useful: for example, you can have
/// two regions pointing to the same area of the address space, but one
/// read-only and the other read-write.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct RegionDesc {
    /// Address of start of region.
    pub base: usize,
    /// Size of region, in bytes.
    pub size: usize,
    /// Flags describing what can be done with this region.
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    /// A region conferring no access, for unused `TaskDesc` slots.
    pub const NULL: Self = Self {
        base: 0,
        size: 0,
        attributes: RegionAttributes::empty(),
    };

    /// Tests whether `self` contains `addr`.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Compute the address one past the end of this region. Since we don't
    /// allow regions to butt up against the end of the address space, we can do
    /// that.
    pub fn end_addr(&self) -> usize {
        // Wrapping add here avoids the overflow check, which is avoided by our
        // invariant that this not bump the end of the address space.
        self.base.wrapping_add(self.size)
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by tasks that include it.
        const READ = 1 << 0;
        /// Region can be written by tasks that include it.
        const WRITE = 1 << 1;
        /// Region can contain executable code for tasks that include it.
        const EXECUTE = 1 << 2;
        /// Region contains memory mapped registers. This affects cache behavior
        /// on devices that include it, and discourages the kernel from using
        /// `memcpy` in the region.
        const DEVICE = 1 << 3;
        /// Region can be used for DMA or communication with other processors.
        const DMA = 1 << 4;

        const RESERVED = !((1 << 5) - 1);
    }
}
