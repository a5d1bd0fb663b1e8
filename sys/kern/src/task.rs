// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use abi::{
    FaultInfo, FaultSource, Generation, IpcError, SchedState, TaskId,
    TaskState,
};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::descs::{Priority, RegionAttributes, TaskDesc, TaskFlags};
use crate::umem::USlice;

/// Internal representation of a task.
///
/// The fields of this struct are private to this module so that we can
/// maintain some task invariants. A task record does not carry any execution
/// state -- context switching belongs to the platform scheduler, which is a
/// collaborator of this kernel, not part of it. What the kernel tracks is
/// what it needs for messaging: who the task is, whether it can be scheduled,
/// what memory it may touch, and the result of its last kernel operation.
#[derive(Debug)]
pub struct Task {
    /// Current priority of the task.
    priority: Priority,
    /// State used to make status and scheduling decisions.
    state: TaskState,
    /// Restart count for this task. We increment this whenever we
    /// reinitialize the task. The low bits of this become the task's
    /// generation number.
    generation: u32,
    /// Completion slot: result of the task's most recent kernel operation,
    /// deposited either synchronously or when the task is woken.
    saved: Option<Result<usize, IpcError>>,
    /// Pointer to the descriptor used to create this task, so it can be
    /// restarted.
    descriptor: &'static TaskDesc,
}

impl Task {
    /// Creates a `Task` in its initial state, filling in fields from
    /// `descriptor`.
    pub fn from_descriptor(descriptor: &'static TaskDesc) -> Self {
        Task {
            priority: Priority(descriptor.priority),
            state: if descriptor.flags.contains(TaskFlags::START_AT_BOOT) {
                TaskState::Healthy(SchedState::Runnable)
            } else {
                TaskState::default()
            },
            generation: 0,
            saved: None,
            descriptor,
        }
    }

    /// Tests whether this task has read access to `slice` as normal memory.
    ///
    /// This function is `must_use` because calling it without checking its
    /// return value is incredibly suspicious.
    #[must_use]
    fn can_read<T>(&self, slice: &USlice<T>) -> bool {
        self.can_access(slice, RegionAttributes::READ)
    }

    /// Tests whether this task has write access to `slice` as normal memory.
    #[must_use]
    fn can_write<T>(&self, slice: &USlice<T>) -> bool {
        self.can_access(slice, RegionAttributes::WRITE)
    }

    /// Tests whether this task has access to `slice` as normal memory with
    /// the given `desired` attributes.
    ///
    /// The slice must be _entirely covered_ by regions carrying `desired`.
    /// It may span multiple regions, but the regions spanned must be
    /// perfectly contiguous. Memory marked `DEVICE` or `DMA` never qualifies,
    /// because it is not sound to create Rust references into it.
    ///
    /// Note that all tasks can "access" any empty slice.
    #[must_use]
    fn can_access<T>(
        &self,
        slice: &USlice<T>,
        desired: RegionAttributes,
    ) -> bool {
        if slice.is_empty() {
            // We deliberately omit tests for empty slices, as they confer no
            // authority as far as the kernel is concerned. This is pretty
            // important because a literal like `&[]` tends to produce a base
            // address of `0 + sizeof::<T>()`, which is almost certainly
            // invalid according to the task's region map... but fine with us.
            return true;
        }

        let forbidden = RegionAttributes::DEVICE | RegionAttributes::DMA;

        // We need to be convinced that this slice is entirely covered by
        // regions with the right attributes. Each pass of the outer loop
        // advances the scan point to the end of a region that covers it;
        // since a region containing an address always ends beyond it, the
        // scan makes progress or fails.
        let mut scan_addr = slice.base_addr();
        let end_addr = slice.end_addr();
        'scan: while scan_addr < end_addr {
            for region in self.descriptor.regions {
                if region.contains(scan_addr)
                    && region.attributes.contains(desired)
                    && !region.attributes.intersects(forbidden)
                {
                    scan_addr = region.end_addr();
                    continue 'scan;
                }
            }
            // We've hit a hole without finishing our scan.
            return false;
        }
        true
    }

    /// Obtains access to the memory backing `slice` as a Rust slice, assuming
    /// that the task `self` can access it for read. This is used to access
    /// task memory from the kernel in validated form.
    pub fn try_read<'a, T>(
        &'a self,
        slice: &'a USlice<T>,
    ) -> Result<&'a [T], FaultInfo>
    where
        T: FromBytes + Immutable + KnownLayout,
    {
        if self.can_read(slice) {
            // Safety: assume_readable requires us to have validated that the
            // slice refers to normal task memory, which we did on the
            // previous line.
            unsafe { Ok(slice.assume_readable()) }
        } else {
            Err(FaultInfo::MemoryAccess {
                address: Some(slice.base_addr()),
                source: FaultSource::Kernel,
            })
        }
    }

    /// Obtains access to the memory backing `slice` as a Rust slice, assuming
    /// that the task `self` can access it for write.
    pub fn try_write<'a, T>(
        &'a mut self,
        slice: &'a mut USlice<T>,
    ) -> Result<&'a mut [T], FaultInfo>
    where
        T: FromBytes + Immutable + KnownLayout,
    {
        if self.can_write(slice) {
            // Safety: assume_writable requires us to have validated that the
            // slice refers to normal task memory, which we did on the
            // previous line.
            unsafe { Ok(slice.assume_writable()) }
        } else {
            Err(FaultInfo::MemoryAccess {
                address: Some(slice.base_addr()),
                source: FaultSource::Kernel,
            })
        }
    }

    /// Deposits the result of a kernel operation for this task to observe
    /// when it next runs.
    pub fn deposit_result(&mut self, result: Result<usize, IpcError>) {
        self.saved = Some(result);
    }

    /// Takes the most recently deposited operation result, if any.
    pub fn take_result(&mut self) -> Option<Result<usize, IpcError>> {
        self.saved.take()
    }

    /// Checks if this task is in a potentially schedulable state.
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Healthy(SchedState::Runnable))
    }

    /// Checks if this task is healthy (i.e. not faulted).
    pub fn is_healthy(&self) -> bool {
        matches!(self.state, TaskState::Healthy(_))
    }

    /// Rewrites this task's state back to its initial form, to effect a task
    /// reboot.
    ///
    /// This does not honor the `START_AT_BOOT` task flag, because this is not
    /// a system reboot. The task will be left in `Stopped` state. If you
    /// would like to run the task after reinitializing it, you must do so
    /// explicitly.
    pub fn reinitialize(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.saved = None;
        self.state = TaskState::default();
    }

    /// Returns a reference to the `TaskDesc` that was used to initially
    /// create this task.
    pub fn descriptor(&self) -> &'static TaskDesc {
        self.descriptor
    }

    /// Returns this task's current generation number.
    pub fn generation(&self) -> Generation {
        const MASK: u8 = ((1u32 << (16 - TaskId::INDEX_BITS)) - 1) as u8;
        Generation::from(self.generation as u8 & MASK)
    }

    /// Returns this task's priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns a reference to this task's current state, for inspection.
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Alters this task's state from one healthy state to another.
    ///
    /// To deliver a fault, use `force_fault` instead.
    ///
    /// The only currently supported way of getting a task out of fault state
    /// is `reinitialize`. There are a number of invariants that need to be
    /// upheld when a task begins running, and `reinitialize` gives us a place
    /// to centralize them.
    ///
    /// # Panics
    ///
    /// If you attempt to use this to bring a task out of fault state.
    pub fn set_healthy_state(&mut self, s: SchedState) {
        let last = core::mem::replace(&mut self.state, s.into());
        if let TaskState::Faulted { .. } = last {
            panic!();
        }
    }
}

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// We need to switch tasks, but this routine has not concluded which one
    /// should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch tasks, and we already know which one should run
    /// next. This is an optimization available in certain IPC cases.
    Specific(usize),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific task recommendations that *don't* agree get downgraded
            // to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

/// Puts a task into a forced fault condition.
///
/// The task will not be scheduled again until the fault is cleared. The
/// kernel won't clear faults on its own, it must be asked.
///
/// If the task is already faulted, we will retain the information about
/// what state the task was in *before* it faulted, and *erase* the last
/// fault. These kinds of double-faults are expected to be super rare.
///
/// Returns a `NextTask` under the assumption that, if you're hitting tasks
/// with faults, at least one of them is probably the current task; this
/// makes it harder to forget to request rescheduling. If you're faulting
/// some other task you can explicitly ignore the result.
pub fn force_fault(
    tasks: &mut [Task],
    index: usize,
    fault: FaultInfo,
) -> NextTask {
    let task = &mut tasks[index];
    task.state = match task.state {
        TaskState::Healthy(sched) => TaskState::Faulted {
            original_state: sched,
            fault,
        },
        TaskState::Faulted { original_state, .. } => {
            // Double fault - fault while faulted
            // Original fault information is lost
            TaskState::Faulted {
                fault,
                original_state,
            }
        }
    };
    NextTask::Other
}

/// Produces a current `TaskId` (i.e. one with the correct generation) for
/// `tasks[index]`.
pub fn current_id(tasks: &[Task], index: usize) -> TaskId {
    TaskId::for_index_and_gen(index, tasks[index].generation())
}
