// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and tasks.
//!
//! Everything in here crosses the caller/kernel boundary, which means it has
//! two audiences: kernel code that wants rich types, and the raw message
//! descriptor a task hands to the kernel by address. The descriptor itself is
//! plain-old-data (`zerocopy`-checked), while the richer views -- `Filter`,
//! optional references, and so on -- are recovered through accessors.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Names a particular incarnation of a task.
///
/// A `TaskId` combines two fields, a task index (which can be predicted at
/// compile time) and a task generation number. The generation number begins
/// counting at zero and wraps on overflow. Critically, the generation number
/// of a task is incremented when it is restarted. A mailbox filter naming an
/// outdated generation simply never matches, which provides assurance that a
/// peer has not lost its memory between steps of a multi-step exchange.
///
/// The task index is in the lower `TaskId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Number of bits in a `TaskId` used to represent task index, rather than
    /// generation number. This must currently be 15 or smaller.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `TaskId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        TaskId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }

    pub fn next_generation(self) -> Self {
        Self::for_index_and_gen(self.index(), self.generation().next())
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << TaskId::INDEX_BITS >> TaskId::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Peer selection for a rendezvous: either any task, or one specific task
/// incarnation.
///
/// This is the semantic form; the descriptor stores the packed [`PeerRef`]
/// encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Matches every task.
    Any,
    /// Matches exactly this task incarnation. A stale generation matches
    /// nothing.
    Specific(TaskId),
}

impl Filter {
    /// Checks whether a task with identity `id` satisfies this filter.
    pub fn admits(&self, id: TaskId) -> bool {
        match self {
            Filter::Any => true,
            Filter::Specific(peer) => *peer == id,
        }
    }
}

/// Packed descriptor encoding of a [`Filter`].
///
/// The all-ones value is reserved to mean "any task," so the task table index
/// `TaskId::INDEX_MASK` cannot be used by a real task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct PeerRef(pub u16);

impl PeerRef {
    pub const ANY: Self = Self(!0);

    pub fn filter(self) -> Filter {
        if self == Self::ANY {
            Filter::Any
        } else {
            Filter::Specific(TaskId(self.0))
        }
    }
}

impl From<Filter> for PeerRef {
    fn from(f: Filter) -> Self {
        match f {
            Filter::Any => Self::ANY,
            Filter::Specific(id) => Self(id.0),
        }
    }
}

impl From<TaskId> for PeerRef {
    fn from(id: TaskId) -> Self {
        Self(id.0)
    }
}

/// Names a mailbox in the kernel's mailbox table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MboxId(pub u16);

impl MboxId {
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// A task-supplied buffer address.
///
/// This is just an address: the associated length travels separately in the
/// descriptor's `size` field, which is rewritten during negotiation. Zero is
/// reserved to mean "no buffer" (header-only operation).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct UAddr(pub usize);

impl UAddr {
    pub const NULL: Self = Self(0);

    pub fn get(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0)
        }
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Names a block pool.
///
/// Two values are reserved: `NONE` (no pool) and `DETACHED`, which marks a
/// block whose ownership has been handed to a receiver, telling the
/// completion path not to release it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct PoolId(pub u16);

impl PoolId {
    pub const NONE: Self = Self(!0);
    pub const DETACHED: Self = Self(!0 - 1);

    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// Reference to a pool-allocated payload block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BlockRef {
    /// Owning pool, or one of the `PoolId` sentinels.
    pub pool: PoolId,
    /// Block index within the pool.
    pub index: u16,
}

impl BlockRef {
    pub const NONE: Self = Self {
        pool: PoolId::NONE,
        index: !0,
    };

    pub fn is_none(self) -> bool {
        self.pool == PoolId::NONE
    }

    /// Marks ownership of this block as transferred, so completion will not
    /// release it back to its pool.
    pub fn detach(&mut self) {
        self.pool = PoolId::DETACHED;
    }

    pub fn is_detached(self) -> bool {
        self.pool == PoolId::DETACHED
    }
}

/// Reference to a counting completion signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct SignalRef(pub u16);

impl SignalRef {
    pub const NONE: Self = Self(!0);

    pub fn get(self) -> Option<usize> {
        if self == Self::NONE {
            None
        } else {
            Some(usize::from(self.0))
        }
    }
}

/// Opaque handle to an in-flight deferred transfer, handed to a receiver that
/// accepted a message header without supplying a data buffer.
///
/// Packs an arena index and a generation number, `TaskId`-style, so a stale
/// handle is detected rather than resolving to an unrelated transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct TransferRef(pub u32);

impl TransferRef {
    pub const NONE: Self = Self(!0);

    pub const fn pack(index: u16, gen: u16) -> Self {
        Self((gen as u32) << 16 | index as u32)
    }

    pub fn unpack(self) -> Option<(u16, u16)> {
        if self == Self::NONE {
            None
        } else {
            Some((self.0 as u16, (self.0 >> 16) as u16))
        }
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// The message descriptor exchanged between a task and the kernel.
///
/// A task builds one of these on its stack and passes its address in; the
/// kernel copies it, rewrites fields during matching and transfer, and copies
/// it back at completion. The layout is fixed `repr(C)` with explicit
/// reserved padding so it can be moved across the boundary with validated
/// raw copies on both 32- and 64-bit targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MessageDescriptor {
    /// Requested byte count on submission; negotiated byte count afterward.
    pub size: usize,
    /// Data buffer address: source for a sender, destination for a receiver.
    /// `UAddr::NULL` requests a header-only exchange.
    pub buffer: UAddr,
    /// Application-defined word exchanged between matched peers on the
    /// synchronous path.
    pub info: u32,
    /// In-flight transfer handle; populated only by a header-only receive.
    pub transfer: TransferRef,
    /// Sending peer: a filter on submission of a receive, the actual sender
    /// identity after a match.
    pub source: PeerRef,
    /// Receiving peer: a filter on submission of a send, the actual receiver
    /// identity after a match.
    pub target: PeerRef,
    /// Pool block carrying the payload of an asynchronous send; `NONE`
    /// otherwise.
    pub block: BlockRef,
    /// Counting signal to bump at completion of an asynchronous send.
    pub signal: SignalRef,
    /// Reserved expansion space; pads this structure to a multiple of its
    /// alignment. You will need to adjust this when you add fields above.
    pub reserved: [u8; 6],
}

impl MessageDescriptor {
    /// Builds a sender's descriptor for a synchronous, buffer-backed message.
    pub fn send_to(
        target: Filter,
        size: usize,
        buffer: UAddr,
        info: u32,
    ) -> Self {
        Self {
            size,
            buffer,
            info,
            target: target.into(),
            ..Self::default()
        }
    }

    /// Builds a sender's descriptor for an asynchronous, block-backed
    /// message.
    pub fn send_block_to(
        target: Filter,
        size: usize,
        block: BlockRef,
        info: u32,
    ) -> Self {
        Self {
            size,
            info,
            block,
            target: target.into(),
            ..Self::default()
        }
    }

    /// Builds a receiver's descriptor. Pass `UAddr::NULL` as `buffer` for a
    /// header-only receive.
    pub fn receive_from(source: Filter, size: usize, buffer: UAddr) -> Self {
        Self {
            size,
            buffer,
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn source_filter(&self) -> Filter {
        self.source.filter()
    }

    pub fn target_filter(&self) -> Filter {
        self.target.filter()
    }

    /// True if this descriptor describes an asynchronous (block-backed) send.
    pub fn is_async(&self) -> bool {
        !self.block.is_none()
    }
}

impl Default for MessageDescriptor {
    fn default() -> Self {
        Self {
            size: 0,
            buffer: UAddr::NULL,
            info: 0,
            transfer: TransferRef::NONE,
            source: PeerRef::ANY,
            target: PeerRef::ANY,
            block: BlockRef::NONE,
            signal: SignalRef::NONE,
            reserved: [0; 6],
        }
    }
}

/// How long a submission is willing to wait for a peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Timeout {
    /// Fail immediately if no compatible peer is queued.
    None,
    /// Wait up to this many kernel ticks.
    Ticks(u32),
    /// Wait indefinitely.
    Unlimited,
}

/// Recoverable completion status reported to a caller, either as the
/// operation's immediate result or deposited at wake time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IpcError {
    /// No compatible peer was queued and the caller asked not to wait, or the
    /// kernel had no room to queue the request.
    NoMessage,
    /// The wait was real, and it expired.
    TimedOut,
    /// The queued request was withdrawn before it matched.
    Cancelled,
    /// Block pool allocation failed.
    NoMemory,
}

/// State used to make scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TaskState {
    /// Task is healthy and can be scheduled subject to the `SchedState`
    /// requirements.
    Healthy(SchedState),
    /// Task has been stopped by a fault and must not be scheduled without
    /// intervention.
    Faulted {
        /// Information about the fault.
        fault: FaultInfo,
        /// Record of the previous healthy state at the time the fault was
        /// taken.
        original_state: SchedState,
    },
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Healthy(SchedState::Stopped)
    }
}

/// Scheduler parameters for a healthy task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum SchedState {
    /// This task is ignored for scheduling purposes.
    Stopped,
    /// This task could be scheduled on the CPU.
    Runnable,
    /// This task is blocked waiting for its message to the given mailbox to
    /// be received and fully processed.
    InSend(MboxId),
    /// This task is blocked waiting for a message from the given mailbox.
    InRecv(MboxId),
}

impl From<SchedState> for TaskState {
    fn from(s: SchedState) -> Self {
        Self::Healthy(s)
    }
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The task asked the kernel to access memory it does not have rights to.
    /// This is `Option` because not every fault path can name a precise
    /// address.
    MemoryAccess {
        address: Option<usize>,
        source: FaultSource,
    },
    /// Arguments passed to a kernel operation were invalid.
    SyscallUsage(UsageError),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

/// A kernel-defined fault, arising from how a task used a kernel operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A task specified a slice as an argument, but the slice is patently
    /// invalid: it is either unaligned for its type, or it is expressed such
    /// that it would wrap around the end of the address space. Neither of
    /// these conditions is ever legal, so this represents a malfunction in
    /// the caller.
    InvalidSlice,
    /// A task named a task ID that will never be valid, as it's out of range.
    TaskOutOfRange,
    /// A task named a mailbox outside the kernel's mailbox table.
    MailboxOutOfRange,
    /// A task named a block pool outside the kernel's pool table.
    PoolOutOfRange,
    /// A task named a completion signal outside the kernel's signal table.
    SignalOutOfRange,
    /// A task submitted a block reference that does not name a live block it
    /// owns, or whose negotiated size exceeds the block's capacity.
    BadBlock,
    /// A task presented a transfer handle that does not name an in-flight
    /// transfer.
    BadTransfer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips_index_and_generation() {
        let id = TaskId::for_index_and_gen(5, Generation::from(3));
        assert_eq!(id.index(), 5);
        assert_eq!(id.generation(), Generation::from(3));
    }

    #[test]
    fn stale_generation_is_a_different_id() {
        let id = TaskId::for_index_and_gen(5, Generation::ZERO);
        assert_ne!(id, id.next_generation());
        assert_eq!(id.next_generation().index(), 5);
    }

    #[test]
    fn filter_admission() {
        let id = TaskId::for_index_and_gen(2, Generation::ZERO);
        assert!(Filter::Any.admits(id));
        assert!(Filter::Specific(id).admits(id));
        assert!(!Filter::Specific(id.next_generation()).admits(id));
    }

    #[test]
    fn peer_ref_round_trip() {
        let id = TaskId::for_index_and_gen(7, Generation::from(1));
        assert_eq!(PeerRef::from(Filter::Specific(id)).filter(),
            Filter::Specific(id));
        assert_eq!(PeerRef::ANY.filter(), Filter::Any);
    }

    #[test]
    fn transfer_ref_packing() {
        let t = TransferRef::pack(3, 9);
        assert_eq!(t.unpack(), Some((3, 9)));
        assert_eq!(TransferRef::NONE.unpack(), None);
    }

    #[test]
    fn descriptor_has_no_padding_surprises() {
        // IntoBytes requires the type to be free of implicit padding; this
        // just pins the explicit reserved field doing its job.
        assert_eq!(
            core::mem::size_of::<MessageDescriptor>()
                % core::mem::align_of::<MessageDescriptor>(),
            0
        );
    }
}
