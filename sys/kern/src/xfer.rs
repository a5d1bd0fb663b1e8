// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data movers: payload transfer between matched rendezvous halves.
//!
//! Once the matcher has agreed on a size, somebody has to move the bytes.
//! This module decides *when* that can happen. If both ends of the transfer
//! are known -- the sender always has a resolved source, and the receiver
//! supplied a buffer -- the copy is issued on the spot and the mover is
//! gone before the operation returns. If the receiver asked for the header
//! only, the mover parks in an arena, remembering the resolved source and
//! the sender's completion record, until the receiver comes back with a
//! destination.
//!
//! A mover also carries the priority at which the copy should run: the more
//! important of the two peers, so that neither side is starved by the copy
//! running at an inappropriately low level.

use abi::{BlockRef, MessageDescriptor, TransferRef, UsageError};

use crate::arena::{Arena, Handle, OutOfSlots};
use crate::config::DATA_MOVERS;
use crate::descs::Priority;
use crate::err::InteractFault;
use crate::mbox::PendingRequest;
use crate::pool::BlockPool;
use crate::task::Task;
use crate::umem::{copy_from_kernel, safe_copy, USlice};

/// Where a transfer's bytes come from.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Source {
    /// A synchronous sender's buffer, validated against that task's memory
    /// regions at copy time.
    TaskMem { task: u16, addr: usize },
    /// A kernel pool block filled by an asynchronous sender.
    Block(BlockRef),
}

/// Where a transfer's bytes go: a task buffer.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Dest {
    pub task: u16,
    pub addr: usize,
}

/// One in-flight payload transfer between a matched pair.
///
/// Exactly one of these exists per matched pair while the transfer is
/// outstanding. Movers that can run immediately never reach the arena; a
/// deferred mover is freed the moment its destination is supplied and the
/// copy issued.
#[derive(Copy, Clone, Debug)]
pub(crate) struct DataMover {
    pub source: Source,
    /// Destination, if resolved. `None` means the receiver has the header
    /// and owes the kernel a follow-up call naming a buffer.
    pub dest: Option<Dest>,
    /// Negotiated byte count.
    pub total: usize,
    /// More important of the two peers' priorities.
    pub priority: Priority,
    /// The sender's parked completion record, to be resumed when the
    /// transfer finishes. `None` when the sender is the running caller and
    /// completes inline.
    pub send_done: Option<Handle<PendingRequest>>,
    /// The receiver's parked completion record, for transfers issued while
    /// the receiver is still queued. `None` when the receiver is the running
    /// caller, or has already been completed with the header.
    pub recv_done: Option<Handle<PendingRequest>>,
}

/// Orchestrator verdict for a freshly matched pair.
pub(crate) enum Disposition {
    /// Nothing to move; both halves complete now. Carries the negotiated
    /// size for status reporting.
    NoData { size: usize },
    /// Both ends resolved; caller should `issue` this mover now. It never
    /// occupies an arena slot.
    Immediate(DataMover),
    /// Destination unresolved; the mover is parked and the receiver's
    /// descriptor now carries its handle.
    Deferred(Handle<DataMover>),
}

/// Builds the mover for a matched pair and decides its disposition.
///
/// `reader_desc` has already been through the matcher: its `size` is the
/// negotiated count and, for an asynchronous sender, its `block` is the
/// inherited payload block. On the deferred path this function stores the
/// mover and patches `reader_desc.transfer` with the handle.
///
/// A zero negotiated size short-circuits to `NoData` before either buffer
/// pointer is examined, so header-only handshakes never touch memory. A
/// synchronous sender with no buffer degenerates the same way: there is
/// nothing to fetch.
pub(crate) fn prepare(
    movers: &mut Arena<DataMover, DATA_MOVERS>,
    reader_task: u16,
    reader_desc: &mut MessageDescriptor,
    reader_priority: Priority,
    recv_done: Option<Handle<PendingRequest>>,
    writer_task: u16,
    writer_desc: &MessageDescriptor,
    writer_priority: Priority,
    send_done: Option<Handle<PendingRequest>>,
) -> Result<Disposition, OutOfSlots> {
    let total = reader_desc.size;
    if total == 0 {
        // No payload will move, so the receiver has no claim on the
        // sender's block; drop any reference the matcher handed it.
        reader_desc.block = BlockRef::NONE;
        return Ok(Disposition::NoData { size: 0 });
    }

    let source = if writer_desc.is_async() {
        Source::Block(writer_desc.block)
    } else if let Some(addr) = writer_desc.buffer.get() {
        Source::TaskMem {
            task: writer_task,
            addr,
        }
    } else {
        // Sender declared a size but no data; the exchange is header-only.
        return Ok(Disposition::NoData { size: total });
    };

    let mover = DataMover {
        source,
        dest: reader_desc.buffer.get().map(|addr| Dest {
            task: reader_task,
            addr,
        }),
        total,
        priority: reader_priority.max_importance(writer_priority),
        send_done,
        recv_done,
    };

    if mover.dest.is_some() {
        // The receiver gets a copy, not the block itself; the block
        // reference stays with the sender for release at completion.
        reader_desc.block = BlockRef::NONE;
        Ok(Disposition::Immediate(mover))
    } else {
        let h = movers.insert(mover)?;
        reader_desc.transfer = TransferRef::pack(h.index(), h.generation());
        Ok(Disposition::Deferred(h))
    }
}

/// Issues the copy for a mover whose destination `dest` is resolved.
///
/// Returns the byte count moved. Faults are attributed to the transfer's
/// source or destination side via `InteractFault`, exactly as a direct
/// task-to-task copy would.
pub(crate) fn issue(
    tasks: &mut [Task],
    pools: &[BlockPool],
    source: Source,
    dest: Dest,
    total: usize,
) -> Result<usize, InteractFault> {
    let dst_slice = USlice::from_raw(dest.addr, total)
        .map_err(InteractFault::in_dst)?;

    match source {
        Source::TaskMem { task, addr } => {
            let src_slice =
                USlice::from_raw(addr, total).map_err(InteractFault::in_src)?;
            safe_copy(
                tasks,
                usize::from(task),
                src_slice,
                usize::from(dest.task),
                dst_slice,
            )
        }
        Source::Block(b) => {
            let data = pools
                .get(b.pool.index())
                .and_then(|p| p.block_data(b.index))
                .ok_or_else(|| InteractFault::in_src(UsageError::BadBlock))?;
            let n = total.min(data.len());
            copy_from_kernel(
                tasks,
                usize::from(dest.task),
                dst_slice,
                &data[..n],
            )
            .map_err(InteractFault::in_dst)
        }
    }
}

/// Recovers an arena handle from a descriptor's packed transfer reference.
pub(crate) fn handle_from_ref(
    t: TransferRef,
) -> Option<Handle<DataMover>> {
    t.unpack().map(|(index, gen)| Handle::from_parts(index, gen))
}
