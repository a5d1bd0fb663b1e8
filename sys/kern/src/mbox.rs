// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mailbox rendezvous.
//!
//! A mailbox is a meeting point: senders and receivers name each other with
//! filters (a specific task, or anyone), and the first compatible pair to
//! meet exchanges a message. Neither side has to arrive first. Whichever
//! half shows up without a peer waits in one of the mailbox's two FIFOs --
//! or declines to wait, or waits with a deadline.
//!
//! Message size is negotiated at match time: the smaller of what the sender
//! offers and what the receiver will take. A receiver may accept a message
//! in two phases, first taking just the header (peer identity, negotiated
//! size, info word) and only later -- once it has seen what it is getting --
//! supplying a buffer for the payload, or adopting an asynchronous sender's
//! pool block outright instead of copying it.
//!
//! Senders come in two flavors. A synchronous sender blocks until its
//! message has been received *and* fully processed (including any deferred
//! data fetch). An asynchronous sender hands the kernel a filled pool block
//! and returns immediately; completion is reported by bumping a counting
//! signal rather than by waking anyone.
//!
//! Everything here runs inside the single-threaded command processor; see
//! the crate docs. In particular a match and the corresponding FIFO removal
//! happen within one operation, and a wait timer can never fire between
//! them.

use abi::{
    BlockRef, IpcError, MboxId, MessageDescriptor, PoolId, SchedState,
    SignalRef, TaskId, Timeout, TransferRef, UAddr, UsageError,
};
use ringbuf::Ringbuf;

use crate::arena::{Arena, Handle};
use crate::config::{
    BLOCK_POOLS, BLOCK_SIZE, DATA_MOVERS, MAILBOXES, PENDING_REQUESTS,
    SIGNALS, TRACE_DEPTH,
};
use crate::descs::Priority;
use crate::err::UserError;
use crate::pool::BlockPool;
use crate::task::{current_id, force_fault, NextTask, Task};
use crate::time::Timestamp;
use crate::umem::USlice;
use crate::xfer::{self, Dest, Disposition, Source};

/// Trace events recorded by the mailbox subsystem.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Reset,
    SendQueued(u16),
    RecvQueued(u16),
    Delivered { mbox: u16, bytes: usize },
    HeaderDelivered { mbox: u16, priority: u8 },
    DataFetched(usize),
    Discarded,
    BlockAdopted(u16),
    AsyncDone(bool),
    Refused(u16),
    TimedOut(u16),
    Cancelled(u16),
}

/// Which FIFO a pending request lives in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Send,
    Recv,
}

/// Lifecycle of a parked request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    /// Linked into a mailbox FIFO, eligible for matching and timeout.
    Queued,
    /// Matched; a sender parked here until a deferred data fetch completes.
    AwaitingData,
}

/// How to report completion to the request's owner.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Waker {
    /// Owner is blocked; deposit a result and make it runnable.
    Task,
    /// Nobody is blocked; bump the descriptor's counting signal on success.
    Signal,
}

/// The parked half of a rendezvous: everything the kernel needs to finish
/// the exchange later without the submitting call's stack.
///
/// A request is created when a submission cannot finish within its own
/// command processor step, and destroyed when it is matched to completion,
/// cancelled, or timed out. While `Queued` it is owned by a mailbox FIFO;
/// once matched, ownership passes to the transfer machinery.
pub(crate) struct PendingRequest {
    /// Identity of the submitting task incarnation.
    pub owner: TaskId,
    /// Task table slot of the owner.
    pub owner_index: u16,
    /// Kernel copy of the caller's descriptor, mutated by matching.
    pub desc: MessageDescriptor,
    /// Where to copy the descriptor back at completion. `None` on the
    /// asynchronous path, which has no one waiting to look at it.
    pub reply_to: Option<USlice<MessageDescriptor>>,
    pub waker: Waker,
    pub priority: Priority,
    pub mbox: MboxId,
    pub dir: Direction,
    /// Wait deadline; `None` waits forever. Cleared when matched.
    pub deadline: Option<Timestamp>,
    /// FIFO linkage.
    pub next: Option<ReqHandle>,
    pub phase: Phase,
}

pub(crate) type ReqHandle = Handle<PendingRequest>;

/// An intrusive FIFO of pending requests, linked through the arena.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ReqQueue {
    head: Option<ReqHandle>,
    tail: Option<ReqHandle>,
}

/// A mailbox: two FIFOs of unmatched halves.
///
/// Invariant: a request never remains linked here after it has been
/// matched; matching and unlinking happen within one command processor
/// step.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Mailbox {
    pub writers: ReqQueue,
    pub readers: ReqQueue,
}

/// A counting completion signal.
#[derive(Copy, Clone, Debug, Default)]
pub struct Signal {
    count: u32,
}

impl Signal {
    pub fn post(&mut self) {
        self.count = self.count.wrapping_add(1);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Consumes one completion, if any has been posted.
    pub fn take(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }
}

/// All state owned by the mailbox subsystem.
///
/// This is mutated only under the command processor's exclusive borrow;
/// there is deliberately no interior mutability and no locking here.
pub struct MboxState {
    pub(crate) mailboxes: [Mailbox; MAILBOXES],
    pub(crate) pending: Arena<PendingRequest, PENDING_REQUESTS>,
    pub(crate) movers: Arena<xfer::DataMover, DATA_MOVERS>,
    pub(crate) pools: [BlockPool; BLOCK_POOLS],
    pub(crate) signals: [Signal; SIGNALS],
    pub(crate) now: Timestamp,
    /// Event trace, readable by a debugger.
    pub trace: Ringbuf<Event, TRACE_DEPTH>,
}

impl MboxState {
    pub fn new() -> Self {
        Self {
            mailboxes: [Mailbox::default(); MAILBOXES],
            pending: Arena::new(),
            movers: Arena::new(),
            pools: core::array::from_fn(|i| BlockPool::new(PoolId(i as u16))),
            signals: [Signal::default(); SIGNALS],
            now: Timestamp::default(),
            trace: Ringbuf::new(Event::Reset),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn signal_count(&self, s: SignalRef) -> Option<u32> {
        self.signals.get(s.get()?).map(Signal::count)
    }

    /// Consumes one completion from signal `s`, if posted.
    pub fn signal_take(&mut self, s: SignalRef) -> bool {
        s.get()
            .and_then(|i| self.signals.get_mut(i))
            .is_some_and(Signal::take)
    }

    /// Allocates a payload block from `pool` on behalf of a caller preparing
    /// an asynchronous send.
    pub fn allocate_block(
        &mut self,
        pool: PoolId,
    ) -> Result<BlockRef, UserError> {
        let p = self
            .pools
            .get_mut(pool.index())
            .ok_or(UsageError::PoolOutOfRange)?;
        p.allocate().ok_or(UserError::Recoverable(
            IpcError::NoMemory,
            NextTask::Same,
        ))
    }

    /// Returns a block to its pool. Used by receivers that adopted a block
    /// and are done with it.
    pub fn release_block(&mut self, b: BlockRef) -> Result<(), UserError> {
        let p = self
            .pools
            .get_mut(b.pool.index())
            .ok_or(UsageError::BadBlock)?;
        if !p.is_allocated(b.index) {
            return Err(UsageError::BadBlock.into());
        }
        p.release(b.index);
        Ok(())
    }

    pub fn block_bytes(&self, b: BlockRef) -> Result<&[u8], UserError> {
        self.pools
            .get(b.pool.index())
            .and_then(|p| p.block_data(b.index))
            .ok_or_else(|| UsageError::BadBlock.into())
    }

    pub fn block_bytes_mut(
        &mut self,
        b: BlockRef,
    ) -> Result<&mut [u8], UserError> {
        self.pools
            .get_mut(b.pool.index())
            .and_then(|p| p.block_data_mut(b.index))
            .ok_or_else(|| UsageError::BadBlock.into())
    }

    /// Address of a block's payload, for zero-copy identity checks.
    pub fn block_addr(&self, b: BlockRef) -> Option<usize> {
        self.pools.get(b.pool.index())?.block_addr(b.index)
    }

    pub fn block_is_live(&self, b: BlockRef) -> bool {
        self.pools
            .get(b.pool.index())
            .is_some_and(|p| p.is_allocated(b.index))
    }

    /// Counts `(senders, receivers)` currently queued at `mbox`. Intended
    /// for diagnostics.
    pub fn queued(&self, mbox: MboxId) -> (usize, usize) {
        let Some(mb) = self.mailboxes.get(mbox.index()) else {
            return (0, 0);
        };
        (
            queue_len(&self.pending, &mb.writers),
            queue_len(&self.pending, &mb.readers),
        )
    }
}

impl Default for MboxState {
    fn default() -> Self {
        Self::new()
    }
}

// --- FIFO plumbing -------------------------------------------------------

fn queue_push(
    pending: &mut Arena<PendingRequest, PENDING_REQUESTS>,
    q: &mut ReqQueue,
    h: ReqHandle,
) {
    if let Some(req) = pending.get_mut(h) {
        req.next = None;
    }
    match q.tail {
        Some(t) => {
            if let Some(tr) = pending.get_mut(t) {
                tr.next = Some(h);
            }
        }
        None => q.head = Some(h),
    }
    q.tail = Some(h);
}

fn queue_unlink(
    pending: &mut Arena<PendingRequest, PENDING_REQUESTS>,
    q: &mut ReqQueue,
    h: ReqHandle,
) -> bool {
    let mut prev: Option<ReqHandle> = None;
    let mut cur = q.head;
    while let Some(c) = cur {
        let next = pending.get(c).and_then(|r| r.next);
        if c == h {
            match prev {
                Some(p) => {
                    if let Some(pr) = pending.get_mut(p) {
                        pr.next = next;
                    }
                }
                None => q.head = next,
            }
            if q.tail == Some(h) {
                q.tail = prev;
            }
            if let Some(r) = pending.get_mut(h) {
                r.next = None;
            }
            return true;
        }
        prev = cur;
        cur = next;
    }
    false
}

/// Finds the first queued request satisfying `pred`, in FIFO (submission)
/// order. Matching is first-compatible, not best-fit: fairness among equal
/// candidates is by arrival.
fn queue_scan(
    pending: &Arena<PendingRequest, PENDING_REQUESTS>,
    q: &ReqQueue,
    pred: impl Fn(&PendingRequest) -> bool,
) -> Option<ReqHandle> {
    let mut cur = q.head;
    while let Some(h) = cur {
        let req = pending.get(h)?;
        if pred(req) {
            return Some(h);
        }
        cur = req.next;
    }
    None
}

fn queue_len(
    pending: &Arena<PendingRequest, PENDING_REQUESTS>,
    q: &ReqQueue,
) -> usize {
    let mut n = 0;
    let mut cur = q.head;
    while let Some(h) = cur {
        n += 1;
        cur = pending.get(h).and_then(|r| r.next);
    }
    n
}

// --- Matching ------------------------------------------------------------

/// Filter compatibility between a receiver and a sender: each side's filter
/// must admit the other's identity.
pub(crate) fn compatible(
    reader: &MessageDescriptor,
    reader_id: TaskId,
    writer: &MessageDescriptor,
    writer_id: TaskId,
) -> bool {
    reader.source_filter().admits(writer_id)
        && writer.target_filter().admits(reader_id)
}

/// Applies a match to a compatible pair, negotiating the transfer size and
/// exchanging identities.
///
/// Both descriptors' `size` fields become `min` of the two requests. On the
/// synchronous path the peers are introduced to each other -- the receiver
/// learns the sender's identity, the sender learns the receiver's -- and
/// their `info` words are swapped. On the asynchronous path the receiver
/// learns the sender's identity and inherits the payload block, and that is
/// all: `info` does not move. (That asymmetry is long-standing observed
/// behavior of this protocol; peers that need the `info` word must use a
/// synchronous exchange.)
///
/// Returns the negotiated size, or `None` if the pair is not compatible.
pub(crate) fn match_pair(
    reader: &mut MessageDescriptor,
    reader_id: TaskId,
    writer: &mut MessageDescriptor,
    writer_id: TaskId,
) -> Option<usize> {
    if !compatible(reader, reader_id, writer, writer_id) {
        return None;
    }
    let negotiated = reader.size.min(writer.size);
    reader.size = negotiated;
    writer.size = negotiated;

    reader.source = writer_id.into();
    if writer.is_async() {
        reader.block = writer.block;
    } else {
        writer.target = reader_id.into();
        core::mem::swap(&mut reader.info, &mut writer.info);
    }
    Some(negotiated)
}

// --- Completion ----------------------------------------------------------

/// Retires an asynchronous submission: gives the payload block back to its
/// pool (unless a receiver adopted it) and, on success, bumps the sender's
/// completion signal.
fn settle_async(
    pools: &mut [BlockPool],
    signals: &mut [Signal],
    trace: &mut Ringbuf<Event, TRACE_DEPTH>,
    desc: &MessageDescriptor,
    success: bool,
) {
    if !desc.block.is_none() && !desc.block.is_detached() {
        if let Some(p) = pools.get_mut(desc.block.pool.index()) {
            p.release(desc.block.index);
        }
    }
    if success {
        if let Some(i) = desc.signal.get() {
            if let Some(s) = signals.get_mut(i) {
                s.post();
            }
        }
    }
    trace.entry(line!() as u16, Event::AsyncDone(success));
}

/// Delivers a final result to a parked request's owner.
///
/// For a blocked task this copies the (rewritten) descriptor back into the
/// caller's memory, deposits the status, and makes the task runnable again.
/// For an asynchronous sender there is no task to wake; the completion
/// signal and block pool do the talking.
fn complete(
    tasks: &mut [Task],
    pools: &mut [BlockPool],
    signals: &mut [Signal],
    trace: &mut Ringbuf<Event, TRACE_DEPTH>,
    mut req: PendingRequest,
    outcome: Result<usize, IpcError>,
) -> NextTask {
    match req.waker {
        Waker::Signal => {
            settle_async(pools, signals, trace, &req.desc, outcome.is_ok());
            NextTask::Same
        }
        Waker::Task => {
            let idx = usize::from(req.owner_index);
            // There must still be somebody to tell: same incarnation, not
            // faulted in the meantime.
            if idx >= tasks.len()
                || current_id(tasks, idx) != req.owner
                || !tasks[idx].is_healthy()
            {
                return NextTask::Same;
            }
            if let Some(mut slice) = req.reply_to.take() {
                if let Err(f) = write_descriptor(tasks, idx, &mut slice, req.desc)
                {
                    return force_fault(tasks, idx, f);
                }
            }
            tasks[idx].deposit_result(outcome);
            tasks[idx].set_healthy_state(SchedState::Runnable);
            NextTask::Specific(idx)
        }
    }
}

/// Completes whichever halves of a finished transfer are parked in the
/// arena, following the mover's continuation handles. Halves belonging to
/// the running caller have no handle here and are completed inline by the
/// operation itself.
fn finish_continuations(
    tasks: &mut [Task],
    pending: &mut Arena<PendingRequest, PENDING_REQUESTS>,
    pools: &mut [BlockPool],
    signals: &mut [Signal],
    trace: &mut Ringbuf<Event, TRACE_DEPTH>,
    m: &xfer::DataMover,
    outcome: Result<usize, IpcError>,
) -> NextTask {
    let mut hint = NextTask::Same;
    if let Some(rh) = m.recv_done {
        if let Some(req) = pending.remove(rh) {
            hint = hint
                .combine(complete(tasks, pools, signals, trace, req, outcome));
        }
    }
    if let Some(wh) = m.send_done {
        if let Some(req) = pending.remove(wh) {
            hint = hint
                .combine(complete(tasks, pools, signals, trace, req, outcome));
        }
    }
    hint
}

/// Completes the sender half parked behind a deferred transfer.
fn finish_sender(
    tasks: &mut [Task],
    pending: &mut Arena<PendingRequest, PENDING_REQUESTS>,
    pools: &mut [BlockPool],
    signals: &mut [Signal],
    trace: &mut Ringbuf<Event, TRACE_DEPTH>,
    send_done: Option<ReqHandle>,
    outcome: Result<usize, IpcError>,
) -> NextTask {
    if let Some(wh) = send_done {
        if let Some(req) = pending.remove(wh) {
            return complete(tasks, pools, signals, trace, req, outcome);
        }
    }
    NextTask::Same
}

// --- Descriptor shuttling ------------------------------------------------

fn mailbox_index(mbox: MboxId) -> Result<usize, UserError> {
    if mbox.index() < MAILBOXES {
        Ok(mbox.index())
    } else {
        Err(UsageError::MailboxOutOfRange.into())
    }
}

fn read_descriptor(
    tasks: &[Task],
    caller: usize,
    slice: &USlice<MessageDescriptor>,
) -> Result<MessageDescriptor, UserError> {
    if slice.len() != 1 {
        return Err(UsageError::InvalidSlice.into());
    }
    let d = tasks[caller].try_read(slice)?;
    Ok(d[0])
}

fn write_descriptor(
    tasks: &mut [Task],
    task: usize,
    slice: &mut USlice<MessageDescriptor>,
    desc: MessageDescriptor,
) -> Result<(), abi::FaultInfo> {
    let dst = tasks[task].try_write(slice)?;
    if let Some(slot) = dst.first_mut() {
        *slot = desc;
    }
    Ok(())
}

fn deadline_for(now: Timestamp, timeout: Timeout) -> Option<Timestamp> {
    match timeout {
        // `None` is handled before queueing; an unqueued request needs no
        // deadline.
        Timeout::None => None,
        Timeout::Ticks(t) => Some(now + u64::from(t)),
        Timeout::Unlimited => None,
    }
}

// --- Sender-side rendezvous ----------------------------------------------

enum WriterOutcome {
    /// No compatible receiver queued.
    NoPeer,
    /// Message fully handed off; `size` is the negotiated count.
    Done { size: usize, hint: NextTask },
    /// A receiver took the header; the sender's record is parked awaiting
    /// the data fetch.
    Deferred { hint: NextTask },
}

/// Attempts to rendezvous an arriving sender with a queued receiver.
///
/// Scans the mailbox's receiver FIFO in submission order and takes the
/// first compatible entry. Shared between the synchronous and asynchronous
/// send paths; they differ only in `waker` and in what happens afterward.
fn writer_rendezvous(
    tasks: &mut [Task],
    sys: &mut MboxState,
    caller: usize,
    mi: usize,
    priority: Priority,
    wdesc: &mut MessageDescriptor,
    waker: Waker,
    reply_to: Option<USlice<MessageDescriptor>>,
) -> Result<WriterOutcome, UserError> {
    let caller_id = current_id(tasks, caller);
    let wdesc_orig = *wdesc;
    let mut hint_acc = NextTask::Same;

    loop {
        let MboxState {
            mailboxes,
            pending,
            movers,
            pools,
            signals,
            trace,
            ..
        } = &mut *sys;
        let readers = &mut mailboxes[mi].readers;

        let Some(rh) = queue_scan(pending, readers, |r| {
            compatible(&r.desc, r.owner, wdesc, caller_id)
        }) else {
            return Ok(WriterOutcome::NoPeer);
        };

        // If this match will defer, it needs a mover slot and a slot to park
        // the sender. Check before mutating anything so refusal is clean.
        let would_defer = pending.get(rh).is_some_and(|r| {
            let negotiated = r.desc.size.min(wdesc.size);
            negotiated != 0
                && r.desc.buffer.is_null()
                && (wdesc.is_async() || !wdesc.buffer.is_null())
        });
        if would_defer && (!movers.has_space() || !pending.has_space()) {
            return Err(UserError::Recoverable(IpcError::NoMemory, hint_acc));
        }

        let step = {
            let Some(r) = pending.get_mut(rh) else {
                return Ok(WriterOutcome::NoPeer);
            };
            match match_pair(&mut r.desc, r.owner, wdesc, caller_id) {
                Some(n) => {
                    // A match cancels the receiver's wait timer.
                    r.deadline = None;
                    Some((r.owner_index, n))
                }
                None => None,
            }
        };
        let Some((r_owner_index, negotiated)) = step else {
            // Unreachable: the scan predicate established compatibility.
            return Ok(WriterOutcome::NoPeer);
        };
        queue_unlink(pending, readers, rh);

        let disp = {
            let Some(r) = pending.get_mut(rh) else {
                return Ok(WriterOutcome::NoPeer);
            };
            xfer::prepare(
                movers,
                r.owner_index,
                &mut r.desc,
                r.priority,
                Some(rh),
                caller as u16,
                wdesc,
                priority,
                None,
            )
        };
        let disp = match disp {
            Ok(d) => d,
            Err(_) => {
                return Err(UserError::Recoverable(
                    IpcError::NoMemory,
                    hint_acc,
                ))
            }
        };

        match disp {
            Disposition::NoData { size } => {
                let hint = match pending.remove(rh) {
                    Some(req) => {
                        complete(tasks, pools, signals, trace, req, Ok(size))
                    }
                    None => NextTask::Same,
                };
                trace.entry(
                    line!() as u16,
                    Event::Delivered {
                        mbox: mi as u16,
                        bytes: size,
                    },
                );
                return Ok(WriterOutcome::Done {
                    size,
                    hint: hint.combine(hint_acc),
                });
            }
            Disposition::Immediate(m) => {
                let Some(dest) = m.dest else {
                    return Ok(WriterOutcome::NoPeer);
                };
                match xfer::issue(tasks, pools, m.source, dest, m.total) {
                    Ok(n) => {
                        let hint = finish_continuations(
                            tasks, pending, pools, signals, trace, &m, Ok(n),
                        );
                        trace.entry(
                            line!() as u16,
                            Event::Delivered {
                                mbox: mi as u16,
                                bytes: n,
                            },
                        );
                        return Ok(WriterOutcome::Done {
                            size: n,
                            hint: hint.combine(hint_acc),
                        });
                    }
                    Err(interact) => {
                        // The receiver's buffer was bad: fault it, drop its
                        // request, and try the next receiver. A fault on our
                        // own side propagates out.
                        let wake = interact
                            .apply_to_dst(tasks, usize::from(r_owner_index))?;
                        hint_acc = hint_acc.combine(wake);
                        pending.remove(rh);
                        *wdesc = wdesc_orig;
                        continue;
                    }
                }
            }
            Disposition::Deferred(mh) => {
                // Park the sender so the receiver's follow-up call can find
                // and finish it.
                let wreq = PendingRequest {
                    owner: caller_id,
                    owner_index: caller as u16,
                    desc: *wdesc,
                    reply_to,
                    waker,
                    priority,
                    mbox: MboxId(mi as u16),
                    dir: Direction::Send,
                    deadline: None,
                    next: None,
                    phase: Phase::AwaitingData,
                };
                let wh = match pending.insert(wreq) {
                    Ok(wh) => wh,
                    Err(_) => {
                        // Unreachable: capacity was checked above.
                        return Err(UserError::Recoverable(
                            IpcError::NoMemory,
                            hint_acc,
                        ));
                    }
                };
                if let Some(m) = movers.get_mut(mh) {
                    m.send_done = Some(wh);
                    m.recv_done = None;
                }
                // The receiver completes now, with header and size only.
                let pri = movers
                    .get(mh)
                    .map(|m| m.priority.0)
                    .unwrap_or_default();
                let hint = match pending.remove(rh) {
                    Some(req) => complete(
                        tasks,
                        pools,
                        signals,
                        trace,
                        req,
                        Ok(negotiated),
                    ),
                    None => NextTask::Same,
                };
                trace.entry(
                    line!() as u16,
                    Event::HeaderDelivered {
                        mbox: mi as u16,
                        priority: pri,
                    },
                );
                return Ok(WriterOutcome::Deferred {
                    hint: hint.combine(hint_acc),
                });
            }
        }
    }
}

// --- Public operations ---------------------------------------------------

/// Applies an operation result the way the common entry sequence would:
/// recoverable errors are deposited as the caller's status, unrecoverable
/// ones become faults.
pub fn apply_outcome(
    tasks: &mut [Task],
    caller: usize,
    r: Result<NextTask, UserError>,
) -> NextTask {
    match r {
        Ok(nt) => nt,
        Err(UserError::Recoverable(code, hint)) => {
            tasks[caller].deposit_result(Err(code));
            hint
        }
        Err(UserError::Unrecoverable(fault)) => {
            force_fault(tasks, caller, fault)
        }
    }
}

/// Synchronous send.
///
/// Blocks the caller until the message is received and fully processed, the
/// wait times out, or -- with `Timeout::None` -- fails immediately when no
/// compatible receiver is queued. The caller's descriptor is rewritten at
/// completion with the negotiated size, the receiver's identity, and the
/// receiver's `info` word.
pub fn send(
    tasks: &mut [Task],
    sys: &mut MboxState,
    caller: usize,
    mbox: MboxId,
    priority: Priority,
    desc_slice: USlice<MessageDescriptor>,
    timeout: Timeout,
) -> Result<NextTask, UserError> {
    let mi = mailbox_index(mbox)?;
    let mut wdesc = read_descriptor(tasks, caller, &desc_slice)?;
    // A synchronous send carries no block, signal, or transfer state.
    wdesc.block = BlockRef::NONE;
    wdesc.signal = SignalRef::NONE;
    wdesc.transfer = TransferRef::NONE;

    match writer_rendezvous(
        tasks,
        sys,
        caller,
        mi,
        priority,
        &mut wdesc,
        Waker::Task,
        Some(desc_slice.clone()),
    )? {
        WriterOutcome::Done { size, hint } => {
            let mut slice = desc_slice;
            write_descriptor(tasks, caller, &mut slice, wdesc)?;
            tasks[caller].deposit_result(Ok(size));
            Ok(hint)
        }
        WriterOutcome::Deferred { hint } => {
            // Received, not yet processed: stay blocked until the receiver
            // fetches (or discards) the data.
            tasks[caller].set_healthy_state(SchedState::InSend(mbox));
            Ok(hint.combine(NextTask::Other))
        }
        WriterOutcome::NoPeer => match timeout {
            Timeout::None => {
                sys.trace.entry(line!() as u16, Event::Refused(mbox.0));
                Err(UserError::Recoverable(
                    IpcError::NoMessage,
                    NextTask::Same,
                ))
            }
            _ => {
                let req = PendingRequest {
                    owner: current_id(tasks, caller),
                    owner_index: caller as u16,
                    desc: wdesc,
                    reply_to: Some(desc_slice),
                    waker: Waker::Task,
                    priority,
                    mbox,
                    dir: Direction::Send,
                    deadline: deadline_for(sys.now, timeout),
                    next: None,
                    phase: Phase::Queued,
                };
                let h = sys.pending.insert(req).map_err(|_| {
                    UserError::Recoverable(IpcError::NoMemory, NextTask::Same)
                })?;
                queue_push(
                    &mut sys.pending,
                    &mut sys.mailboxes[mi].writers,
                    h,
                );
                tasks[caller].set_healthy_state(SchedState::InSend(mbox));
                sys.trace.entry(line!() as u16, Event::SendQueued(mbox.0));
                Ok(NextTask::Other)
            }
        },
    }
}

/// Asynchronous (fire-and-forget) send of a pool block.
///
/// Never blocks. If no receiver is ready the message queues indefinitely;
/// the kernel owns the block from this point on. Completion -- the message
/// received and fully processed -- is reported by bumping `signal`, if one
/// is supplied. The block returns to its pool automatically unless the
/// receiver adopts it.
pub fn send_async_block(
    tasks: &mut [Task],
    sys: &mut MboxState,
    caller: usize,
    mbox: MboxId,
    priority: Priority,
    desc_slice: USlice<MessageDescriptor>,
    signal: Option<SignalRef>,
) -> Result<NextTask, UserError> {
    let mi = mailbox_index(mbox)?;
    let mut wdesc = read_descriptor(tasks, caller, &desc_slice)?;
    wdesc.buffer = UAddr::NULL;
    wdesc.transfer = TransferRef::NONE;

    let sig = signal.unwrap_or(SignalRef::NONE);
    if let Some(i) = sig.get() {
        if i >= SIGNALS {
            return Err(UsageError::SignalOutOfRange.into());
        }
    }
    wdesc.signal = sig;

    // The block must be live, owned, and big enough for the declared size.
    let b = wdesc.block;
    if b.is_none() || b.is_detached() {
        return Err(UsageError::BadBlock.into());
    }
    let live = sys
        .pools
        .get(b.pool.index())
        .is_some_and(|p| p.is_allocated(b.index));
    if !live || wdesc.size > BLOCK_SIZE {
        return Err(UsageError::BadBlock.into());
    }

    match writer_rendezvous(
        tasks,
        sys,
        caller,
        mi,
        priority,
        &mut wdesc,
        Waker::Signal,
        None,
    )? {
        WriterOutcome::Done { size: _, hint } => {
            // Delivered in full within this step: retire the block and count
            // the completion.
            let MboxState {
                pools,
                signals,
                trace,
                ..
            } = sys;
            settle_async(pools, signals, trace, &wdesc, true);
            Ok(hint)
        }
        WriterOutcome::Deferred { hint } => Ok(hint),
        WriterOutcome::NoPeer => {
            let req = PendingRequest {
                owner: current_id(tasks, caller),
                owner_index: caller as u16,
                desc: wdesc,
                reply_to: None,
                waker: Waker::Signal,
                priority,
                mbox,
                dir: Direction::Send,
                deadline: None,
                next: None,
                phase: Phase::Queued,
            };
            let h = sys.pending.insert(req).map_err(|_| {
                UserError::Recoverable(IpcError::NoMemory, NextTask::Same)
            })?;
            queue_push(&mut sys.pending, &mut sys.mailboxes[mi].writers, h);
            sys.trace.entry(line!() as u16, Event::SendQueued(mbox.0));
            Ok(NextTask::Same)
        }
    }
}

/// Withdraws a still-queued asynchronous send, identified by its payload
/// block.
///
/// The post-condition matches a timeout: the request leaves the FIFO, its
/// block returns to the pool, and no completion is signaled. Fails with
/// `NoMessage` if no such send is queued -- including the benign race where
/// it was matched before the cancel arrived.
pub fn cancel_async(
    tasks: &mut [Task],
    sys: &mut MboxState,
    caller: usize,
    mbox: MboxId,
    block: BlockRef,
) -> Result<NextTask, UserError> {
    let mi = mailbox_index(mbox)?;
    let MboxState {
        mailboxes,
        pending,
        pools,
        signals,
        trace,
        ..
    } = &mut *sys;
    let writers = &mut mailboxes[mi].writers;

    let Some(h) = queue_scan(pending, writers, |w| {
        w.waker == Waker::Signal && w.desc.block == block
    }) else {
        return Err(UserError::Recoverable(
            IpcError::NoMessage,
            NextTask::Same,
        ));
    };
    queue_unlink(pending, writers, h);
    let hint = match pending.remove(h) {
        Some(req) => {
            complete(tasks, pools, signals, trace, req, Err(IpcError::Cancelled))
        }
        None => NextTask::Same,
    };
    trace.entry(line!() as u16, Event::Cancelled(mbox.0));
    tasks[caller].deposit_result(Ok(0));
    Ok(hint)
}

/// Receive.
///
/// With a buffer in the descriptor this is a full receive: the payload is
/// copied in before the caller resumes. With a null buffer the caller gets
/// the header only -- peer identity, negotiated size, `info`, and (for an
/// asynchronous sender) the payload block reference -- plus a transfer
/// handle in `descriptor.transfer`; it must then finish the exchange with
/// [`receive_data`] or [`receive_data_as_block`].
pub fn receive(
    tasks: &mut [Task],
    sys: &mut MboxState,
    caller: usize,
    mbox: MboxId,
    desc_slice: USlice<MessageDescriptor>,
    timeout: Timeout,
) -> Result<NextTask, UserError> {
    let mi = mailbox_index(mbox)?;
    let mut rdesc = read_descriptor(tasks, caller, &desc_slice)?;
    rdesc.block = BlockRef::NONE;
    rdesc.signal = SignalRef::NONE;
    rdesc.transfer = TransferRef::NONE;

    let caller_id = current_id(tasks, caller);
    let caller_priority = tasks[caller].priority();
    let rdesc_orig = rdesc;
    let mut hint_acc = NextTask::Same;

    loop {
        let MboxState {
            mailboxes,
            pending,
            movers,
            pools,
            signals,
            trace,
            ..
        } = &mut *sys;
        let writers = &mut mailboxes[mi].writers;

        let Some(wh) = queue_scan(pending, writers, |w| {
            compatible(&rdesc, caller_id, &w.desc, w.owner)
        }) else {
            break;
        };

        // A deferral needs a mover slot; the sender already has its record.
        let would_defer = pending.get(wh).is_some_and(|w| {
            let negotiated = rdesc.size.min(w.desc.size);
            negotiated != 0
                && rdesc.buffer.is_null()
                && (w.desc.is_async() || !w.desc.buffer.is_null())
        });
        if would_defer && !movers.has_space() {
            return Err(UserError::Recoverable(IpcError::NoMemory, hint_acc));
        }

        let step = {
            let Some(w) = pending.get_mut(wh) else {
                break;
            };
            match match_pair(&mut rdesc, caller_id, &mut w.desc, w.owner) {
                Some(n) => {
                    w.deadline = None;
                    Some((w.owner_index, n))
                }
                None => None,
            }
        };
        let Some((w_owner_index, negotiated)) = step else {
            break;
        };
        queue_unlink(pending, writers, wh);

        let disp = {
            let Some(w) = pending.get_mut(wh) else {
                break;
            };
            xfer::prepare(
                movers,
                caller as u16,
                &mut rdesc,
                caller_priority,
                None,
                w.owner_index,
                &w.desc,
                w.priority,
                Some(wh),
            )
        };
        let disp = match disp {
            Ok(d) => d,
            Err(_) => {
                return Err(UserError::Recoverable(
                    IpcError::NoMemory,
                    hint_acc,
                ))
            }
        };

        match disp {
            Disposition::NoData { size } => {
                let hint = match pending.remove(wh) {
                    Some(req) => {
                        complete(tasks, pools, signals, trace, req, Ok(size))
                    }
                    None => NextTask::Same,
                };
                trace.entry(
                    line!() as u16,
                    Event::Delivered {
                        mbox: mi as u16,
                        bytes: size,
                    },
                );
                let mut slice = desc_slice;
                write_descriptor(tasks, caller, &mut slice, rdesc)?;
                tasks[caller].deposit_result(Ok(size));
                return Ok(hint.combine(hint_acc));
            }
            Disposition::Immediate(m) => {
                let Some(dest) = m.dest else {
                    break;
                };
                match xfer::issue(tasks, pools, m.source, dest, m.total) {
                    Ok(n) => {
                        // A block source was consumed by the copy; the
                        // sender's completion releases it.
                        let hint = finish_continuations(
                            tasks, pending, pools, signals, trace, &m, Ok(n),
                        );
                        trace.entry(
                            line!() as u16,
                            Event::Delivered {
                                mbox: mi as u16,
                                bytes: n,
                            },
                        );
                        let mut slice = desc_slice;
                        write_descriptor(tasks, caller, &mut slice, rdesc)?;
                        tasks[caller].deposit_result(Ok(n));
                        return Ok(hint.combine(hint_acc));
                    }
                    Err(interact) => {
                        // The sender's payload was bad: fault it, discard
                        // its request, and try the next sender. A fault on
                        // our own side propagates out.
                        let wake = interact
                            .apply_to_src(tasks, usize::from(w_owner_index))?;
                        hint_acc = hint_acc.combine(wake);
                        pending.remove(wh);
                        rdesc = rdesc_orig;
                        continue;
                    }
                }
            }
            Disposition::Deferred(mh) => {
                // The sender parks where it is; our descriptor now carries
                // the transfer handle (and, for an async sender, the block).
                if let Some(w) = pending.get_mut(wh) {
                    w.phase = Phase::AwaitingData;
                }
                let pri = movers
                    .get(mh)
                    .map(|m| m.priority.0)
                    .unwrap_or_default();
                trace.entry(
                    line!() as u16,
                    Event::HeaderDelivered {
                        mbox: mi as u16,
                        priority: pri,
                    },
                );
                let mut slice = desc_slice;
                write_descriptor(tasks, caller, &mut slice, rdesc)?;
                tasks[caller].deposit_result(Ok(negotiated));
                return Ok(hint_acc);
            }
        }
    }

    // No compatible sender queued.
    match timeout {
        Timeout::None => {
            sys.trace.entry(line!() as u16, Event::Refused(mbox.0));
            Err(UserError::Recoverable(IpcError::NoMessage, hint_acc))
        }
        _ => {
            let req = PendingRequest {
                owner: caller_id,
                owner_index: caller as u16,
                desc: rdesc,
                reply_to: Some(desc_slice),
                waker: Waker::Task,
                priority: caller_priority,
                mbox,
                dir: Direction::Recv,
                deadline: deadline_for(sys.now, timeout),
                next: None,
                phase: Phase::Queued,
            };
            let h = sys.pending.insert(req).map_err(|_| {
                UserError::Recoverable(IpcError::NoMemory, hint_acc.clone())
            })?;
            queue_push(&mut sys.pending, &mut sys.mailboxes[mi].readers, h);
            tasks[caller].set_healthy_state(SchedState::InRecv(mbox));
            sys.trace.entry(line!() as u16, Event::RecvQueued(mbox.0));
            Ok(NextTask::Other.combine(hint_acc))
        }
    }
}

/// Two-phase follow-up: supply a destination buffer for a previously
/// header-only receive, completing the stored transfer. A null buffer
/// disposes of the message without retrieving the payload.
///
/// Calling this with no transfer pending is a no-op that reports success;
/// the null handle is itself the indication that nothing is owed.
pub fn receive_data(
    tasks: &mut [Task],
    sys: &mut MboxState,
    caller: usize,
    desc_slice: USlice<MessageDescriptor>,
) -> Result<NextTask, UserError> {
    let mut rdesc = read_descriptor(tasks, caller, &desc_slice)?;

    let Some(mh) = xfer::handle_from_ref(rdesc.transfer) else {
        tasks[caller].deposit_result(Ok(0));
        return Ok(NextTask::Same);
    };

    let MboxState {
        pending,
        movers,
        pools,
        signals,
        trace,
        ..
    } = &mut *sys;

    let Some(m) = movers.get(mh).copied() else {
        return Err(UsageError::BadTransfer.into());
    };

    match rdesc.buffer.get() {
        None => {
            // Dispose without retrieving. The sender still completes -- its
            // message was received -- and the payload is dropped.
            movers.remove(mh);
            let hint = finish_sender(
                tasks,
                pending,
                pools,
                signals,
                trace,
                m.send_done,
                Ok(m.total),
            );
            trace.entry(line!() as u16, Event::Discarded);
            rdesc.transfer = TransferRef::NONE;
            rdesc.block = BlockRef::NONE;
            let mut slice = desc_slice;
            write_descriptor(tasks, caller, &mut slice, rdesc)?;
            tasks[caller].deposit_result(Ok(0));
            Ok(hint)
        }
        Some(addr) => {
            let dest = Dest {
                task: caller as u16,
                addr,
            };
            match xfer::issue(tasks, pools, m.source, dest, m.total) {
                Ok(n) => {
                    movers.remove(mh);
                    let hint = finish_sender(
                        tasks,
                        pending,
                        pools,
                        signals,
                        trace,
                        m.send_done,
                        Ok(n),
                    );
                    trace.entry(line!() as u16, Event::DataFetched(n));
                    rdesc.transfer = TransferRef::NONE;
                    rdesc.block = BlockRef::NONE;
                    rdesc.size = n;
                    let mut slice = desc_slice;
                    write_descriptor(tasks, caller, &mut slice, rdesc)?;
                    tasks[caller].deposit_result(Ok(n));
                    Ok(hint)
                }
                Err(interact) => {
                    // The transfer dies regardless of whose fault this is.
                    movers.remove(mh);
                    let mut wake = NextTask::Same;
                    if let (Source::TaskMem { task, .. }, Some(f)) =
                        (m.source, interact.src)
                    {
                        wake = wake
                            .combine(force_fault(tasks, usize::from(task), f));
                    }
                    wake = wake.combine(finish_sender(
                        tasks,
                        pending,
                        pools,
                        signals,
                        trace,
                        m.send_done,
                        Err(IpcError::NoMessage),
                    ));
                    if let Some(f) = interact.dst {
                        return Err(f.into());
                    }
                    rdesc.transfer = TransferRef::NONE;
                    rdesc.block = BlockRef::NONE;
                    let mut slice = desc_slice;
                    write_descriptor(tasks, caller, &mut slice, rdesc)?;
                    Err(UserError::Recoverable(IpcError::NoMessage, wake))
                }
            }
        }
    }
}

/// Two-phase follow-up that finishes the transfer into a pool block instead
/// of a caller buffer.
///
/// Against an asynchronous sender this adopts the sender's block outright:
/// no bytes move, ownership transfers, and the completion path is told not
/// to release it. Against a synchronous sender a block is allocated from
/// `pool` and the payload copied into it. Allocation does not pend in this
/// kernel; a dry pool reports `NoMemory` immediately regardless of
/// `_timeout`, and the transfer stays pending so the caller may retry.
pub fn receive_data_as_block(
    tasks: &mut [Task],
    sys: &mut MboxState,
    caller: usize,
    desc_slice: USlice<MessageDescriptor>,
    out_block_slice: USlice<BlockRef>,
    pool: PoolId,
    _timeout: Timeout,
) -> Result<NextTask, UserError> {
    if out_block_slice.len() != 1 {
        return Err(UsageError::InvalidSlice.into());
    }
    let mut rdesc = read_descriptor(tasks, caller, &desc_slice)?;

    let Some(mh) = xfer::handle_from_ref(rdesc.transfer) else {
        tasks[caller].deposit_result(Ok(0));
        return Ok(NextTask::Same);
    };

    let MboxState {
        pending,
        movers,
        pools,
        signals,
        trace,
        ..
    } = &mut *sys;

    let Some(m) = movers.get(mh).copied() else {
        return Err(UsageError::BadTransfer.into());
    };

    match m.source {
        Source::Block(b) => {
            // Zero-copy: adopt the sender's block. Ownership moves to the
            // caller; the sender's completion must not release it.
            let mut ob = out_block_slice;
            {
                let dst = tasks[caller].try_write(&mut ob)?;
                if let Some(slot) = dst.first_mut() {
                    *slot = b;
                }
            }
            if let Some(wh) = m.send_done {
                if let Some(w) = pending.get_mut(wh) {
                    w.desc.block.detach();
                }
            }
            movers.remove(mh);
            let hint = finish_sender(
                tasks,
                pending,
                pools,
                signals,
                trace,
                m.send_done,
                Ok(m.total),
            );
            trace.entry(line!() as u16, Event::BlockAdopted(b.pool.0));
            rdesc.transfer = TransferRef::NONE;
            rdesc.block = b;
            rdesc.size = m.total;
            let mut slice = desc_slice;
            write_descriptor(tasks, caller, &mut slice, rdesc)?;
            tasks[caller].deposit_result(Ok(m.total));
            Ok(hint)
        }
        Source::TaskMem { task, addr } => {
            // Synchronous sender: capture its payload into a fresh block.
            if pool.index() >= BLOCK_POOLS {
                return Err(UsageError::PoolOutOfRange.into());
            }
            let Some(nb) = pools[pool.index()].allocate() else {
                return Err(UserError::Recoverable(
                    IpcError::NoMemory,
                    NextTask::Same,
                ));
            };

            let src_slice = match USlice::from_raw(addr, m.total) {
                Ok(s) => s,
                Err(e) => {
                    // The parked sender's buffer is malformed; it faults and
                    // the transfer is torn down.
                    pools[pool.index()].release(nb.index);
                    let wake =
                        force_fault(tasks, usize::from(task), e.into());
                    movers.remove(mh);
                    let wake = wake.combine(finish_sender(
                        tasks,
                        pending,
                        pools,
                        signals,
                        trace,
                        m.send_done,
                        Err(IpcError::NoMessage),
                    ));
                    return Err(UserError::Recoverable(
                        IpcError::NoMessage,
                        wake,
                    ));
                }
            };

            let copied = {
                let data = pools[pool.index()]
                    .block_data_mut(nb.index)
                    .map(|d| {
                        let n = m.total.min(d.len());
                        crate::umem::copy_to_kernel(
                            tasks,
                            usize::from(task),
                            src_slice,
                            &mut d[..n],
                        )
                    });
                match data {
                    Some(r) => r,
                    None => Ok(0),
                }
            };

            match copied {
                Ok(n) => {
                    let mut ob = out_block_slice;
                    {
                        let dst = match tasks[caller].try_write(&mut ob) {
                            Ok(d) => d,
                            Err(f) => {
                                pools[pool.index()].release(nb.index);
                                return Err(f.into());
                            }
                        };
                        if let Some(slot) = dst.first_mut() {
                            *slot = nb;
                        }
                    }
                    movers.remove(mh);
                    let hint = finish_sender(
                        tasks,
                        pending,
                        pools,
                        signals,
                        trace,
                        m.send_done,
                        Ok(n),
                    );
                    trace.entry(line!() as u16, Event::BlockAdopted(nb.pool.0));
                    rdesc.transfer = TransferRef::NONE;
                    rdesc.block = nb;
                    rdesc.size = n;
                    let mut slice = desc_slice;
                    write_descriptor(tasks, caller, &mut slice, rdesc)?;
                    tasks[caller].deposit_result(Ok(n));
                    Ok(hint)
                }
                Err(f) => {
                    // Sender-side fault while reading its buffer.
                    pools[pool.index()].release(nb.index);
                    let wake = force_fault(tasks, usize::from(task), f);
                    movers.remove(mh);
                    let wake = wake.combine(finish_sender(
                        tasks,
                        pending,
                        pools,
                        signals,
                        trace,
                        m.send_done,
                        Err(IpcError::NoMessage),
                    ));
                    Err(UserError::Recoverable(IpcError::NoMessage, wake))
                }
            }
        }
    }
}

/// Advances kernel time and expires queued waits whose deadline has passed.
///
/// Expired requests leave their FIFO and complete with `TimedOut` through
/// the normal completion path, so a timed-out blocked task wakes with a
/// distinguished status. Called from the tick handler, inside the command
/// processor -- expiry can therefore never race a match on the same
/// request.
pub fn tick(
    tasks: &mut [Task],
    sys: &mut MboxState,
    now: Timestamp,
) -> NextTask {
    sys.now = now;
    let mut hint = NextTask::Same;
    for i in 0..PENDING_REQUESTS {
        let Some(h) = sys.pending.handle_at(i) else {
            continue;
        };
        let expired = matches!(
            sys.pending.get(h),
            Some(r) if r.phase == Phase::Queued
                && r.deadline.is_some_and(|d| d <= now)
        );
        if !expired {
            continue;
        }
        let MboxState {
            mailboxes,
            pending,
            pools,
            signals,
            trace,
            ..
        } = &mut *sys;
        let Some((mi, dir)) =
            pending.get(h).map(|r| (r.mbox.index(), r.dir))
        else {
            continue;
        };
        let q = match dir {
            Direction::Send => &mut mailboxes[mi].writers,
            Direction::Recv => &mut mailboxes[mi].readers,
        };
        queue_unlink(pending, q, h);
        if let Some(req) = pending.remove(h) {
            trace.entry(line!() as u16, Event::TimedOut(req.mbox.0));
            hint = hint.combine(complete(
                tasks,
                pools,
                signals,
                trace,
                req,
                Err(IpcError::TimedOut),
            ));
        }
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descs::{
        RegionAttributes, RegionDesc, TaskDesc, TaskFlags, REGIONS_PER_TASK,
    };
    use abi::{Filter, Generation, TaskState};

    const MB: MboxId = MboxId(0);

    fn make_task(prio: u8) -> Task {
        let r: &'static RegionDesc = Box::leak(Box::new(RegionDesc {
            base: 0x1000,
            size: usize::MAX - 0x2000,
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        }));
        let desc = Box::leak(Box::new(TaskDesc {
            regions: [r; REGIONS_PER_TASK],
            priority: prio,
            flags: TaskFlags::START_AT_BOOT,
        }));
        Task::from_descriptor(desc)
    }

    fn world(prios: &[u8]) -> (Vec<Task>, MboxState) {
        (prios.iter().map(|&p| make_task(p)).collect(), MboxState::new())
    }

    /// Parks a descriptor in leaked memory, as a caller would keep one on
    /// its stack across a blocking call, and returns the kernel's view of
    /// it plus its address for later inspection.
    fn desc_slot(
        d: MessageDescriptor,
    ) -> (USlice<MessageDescriptor>, usize) {
        let p: &'static mut MessageDescriptor = Box::leak(Box::new(d));
        let addr = p as *mut MessageDescriptor as usize;
        (USlice::from_raw(addr, 1).unwrap(), addr)
    }

    fn read_desc(addr: usize) -> MessageDescriptor {
        unsafe { (addr as *const MessageDescriptor).read() }
    }

    fn leak_buf(data: &[u8]) -> usize {
        Box::leak(data.to_vec().into_boxed_slice()).as_ptr() as usize
    }

    fn bytes_at(addr: usize, len: usize) -> Vec<u8> {
        unsafe { core::slice::from_raw_parts(addr as *const u8, len).to_vec() }
    }

    fn id(tasks: &[Task], i: usize) -> TaskId {
        current_id(tasks, i)
    }

    #[test]
    fn rendezvous_reader_first() {
        let (mut tasks, mut sys) = world(&[4, 4]);

        let rbuf = leak_buf(&[0; 16]);
        let (rslice, raddr) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            16,
            UAddr(rbuf),
        ));
        let r = receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Unlimited);
        assert_eq!(r.unwrap(), NextTask::Other);
        assert_eq!(
            tasks[1].state(),
            &TaskState::Healthy(SchedState::InRecv(MB))
        );

        let payload = [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7];
        let wbuf = leak_buf(&payload);
        let (wslice, waddr) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            8,
            UAddr(wbuf),
            0x42,
        ));
        let r = send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        );
        assert_eq!(r.unwrap(), NextTask::Specific(1));

        // Both sides resume with the negotiated size.
        assert!(tasks[0].is_runnable());
        assert!(tasks[1].is_runnable());
        assert_eq!(tasks[0].take_result(), Some(Ok(8)));
        assert_eq!(tasks[1].take_result(), Some(Ok(8)));

        // The receiver got the payload prefix and the sender's info word.
        assert_eq!(bytes_at(rbuf, 8), payload);
        let rdesc = read_desc(raddr);
        assert_eq!(rdesc.size, 8);
        assert_eq!(rdesc.info, 0x42);
        assert_eq!(rdesc.source_filter(), Filter::Specific(id(&tasks, 0)));

        // The sender learned the receiver's identity and original info.
        let wdesc = read_desc(waddr);
        assert_eq!(wdesc.size, 8);
        assert_eq!(wdesc.info, 0);
        assert_eq!(wdesc.target_filter(), Filter::Specific(id(&tasks, 1)));

        assert_eq!(sys.queued(MB), (0, 0));
    }

    #[test]
    fn rendezvous_writer_first() {
        let (mut tasks, mut sys) = world(&[4, 4]);

        let payload = [1, 2, 3, 4];
        let wbuf = leak_buf(&payload);
        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            4,
            UAddr(wbuf),
            7,
        ));
        let r = send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        );
        assert_eq!(r.unwrap(), NextTask::Other);
        assert_eq!(
            tasks[0].state(),
            &TaskState::Healthy(SchedState::InSend(MB))
        );
        assert_eq!(sys.queued(MB), (1, 0));

        let rbuf = leak_buf(&[0; 8]);
        let (rslice, raddr) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(rbuf),
        ));
        let r = receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::None);
        assert_eq!(r.unwrap(), NextTask::Specific(0));

        assert!(tasks[0].is_runnable());
        assert_eq!(tasks[0].take_result(), Some(Ok(4)));
        assert_eq!(tasks[1].take_result(), Some(Ok(4)));
        assert_eq!(bytes_at(rbuf, 4), payload);
        assert_eq!(read_desc(raddr).info, 7);
        assert_eq!(sys.queued(MB), (0, 0));
    }

    #[test]
    fn negotiated_size_is_min_in_both_submission_orders() {
        for reader_first in [true, false] {
            let (mut tasks, mut sys) = world(&[4, 4]);
            let wbuf = leak_buf(&[9; 16]);
            let rbuf = leak_buf(&[0; 8]);
            let (wslice, waddr) = desc_slot(MessageDescriptor::send_to(
                Filter::Any,
                16,
                UAddr(wbuf),
                0,
            ));
            let (rslice, raddr) = desc_slot(MessageDescriptor::receive_from(
                Filter::Any,
                8,
                UAddr(rbuf),
            ));
            if reader_first {
                receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Unlimited)
                    .unwrap();
                send(
                    &mut tasks,
                    &mut sys,
                    0,
                    MB,
                    Priority(4),
                    wslice,
                    Timeout::Unlimited,
                )
                .unwrap();
            } else {
                send(
                    &mut tasks,
                    &mut sys,
                    0,
                    MB,
                    Priority(4),
                    wslice,
                    Timeout::Unlimited,
                )
                .unwrap();
                receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Unlimited)
                    .unwrap();
            }
            assert_eq!(read_desc(waddr).size, 8);
            assert_eq!(read_desc(raddr).size, 8);
            assert_eq!(tasks[0].take_result(), Some(Ok(8)));
            assert_eq!(tasks[1].take_result(), Some(Ok(8)));
        }
    }

    #[test]
    fn incompatible_filters_leave_both_queued() {
        let (mut tasks, mut sys) = world(&[4, 4, 4]);

        // Receiver will only take messages from task 2...
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Specific(id(&tasks, 2)),
            8,
            UAddr(leak_buf(&[0; 8])),
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Unlimited)
            .unwrap();

        // ...so task 0's send does not match and queues behind it.
        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            8,
            UAddr(leak_buf(&[1; 8])),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        assert_eq!(sys.queued(MB), (1, 1));
        assert!(!tasks[0].is_runnable());
        assert!(!tasks[1].is_runnable());
    }

    #[test]
    fn fifo_fairness_first_queued_reader_matches() {
        let (mut tasks, mut sys) = world(&[4, 4, 4, 4]);

        for i in 1..4 {
            let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
                Filter::Any,
                8,
                UAddr(leak_buf(&[0; 8])),
            ));
            receive(&mut tasks, &mut sys, i, MB, rslice, Timeout::Unlimited)
                .unwrap();
        }
        assert_eq!(sys.queued(MB), (0, 3));

        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            8,
            UAddr(leak_buf(&[5; 8])),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        // First queued receiver wins; the others stay put.
        assert!(tasks[1].is_runnable());
        assert!(!tasks[2].is_runnable());
        assert!(!tasks[3].is_runnable());
        assert_eq!(sys.queued(MB), (0, 2));
    }

    #[test]
    fn no_wait_reports_immediately() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(leak_buf(&[0; 8])),
        ));
        let r = receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::None);
        let _ = apply_outcome(&mut tasks, 1, r);
        assert_eq!(tasks[1].take_result(), Some(Err(IpcError::NoMessage)));
        assert!(tasks[1].is_runnable());
        assert_eq!(sys.queued(MB), (0, 0));
    }

    #[test]
    fn timeout_expires_and_unqueues() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(leak_buf(&[0; 8])),
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Ticks(10))
            .unwrap();
        assert_eq!(sys.queued(MB), (0, 1));

        let hint = tick(&mut tasks, &mut sys, Timestamp::from(9));
        assert_eq!(hint, NextTask::Same);
        assert_eq!(sys.queued(MB), (0, 1));
        assert!(!tasks[1].is_runnable());

        let hint = tick(&mut tasks, &mut sys, Timestamp::from(10));
        assert_eq!(hint, NextTask::Specific(1));
        assert_eq!(sys.queued(MB), (0, 0));
        assert!(tasks[1].is_runnable());
        assert_eq!(tasks[1].take_result(), Some(Err(IpcError::TimedOut)));
    }

    #[test]
    fn match_cancels_wait_timer() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(leak_buf(&[0; 8])),
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Ticks(10))
            .unwrap();

        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            8,
            UAddr(leak_buf(&[3; 8])),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::None,
        )
        .unwrap();
        assert_eq!(tasks[1].take_result(), Some(Ok(8)));

        // Long after the original deadline: nothing further happens.
        let hint = tick(&mut tasks, &mut sys, Timestamp::from(100));
        assert_eq!(hint, NextTask::Same);
        assert_eq!(tasks[1].take_result(), None);
    }

    #[test]
    fn zero_size_exchanges_touch_no_memory() {
        // Buffer addresses here are garbage on both sides; if any path
        // tried to move bytes the region checks (or the hardware) would
        // object. Size zero must short-circuit first.
        let (mut tasks, mut sys) = world(&[4, 4]);
        let (rslice, raddr) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            0,
            UAddr(0xDEAD_BEE0),
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Unlimited)
            .unwrap();

        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            4,
            UAddr::NULL,
            0x55,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        assert_eq!(tasks[0].take_result(), Some(Ok(0)));
        assert_eq!(tasks[1].take_result(), Some(Ok(0)));
        // Header still moves: the info word arrived.
        assert_eq!(read_desc(raddr).info, 0x55);
    }

    #[test]
    fn header_only_receive_defers_then_fetches() {
        let (mut tasks, mut sys) = world(&[4, 4]);

        let payload = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6];
        let (wslice, waddr) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            6,
            UAddr(leak_buf(&payload)),
            0x33,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        // Header-only receive: null buffer.
        let (rslice, raddr) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            64,
            UAddr::NULL,
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice.clone(), Timeout::None)
            .unwrap();

        // Receiver has header and size; sender is still parked.
        assert_eq!(tasks[1].take_result(), Some(Ok(6)));
        let rdesc = read_desc(raddr);
        assert_eq!(rdesc.size, 6);
        assert_eq!(rdesc.info, 0x33);
        assert!(!rdesc.transfer.is_none());
        assert!(!tasks[0].is_runnable());
        assert_eq!(sys.queued(MB), (0, 0));

        // Second phase: supply a destination.
        let fetch = leak_buf(&[0; 16]);
        {
            let mut d = read_desc(raddr);
            d.buffer = UAddr(fetch);
            unsafe { (raddr as *mut MessageDescriptor).write(d) };
        }
        receive_data(&mut tasks, &mut sys, 1, rslice).unwrap();

        assert_eq!(tasks[1].take_result(), Some(Ok(6)));
        assert_eq!(bytes_at(fetch, 6), payload);
        // Deferral is transparent: same bytes a full receive would get.
        assert!(tasks[0].is_runnable());
        assert_eq!(tasks[0].take_result(), Some(Ok(6)));
        assert_eq!(read_desc(waddr).target_filter(),
            Filter::Specific(id(&tasks, 1)));
        assert!(read_desc(raddr).transfer.is_none());
        assert_eq!(sys.movers.live_count(), 0);
        assert_eq!(sys.pending.live_count(), 0);
    }

    #[test]
    fn receive_data_without_transfer_is_a_noop() {
        let (mut tasks, mut sys) = world(&[4]);
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(leak_buf(&[0; 8])),
        ));
        let r = receive_data(&mut tasks, &mut sys, 0, rslice);
        assert_eq!(r.unwrap(), NextTask::Same);
        assert_eq!(tasks[0].take_result(), Some(Ok(0)));
    }

    #[test]
    fn receive_data_with_null_buffer_discards() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            4,
            UAddr(leak_buf(&[8; 4])),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            4,
            UAddr::NULL,
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice.clone(), Timeout::None)
            .unwrap();
        tasks[1].take_result();

        // Null buffer in the follow-up: dispose without retrieving.
        receive_data(&mut tasks, &mut sys, 1, rslice).unwrap();
        assert_eq!(tasks[1].take_result(), Some(Ok(0)));
        // The sender still completes; its message was received.
        assert!(tasks[0].is_runnable());
        assert_eq!(tasks[0].take_result(), Some(Ok(4)));
        assert_eq!(sys.movers.live_count(), 0);
    }

    #[test]
    fn async_send_queues_without_blocking() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let b = sys.allocate_block(PoolId(0)).unwrap();
        sys.block_bytes_mut(b).unwrap()[..4].copy_from_slice(&[7, 7, 7, 7]);

        let (wslice, _) = desc_slot(MessageDescriptor::send_block_to(
            Filter::Any,
            4,
            b,
            0,
        ));
        let r = send_async_block(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Some(SignalRef(0)),
        );
        assert_eq!(r.unwrap(), NextTask::Same);
        assert!(tasks[0].is_runnable());
        assert_eq!(sys.queued(MB), (1, 0));
        assert_eq!(sys.signal_count(SignalRef(0)), Some(0));

        // A full receive drains it: data copied, block released, signal
        // bumped.
        let rbuf = leak_buf(&[0; 8]);
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(rbuf),
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::None).unwrap();
        assert_eq!(tasks[1].take_result(), Some(Ok(4)));
        assert_eq!(bytes_at(rbuf, 4), [7, 7, 7, 7]);
        assert_eq!(sys.signal_count(SignalRef(0)), Some(1));
        assert!(!sys.block_is_live(b));
    }

    #[test]
    fn async_info_stays_put() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let (rslice, raddr) = desc_slot(MessageDescriptor {
            info: 0x11,
            ..MessageDescriptor::receive_from(
                Filter::Any,
                8,
                UAddr(leak_buf(&[0; 8])),
            )
        });
        receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Unlimited)
            .unwrap();

        let b = sys.allocate_block(PoolId(0)).unwrap();
        let (wslice, waddr) = desc_slot(MessageDescriptor::send_block_to(
            Filter::Any,
            4,
            b,
            0x99,
        ));
        send_async_block(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            None,
        )
        .unwrap();

        // The info word moves on the synchronous path only.
        assert_eq!(read_desc(raddr).info, 0x11);
        assert_eq!(read_desc(waddr).info, 0x99);
    }

    #[test]
    fn async_block_adoption_is_zero_copy() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let b = sys.allocate_block(PoolId(0)).unwrap();
        let payload = [0xC0, 0xC1, 0xC2, 0xC3, 0xC4];
        sys.block_bytes_mut(b).unwrap()[..5].copy_from_slice(&payload);
        let src_addr = sys.block_addr(b).unwrap();

        let (wslice, _) = desc_slot(MessageDescriptor::send_block_to(
            Filter::Any,
            5,
            b,
            0,
        ));
        send_async_block(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(2),
            wslice,
            Some(SignalRef(1)),
        )
        .unwrap();

        // Header-only receive inherits the block reference.
        let (rslice, raddr) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            64,
            UAddr::NULL,
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice.clone(), Timeout::None)
            .unwrap();
        let rdesc = read_desc(raddr);
        assert_eq!(rdesc.block, b);
        assert!(!rdesc.transfer.is_none());
        assert_eq!(sys.signal_count(SignalRef(1)), Some(0));

        // Adopt the block: ownership moves, nothing is copied or freed.
        let (obslice, obaddr) = {
            let p: &'static mut BlockRef = Box::leak(Box::new(BlockRef::NONE));
            let addr = p as *mut BlockRef as usize;
            (USlice::<BlockRef>::from_raw(addr, 1).unwrap(), addr)
        };
        receive_data_as_block(
            &mut tasks,
            &mut sys,
            1,
            rslice,
            obslice,
            PoolId(0),
            Timeout::None,
        )
        .unwrap();

        let adopted = unsafe { (obaddr as *const BlockRef).read() };
        assert_eq!(adopted, b);
        // Same block, same bytes, same address: no copy happened.
        assert!(sys.block_is_live(b));
        assert_eq!(sys.block_addr(b), Some(src_addr));
        assert_eq!(&sys.block_bytes(b).unwrap()[..5], &payload);
        // The sender completed without the pool reclaiming the block.
        assert_eq!(sys.signal_count(SignalRef(1)), Some(1));
        assert_eq!(tasks[1].take_result(), Some(Ok(5)));
        assert_eq!(sys.movers.live_count(), 0);
        assert_eq!(sys.pending.live_count(), 0);

        // The adopting receiver owns the block now and can return it.
        sys.release_block(b).unwrap();
        assert!(!sys.block_is_live(b));
    }

    #[test]
    fn block_fetch_from_sync_sender_copies_into_fresh_block() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let payload = [9, 8, 7, 6];
        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            4,
            UAddr(leak_buf(&payload)),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            4,
            UAddr::NULL,
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice.clone(), Timeout::None)
            .unwrap();
        tasks[1].take_result();

        let (obslice, obaddr) = {
            let p: &'static mut BlockRef = Box::leak(Box::new(BlockRef::NONE));
            let addr = p as *mut BlockRef as usize;
            (USlice::<BlockRef>::from_raw(addr, 1).unwrap(), addr)
        };
        receive_data_as_block(
            &mut tasks,
            &mut sys,
            1,
            rslice,
            obslice,
            PoolId(1),
            Timeout::None,
        )
        .unwrap();

        let nb = unsafe { (obaddr as *const BlockRef).read() };
        assert_eq!(nb.pool, PoolId(1));
        assert!(sys.block_is_live(nb));
        assert_eq!(&sys.block_bytes(nb).unwrap()[..4], &payload);
        assert_eq!(tasks[1].take_result(), Some(Ok(4)));
        // Sender completed normally.
        assert!(tasks[0].is_runnable());
        assert_eq!(tasks[0].take_result(), Some(Ok(4)));
    }

    #[test]
    fn block_fetch_reports_pool_exhaustion_and_keeps_transfer() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        // Drain pool 1 entirely.
        let mut held = Vec::new();
        while let Ok(b) = sys.allocate_block(PoolId(1)) {
            held.push(b);
        }

        let payload = [5, 5, 5, 5];
        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            4,
            UAddr(leak_buf(&payload)),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();
        let (rslice, raddr) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            4,
            UAddr::NULL,
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice.clone(), Timeout::None)
            .unwrap();
        tasks[1].take_result();

        let (obslice, _) = {
            let p: &'static mut BlockRef = Box::leak(Box::new(BlockRef::NONE));
            let addr = p as *mut BlockRef as usize;
            (USlice::<BlockRef>::from_raw(addr, 1).unwrap(), addr)
        };
        let r = receive_data_as_block(
            &mut tasks,
            &mut sys,
            1,
            rslice.clone(),
            obslice,
            PoolId(1),
            Timeout::None,
        );
        assert!(matches!(
            r,
            Err(UserError::Recoverable(IpcError::NoMemory, _))
        ));
        // The transfer survives; a plain fetch still succeeds.
        assert_eq!(sys.movers.live_count(), 1);
        let fetch = leak_buf(&[0; 8]);
        {
            let mut d = read_desc(raddr);
            d.buffer = UAddr(fetch);
            unsafe { (raddr as *mut MessageDescriptor).write(d) };
        }
        receive_data(&mut tasks, &mut sys, 1, rslice).unwrap();
        assert_eq!(bytes_at(fetch, 4), payload);
        assert!(tasks[0].is_runnable());
    }

    #[test]
    fn cancel_async_releases_block_without_signaling() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let b = sys.allocate_block(PoolId(0)).unwrap();
        let (wslice, _) = desc_slot(MessageDescriptor::send_block_to(
            Filter::Any,
            4,
            b,
            0,
        ));
        send_async_block(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Some(SignalRef(2)),
        )
        .unwrap();
        assert_eq!(sys.queued(MB), (1, 0));

        cancel_async(&mut tasks, &mut sys, 0, MB, b).unwrap();
        assert_eq!(sys.queued(MB), (0, 0));
        assert!(!sys.block_is_live(b));
        assert_eq!(sys.signal_count(SignalRef(2)), Some(0));
        assert_eq!(tasks[0].take_result(), Some(Ok(0)));

        // Cancelling again finds nothing.
        let r = cancel_async(&mut tasks, &mut sys, 0, MB, b);
        assert!(matches!(
            r,
            Err(UserError::Recoverable(IpcError::NoMessage, _))
        ));
    }

    #[test]
    fn stale_peer_generation_never_matches() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        let old_id = id(&tasks, 1);
        tasks[1].reinitialize();
        tasks[1].set_healthy_state(SchedState::Runnable);
        assert_ne!(old_id, id(&tasks, 1));

        // Sender addresses the dead incarnation...
        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Specific(old_id),
            4,
            UAddr(leak_buf(&[1; 4])),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        // ...so the reborn task's receive does not see it.
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            4,
            UAddr(leak_buf(&[0; 4])),
        ));
        let r = receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::None);
        let _ = apply_outcome(&mut tasks, 1, r);
        assert_eq!(tasks[1].take_result(), Some(Err(IpcError::NoMessage)));
        assert_eq!(sys.queued(MB), (1, 0));
    }

    #[test]
    fn deferred_mover_runs_at_the_more_important_priority() {
        let (mut tasks, mut sys) = world(&[2, 6]);
        let (wslice, _) = desc_slot(MessageDescriptor::send_to(
            Filter::Any,
            4,
            UAddr(leak_buf(&[1; 4])),
            0,
        ));
        send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(2),
            wslice,
            Timeout::Unlimited,
        )
        .unwrap();

        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            4,
            UAddr::NULL,
        ));
        receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::None).unwrap();

        let mh = sys.movers.handle_at(0).unwrap();
        let m = sys.movers.get(mh).unwrap();
        assert_eq!(m.priority, Priority(2));
    }

    #[test]
    fn pending_arena_exhaustion_is_reported() {
        let (mut tasks, mut sys) = world(&[4, 4]);
        for _ in 0..PENDING_REQUESTS {
            sys.pending
                .insert(PendingRequest {
                    owner: TaskId(0),
                    owner_index: 0,
                    desc: MessageDescriptor::default(),
                    reply_to: None,
                    waker: Waker::Signal,
                    priority: Priority(0),
                    mbox: MB,
                    dir: Direction::Send,
                    deadline: None,
                    next: None,
                    phase: Phase::AwaitingData,
                })
                .unwrap();
        }

        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(leak_buf(&[0; 8])),
        ));
        let r =
            receive(&mut tasks, &mut sys, 1, MB, rslice, Timeout::Unlimited);
        assert!(matches!(
            r,
            Err(UserError::Recoverable(IpcError::NoMemory, _))
        ));
        // Refused before blocking: the caller is still runnable.
        assert!(tasks[1].is_runnable());
    }

    #[test]
    fn bad_mailbox_is_a_usage_fault() {
        let (mut tasks, mut sys) = world(&[4]);
        let (rslice, _) = desc_slot(MessageDescriptor::receive_from(
            Filter::Any,
            8,
            UAddr(leak_buf(&[0; 8])),
        ));
        let r = receive(
            &mut tasks,
            &mut sys,
            0,
            MboxId(99),
            rslice,
            Timeout::None,
        );
        let _ = apply_outcome(&mut tasks, 0, r);
        assert!(!tasks[0].is_healthy());
    }

    #[test]
    fn send_to_unreadable_descriptor_faults() {
        let (mut tasks, mut sys) = world(&[4]);
        // A descriptor slice outside the task's regions.
        let slice = USlice::<MessageDescriptor>::from_raw(0x40, 1).unwrap();
        let r = send(
            &mut tasks,
            &mut sys,
            0,
            MB,
            Priority(4),
            slice,
            Timeout::None,
        );
        let _ = apply_outcome(&mut tasks, 0, r);
        assert!(!tasks[0].is_healthy());
    }

    mod matcher_props {
        use super::*;
        use proptest::prelude::*;

        fn tid(i: usize) -> TaskId {
            TaskId::for_index_and_gen(i, Generation::ZERO)
        }

        proptest! {
            #[test]
            fn negotiation_takes_the_min(
                rs in 0usize..4096,
                ws in 0usize..4096,
            ) {
                let mut r = MessageDescriptor::receive_from(
                    Filter::Any, rs, UAddr::NULL,
                );
                let mut w = MessageDescriptor::send_to(
                    Filter::Any, ws, UAddr::NULL, 0,
                );
                let n = match_pair(&mut r, tid(1), &mut w, tid(2)).unwrap();
                prop_assert_eq!(n, rs.min(ws));
                prop_assert_eq!(r.size, n);
                prop_assert_eq!(w.size, n);
            }

            #[test]
            fn compatibility_truth_table(
                ri in 0usize..8,
                wi in 0usize..8,
                r_any in proptest::bool::ANY,
                w_any in proptest::bool::ANY,
                rt in 0usize..8,
                wt in 0usize..8,
            ) {
                let rf = if r_any {
                    Filter::Any
                } else {
                    Filter::Specific(tid(rt))
                };
                let wf = if w_any {
                    Filter::Any
                } else {
                    Filter::Specific(tid(wt))
                };
                let r = MessageDescriptor::receive_from(rf, 8, UAddr::NULL);
                let w = MessageDescriptor::send_to(wf, 8, UAddr::NULL, 0);
                let expected =
                    (r_any || rt == wi) && (w_any || wt == ri);
                prop_assert_eq!(
                    compatible(&r, tid(ri), &w, tid(wi)),
                    expected
                );
            }

            #[test]
            fn sync_match_introduces_the_peers(
                ri in 0usize..8,
                wi in 0usize..8,
            ) {
                let mut r = MessageDescriptor::receive_from(
                    Filter::Any, 8, UAddr::NULL,
                );
                let mut w = MessageDescriptor::send_to(
                    Filter::Any, 8, UAddr::NULL, 0xAB,
                );
                r.info = 0xCD;
                match_pair(&mut r, tid(ri), &mut w, tid(wi)).unwrap();
                prop_assert_eq!(
                    r.source_filter(),
                    Filter::Specific(tid(wi))
                );
                prop_assert_eq!(
                    w.target_filter(),
                    Filter::Specific(tid(ri))
                );
                prop_assert_eq!(r.info, 0xAB);
                prop_assert_eq!(w.info, 0xCD);
            }
        }
    }
}
