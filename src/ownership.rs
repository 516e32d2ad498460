//! Queue ownership transfers between the graphics and compute contexts.
//!
//! A buffer last written on one context can only be consumed on the other after a
//! release recorded on the source context and an acquire recorded on the
//! destination. [`OwnershipTransfer::release`] hands back a [`PendingAcquire`],
//! and consuming that token is the only way to record the matching acquire.

use crate::device::{
    AccessFlags, BufferBarrier, BufferHandle, CommandList, ContextKind, Device, DeviceError,
    PipelineStage, SubmissionIndex,
};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::sync::Once;

static SHARED_FAMILY_NOTICE: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
}

impl QueueFamilies {
    pub fn query(device: &dyn Device) -> Self {
        QueueFamilies {
            graphics: device.queue_family(ContextKind::Graphics),
            compute: device.queue_family(ContextKind::Compute),
        }
    }

    pub fn family(&self, context: ContextKind) -> u32 {
        match context {
            ContextKind::Graphics => self.graphics,
            ContextKind::Compute => self.compute,
        }
    }

    pub fn shared(&self) -> bool {
        self.graphics == self.compute
    }
}

// How each context touches a particle buffer.
fn usage_on(context: ContextKind) -> (AccessFlags, PipelineStage) {
    match context {
        ContextKind::Compute => (
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            PipelineStage::ComputeShader,
        ),
        ContextKind::Graphics => (
            AccessFlags::VERTEX_ATTRIBUTE_READ | AccessFlags::TRANSFER_WRITE,
            PipelineStage::VertexInput,
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipTransfer {
    pub buffer: BufferHandle,
    pub from: ContextKind,
    pub to: ContextKind,
}

impl OwnershipTransfer {
    pub fn new(buffer: BufferHandle, from: ContextKind, to: ContextKind) -> Self {
        OwnershipTransfer { buffer, from, to }
    }

    pub fn to_graphics(buffer: BufferHandle) -> Self {
        OwnershipTransfer::new(buffer, ContextKind::Compute, ContextKind::Graphics)
    }

    pub fn to_compute(buffer: BufferHandle) -> Self {
        OwnershipTransfer::new(buffer, ContextKind::Graphics, ContextKind::Compute)
    }

    pub fn barrier(&self, families: QueueFamilies) -> BufferBarrier {
        let (src_access, src_stage) = usage_on(self.from);
        let (dst_access, dst_stage) = usage_on(self.to);
        BufferBarrier {
            buffer: self.buffer,
            src_access,
            dst_access,
            src_context: self.from,
            dst_context: self.to,
            src_queue_family: families.family(self.from),
            dst_queue_family: families.family(self.to),
            src_stage,
            dst_stage,
        }
    }

    /// Records the release half into `commands`, which must be submitted on
    /// `self.from`.
    pub fn release(self, commands: &mut CommandList, families: QueueFamilies) -> PendingAcquire {
        if families.shared() {
            SHARED_FAMILY_NOTICE.call_once(|| {
                info!(
                    "Graphics and compute share queue family {}, ownership transfers are no-ops",
                    families.graphics
                )
            });
            return PendingAcquire {
                transfer: self,
                barrier: None,
            };
        }
        let barrier = self.barrier(families);
        trace!("Release {:?} {} -> {}", self.buffer, self.from, self.to);
        commands.release(barrier);
        PendingAcquire {
            transfer: self,
            barrier: Some(barrier),
        }
    }
}

/// The outstanding half of a transfer. Dropping it leaves the buffer stranded
/// between contexts.
#[must_use = "a released buffer must be acquired on its destination context"]
#[derive(Debug, PartialEq, Eq)]
pub struct PendingAcquire {
    transfer: OwnershipTransfer,
    barrier: Option<BufferBarrier>,
}

impl PendingAcquire {
    pub fn destination(&self) -> ContextKind {
        self.transfer.to
    }

    /// Records the acquire half into `commands`, which must be submitted on
    /// [`destination`](Self::destination).
    // Second token for the same release. Only for restoring state after a
    // submission that never reached the device.
    fn reissue(&self) -> PendingAcquire {
        PendingAcquire {
            transfer: self.transfer,
            barrier: self.barrier,
        }
    }

    pub fn acquire(self, commands: &mut CommandList) {
        if let Some(barrier) = self.barrier {
            trace!(
                "Acquire {:?} {} -> {}",
                barrier.buffer,
                barrier.src_context,
                barrier.dst_context
            );
            commands.acquire(barrier);
        }
    }
}

/// Where a shared buffer currently lives.
#[derive(Debug, PartialEq, Eq)]
pub enum BufferOwnership {
    Owned(ContextKind),
    InTransit(PendingAcquire),
}

impl BufferOwnership {
    /// The context that may use the buffer right now, if any.
    pub fn holder(&self) -> Option<ContextKind> {
        match self {
            BufferOwnership::Owned(context) => Some(*context),
            BufferOwnership::InTransit(_) => None,
        }
    }

    /// Copy of this state, to put back if the submission recording a change to
    /// it fails.
    pub(crate) fn snapshot(&self) -> BufferOwnership {
        match self {
            BufferOwnership::Owned(context) => BufferOwnership::Owned(*context),
            BufferOwnership::InTransit(pending) => BufferOwnership::InTransit(pending.reissue()),
        }
    }

    /// Brings the buffer to `to`, recording whatever is still missing: the
    /// acquire of an interrupted transfer and/or a fresh release/acquire pair.
    pub fn move_to(
        self,
        buffer: BufferHandle,
        to: ContextKind,
        batch: &mut SyncBatch,
    ) -> Result<BufferOwnership, DeviceError> {
        match self {
            BufferOwnership::Owned(from) if from == to => {}
            BufferOwnership::Owned(from) => {
                batch.transfer(OwnershipTransfer::new(buffer, from, to))?;
            }
            BufferOwnership::InTransit(pending) if pending.destination() == to => {
                pending.acquire(batch.commands(to));
            }
            BufferOwnership::InTransit(pending) => {
                let from = pending.destination();
                pending.acquire(batch.commands(from));
                batch.transfer(OwnershipTransfer::new(buffer, from, to))?;
            }
        }
        Ok(BufferOwnership::Owned(to))
    }

    /// [`move_to`](Self::move_to) on a batch of its own, submitted and awaited.
    /// On failure the returned state is whatever the device actually executed.
    pub fn move_and_wait(
        self,
        device: &dyn Device,
        buffer: BufferHandle,
        to: ContextKind,
    ) -> Result<BufferOwnership, (BufferOwnership, DeviceError)> {
        let source = match &self {
            BufferOwnership::Owned(from) if *from == to => return Ok(self),
            BufferOwnership::Owned(from) => *from,
            BufferOwnership::InTransit(pending) => pending.destination(),
        };
        let families = QueueFamilies::query(device);
        let before = self.snapshot();
        let mut batch = SyncBatch::new(families, source);
        let moved = match self.move_to(buffer, to, &mut batch) {
            Ok(moved) => moved,
            Err(e) => return Err((before, e)),
        };
        match batch.submit_staged(device) {
            Ok(()) => Ok(moved),
            Err((Stage::Source, e)) => Err((before, e)),
            Err((Stage::Destination, e)) => {
                // The release ran, only the acquire on `to` is missing.
                let transfer = OwnershipTransfer::new(buffer, source, to);
                let barrier = (!families.shared()).then(|| transfer.barrier(families));
                Err((BufferOwnership::InTransit(PendingAcquire { transfer, barrier }), e))
            }
            Err((Stage::Wait, e)) => Err((moved, e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Source,
    Destination,
    Wait,
}

/// One command list per context, submitted source first and then awaited on
/// both. Used on the blocking paths: first-time init, mode toggles, reclaims.
pub struct SyncBatch {
    families: QueueFamilies,
    source: ContextKind,
    lists: [CommandList; 2],
}

impl SyncBatch {
    pub fn new(families: QueueFamilies, source: ContextKind) -> Self {
        SyncBatch {
            families,
            source,
            lists: [
                CommandList::new("sync graphics"),
                CommandList::new("sync compute"),
            ],
        }
    }

    pub fn commands(&mut self, context: ContextKind) -> &mut CommandList {
        &mut self.lists[context.index()]
    }

    pub fn transfer(&mut self, transfer: OwnershipTransfer) -> Result<(), DeviceError> {
        if transfer.from != self.source {
            return Err(DeviceError::OwnershipViolation(format!(
                "{:?} released on {} in a batch submitted {} first",
                transfer.buffer, transfer.from, self.source
            )));
        }
        let families = self.families;
        let pending = transfer.release(self.commands(transfer.from), families);
        pending.acquire(self.commands(transfer.to));
        Ok(())
    }

    pub fn submit_and_wait(self, device: &dyn Device) -> Result<(), DeviceError> {
        self.submit_staged(device).map_err(|(_, e)| e)
    }

    fn submit_staged(self, device: &dyn Device) -> Result<(), (Stage, DeviceError)> {
        let mut submitted: Vec<(ContextKind, SubmissionIndex)> = Vec::with_capacity(2);
        for (context, stage) in [
            (self.source, Stage::Source),
            (self.source.other(), Stage::Destination),
        ] {
            let commands = &self.lists[context.index()];
            if commands.is_empty() {
                continue;
            }
            let submission = device.submit(context, commands).map_err(|e| (stage, e))?;
            submitted.push((context, submission));
        }
        for (context, submission) in submitted {
            device.wait(context, submission).map_err(|e| (Stage::Wait, e))?;
        }
        debug!("Sync batch complete");
        Ok(())
    }
}

/// Moves every buffer in `transfers` from its source to its destination context
/// and blocks until both sides have executed.
pub fn transfer_and_wait(
    device: &dyn Device,
    source: ContextKind,
    transfers: &[OwnershipTransfer],
) -> Result<(), DeviceError> {
    let mut batch = SyncBatch::new(QueueFamilies::query(device), source);
    for transfer in transfers {
        batch.transfer(*transfer)?;
    }
    batch.submit_and_wait(device)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEventKind {
    Release,
    Acquire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub buffer: BufferHandle,
    pub from: ContextKind,
    pub to: ContextKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Context(ContextKind),
    InTransit(ContextKind, ContextKind),
}

/// Ledger state to return to when a submission is abandoned halfway.
#[derive(Debug, Clone)]
pub struct LedgerCheckpoint {
    holders: HashMap<BufferHandle, Holder>,
    events: usize,
}

/// Submission-time bookkeeping of which context holds each buffer.
#[derive(Debug, Default)]
pub struct TransferLedger {
    holders: HashMap<BufferHandle, Holder>,
    events: Vec<TransferEvent>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, buffer: BufferHandle) -> Option<ContextKind> {
        match self.holders.get(&buffer) {
            Some(Holder::Context(context)) => Some(*context),
            _ => None,
        }
    }

    /// Checks that `context` may touch `buffer`. First use claims it.
    pub fn claim(&mut self, buffer: BufferHandle, context: ContextKind) -> Result<(), DeviceError> {
        match self.holders.get(&buffer) {
            None => {
                self.holders.insert(buffer, Holder::Context(context));
                Ok(())
            }
            Some(Holder::Context(owner)) if *owner == context => Ok(()),
            Some(Holder::Context(owner)) => Err(DeviceError::OwnershipViolation(format!(
                "{:?} used on {} while owned by {}",
                buffer, context, owner
            ))),
            Some(Holder::InTransit(from, to)) => Err(DeviceError::OwnershipViolation(format!(
                "{:?} used on {} while in transit {} -> {}",
                buffer, context, from, to
            ))),
        }
    }

    pub fn release(&mut self, barrier: &BufferBarrier, on: ContextKind) -> Result<(), DeviceError> {
        if barrier.src_context != on || barrier.dst_context == on {
            return Err(DeviceError::OwnershipViolation(format!(
                "release of {:?} {} -> {} recorded on {}",
                barrier.buffer, barrier.src_context, barrier.dst_context, on
            )));
        }
        self.claim(barrier.buffer, on)?;
        self.holders.insert(
            barrier.buffer,
            Holder::InTransit(barrier.src_context, barrier.dst_context),
        );
        self.events.push(TransferEvent {
            kind: TransferEventKind::Release,
            buffer: barrier.buffer,
            from: barrier.src_context,
            to: barrier.dst_context,
        });
        Ok(())
    }

    pub fn acquire(&mut self, barrier: &BufferBarrier, on: ContextKind) -> Result<(), DeviceError> {
        let expected = Holder::InTransit(barrier.src_context, barrier.dst_context);
        if barrier.dst_context != on || self.holders.get(&barrier.buffer) != Some(&expected) {
            return Err(DeviceError::OwnershipViolation(format!(
                "acquire of {:?} {} -> {} on {} has no matching release",
                barrier.buffer, barrier.src_context, barrier.dst_context, on
            )));
        }
        self.holders.insert(barrier.buffer, Holder::Context(on));
        self.events.push(TransferEvent {
            kind: TransferEventKind::Acquire,
            buffer: barrier.buffer,
            from: barrier.src_context,
            to: barrier.dst_context,
        });
        Ok(())
    }

    pub fn checkpoint(&self) -> LedgerCheckpoint {
        LedgerCheckpoint {
            holders: self.holders.clone(),
            events: self.events.len(),
        }
    }

    pub fn roll_back(&mut self, checkpoint: LedgerCheckpoint) {
        self.holders = checkpoint.holders;
        self.events.truncate(checkpoint.events);
    }

    pub fn forget(&mut self, buffer: BufferHandle) {
        self.holders.remove(&buffer);
    }

    pub fn events(&self) -> &[TransferEvent] {
        &self.events
    }

    /// Buffers released but not yet acquired.
    pub fn unmatched(&self) -> Vec<BufferHandle> {
        let mut stranded: Vec<BufferHandle> = self
            .holders
            .iter()
            .filter(|(_, holder)| matches!(holder, Holder::InTransit(..)))
            .map(|(buffer, _)| *buffer)
            .collect();
        stranded.sort();
        stranded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::tests::FlakyDevice;
    use crate::device::{BufferDescriptor, BufferUsage, Command, HostDevice, HostDeviceOptions};

    fn written_on(device: &dyn Device, context: ContextKind) -> BufferHandle {
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: "moved",
                size: 16,
                usage: BufferUsage::STORAGE,
            })
            .unwrap();
        let mut commands = CommandList::new("seed");
        commands.write_buffer(buffer, 0, &[1u32, 2, 3, 4]);
        device.submit(context, &commands).unwrap();
        buffer
    }

    fn split() -> QueueFamilies {
        QueueFamilies {
            graphics: 0,
            compute: 1,
        }
    }

    #[test]
    fn release_then_acquire_carry_the_same_barrier() {
        let buffer = BufferHandle(7);
        let mut compute = CommandList::new("compute");
        let mut graphics = CommandList::new("graphics");
        let pending = OwnershipTransfer::to_graphics(buffer).release(&mut compute, split());
        assert_eq!(pending.destination(), ContextKind::Graphics);
        pending.acquire(&mut graphics);

        let released = match &compute.commands()[0] {
            Command::Release(barrier) => *barrier,
            other => panic!("unexpected {:?}", other),
        };
        let acquired = match &graphics.commands()[0] {
            Command::Acquire(barrier) => *barrier,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(released, acquired);
        assert_eq!(released.src_queue_family, 1);
        assert_eq!(released.dst_queue_family, 0);
        assert_eq!(released.dst_stage, PipelineStage::VertexInput);
    }

    #[test]
    fn shared_family_records_nothing() {
        let families = QueueFamilies {
            graphics: 0,
            compute: 0,
        };
        let mut compute = CommandList::new("compute");
        let mut graphics = CommandList::new("graphics");
        OwnershipTransfer::to_graphics(BufferHandle(1))
            .release(&mut compute, families)
            .acquire(&mut graphics);
        assert!(compute.is_empty());
        assert!(graphics.is_empty());
    }

    #[test]
    fn ledger_pairs_release_and_acquire() {
        let mut ledger = TransferLedger::new();
        let buffer = BufferHandle(3);
        let barrier = OwnershipTransfer::to_graphics(buffer).barrier(split());
        ledger.claim(buffer, ContextKind::Compute).unwrap();
        ledger.release(&barrier, ContextKind::Compute).unwrap();
        assert_eq!(ledger.unmatched(), vec![buffer]);
        assert!(ledger.claim(buffer, ContextKind::Graphics).is_err());
        assert!(ledger.claim(buffer, ContextKind::Compute).is_err());
        ledger.acquire(&barrier, ContextKind::Graphics).unwrap();
        assert!(ledger.unmatched().is_empty());
        assert_eq!(ledger.owner(buffer), Some(ContextKind::Graphics));
        assert_eq!(ledger.events().len(), 2);
    }

    #[test]
    fn ledger_rejects_unpaired_acquire() {
        let mut ledger = TransferLedger::new();
        let buffer = BufferHandle(3);
        let barrier = OwnershipTransfer::to_compute(buffer).barrier(split());
        assert!(ledger.acquire(&barrier, ContextKind::Compute).is_err());

        ledger.claim(buffer, ContextKind::Graphics).unwrap();
        ledger.release(&barrier, ContextKind::Graphics).unwrap();
        // Acquiring on the releasing side is not a match.
        assert!(ledger.acquire(&barrier, ContextKind::Graphics).is_err());
        ledger.acquire(&barrier, ContextKind::Compute).unwrap();
        assert!(ledger.acquire(&barrier, ContextKind::Compute).is_err());
    }

    #[test]
    fn release_requires_ownership() {
        let mut ledger = TransferLedger::new();
        let buffer = BufferHandle(4);
        ledger.claim(buffer, ContextKind::Graphics).unwrap();
        let barrier = OwnershipTransfer::to_graphics(buffer).barrier(split());
        assert!(ledger.release(&barrier, ContextKind::Compute).is_err());
    }

    #[test]
    fn interrupted_transfer_is_completed_before_moving_on() {
        let buffer = BufferHandle(9);
        let mut frame = CommandList::new("frame");
        let pending = OwnershipTransfer::to_graphics(buffer).release(&mut frame, split());

        let mut batch = SyncBatch::new(split(), ContextKind::Graphics);
        let ownership = BufferOwnership::InTransit(pending)
            .move_to(buffer, ContextKind::Compute, &mut batch)
            .unwrap();
        assert_eq!(ownership, BufferOwnership::Owned(ContextKind::Compute));

        let graphics = batch.commands(ContextKind::Graphics).commands().to_vec();
        assert!(matches!(graphics[0], Command::Acquire(b) if b.dst_context == ContextKind::Graphics));
        assert!(matches!(graphics[1], Command::Release(b) if b.dst_context == ContextKind::Compute));
        let compute = batch.commands(ContextKind::Compute).commands().to_vec();
        assert!(matches!(compute[0], Command::Acquire(b) if b.dst_context == ContextKind::Compute));
    }

    #[test]
    fn batch_rejects_transfers_against_submission_order() {
        let mut batch = SyncBatch::new(split(), ContextKind::Compute);
        assert!(batch
            .transfer(OwnershipTransfer::to_compute(BufferHandle(1)))
            .is_err());
        assert!(batch
            .transfer(OwnershipTransfer::to_graphics(BufferHandle(1)))
            .is_ok());
    }

    #[test]
    fn transfer_and_wait_moves_whole_batches() {
        let device = HostDevice::new(HostDeviceOptions::default());
        let a = written_on(&device, ContextKind::Compute);
        let b = written_on(&device, ContextKind::Compute);

        transfer_and_wait(
            &device,
            ContextKind::Compute,
            &[OwnershipTransfer::to_graphics(a), OwnershipTransfer::to_graphics(b)],
        )
        .unwrap();
        assert_eq!(device.owner(a), Some(ContextKind::Graphics));
        assert_eq!(device.owner(b), Some(ContextKind::Graphics));
        assert_eq!(device.transfer_events().len(), 4);
        assert!(device.unmatched_releases().is_empty());

        transfer_and_wait(&device, ContextKind::Graphics, &[OwnershipTransfer::to_compute(a)]).unwrap();
        assert_eq!(device.owner(a), Some(ContextKind::Compute));
        assert_eq!(device.transfer_events().len(), 6);

        // b is on graphics, a compute-first batch cannot release it.
        assert!(transfer_and_wait(&device, ContextKind::Compute, &[OwnershipTransfer::to_compute(b)]).is_err());
        assert_eq!(device.owner(b), Some(ContextKind::Graphics));
        assert_eq!(device.transfer_events().len(), 6);
    }

    #[test]
    fn failed_release_keeps_the_source_owner() {
        let device = FlakyDevice::new(HostDeviceOptions::default(), "sync graphics", &[0]);
        let buffer = written_on(&device, ContextKind::Graphics);

        let (state, _) = BufferOwnership::Owned(ContextKind::Graphics)
            .move_and_wait(&device, buffer, ContextKind::Compute)
            .unwrap_err();
        assert_eq!(state, BufferOwnership::Owned(ContextKind::Graphics));
        assert_eq!(device.inner.owner(buffer), Some(ContextKind::Graphics));
        assert!(device.inner.unmatched_releases().is_empty());
    }

    #[test]
    fn failed_acquire_leaves_the_buffer_in_transit() {
        let device = FlakyDevice::new(HostDeviceOptions::default(), "sync compute", &[0]);
        let buffer = written_on(&device, ContextKind::Graphics);

        let (state, _) = BufferOwnership::Owned(ContextKind::Graphics)
            .move_and_wait(&device, buffer, ContextKind::Compute)
            .unwrap_err();
        match &state {
            BufferOwnership::InTransit(pending) => assert_eq!(pending.destination(), ContextKind::Compute),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(device.inner.unmatched_releases(), vec![buffer]);

        // Retrying only records the missing acquire.
        let state = state.move_and_wait(&device, buffer, ContextKind::Compute).unwrap();
        assert_eq!(state, BufferOwnership::Owned(ContextKind::Compute));
        assert_eq!(device.inner.owner(buffer), Some(ContextKind::Compute));
        assert!(device.inner.unmatched_releases().is_empty());
    }
}
