use std::collections::HashSet;
use std::sync::Mutex;

use log::warn;
use tokio::sync::oneshot;

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::{ExecutorId, PartitionId};
use crate::state::{PartitionState, StateMachine};

/// The metadata of one sub-block of an incrementally written partition.
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    /// The hash value of the elements in the block, for hashed outputs.
    pub hash_value: Option<usize>,
    pub size: u64,
    pub element_count: u64,
}

/// A committed sub-block together with its position within the partition.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    pub index: usize,
    pub offset: u64,
    pub metadata: BlockMetadata,
}

/// Resolves to the owning executor once the partition is committed.
pub struct PartitionLocationFuture {
    partition_id: PartitionId,
    receiver: oneshot::Receiver<RuntimeResult<ExecutorId>>,
}

impl PartitionLocationFuture {
    pub async fn resolve(self) -> RuntimeResult<ExecutorId> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::InternalError(format!(
                "the location subscription for partition {} was dropped",
                self.partition_id
            ))),
        }
    }
}

/// The single source of truth for one partition's lifecycle: its state
/// machine, resolved location, outstanding producers, committed sub-blocks,
/// and pending location subscribers.
///
/// The metadata is individually thread-safe so that a burst of unrelated
/// commit reports does not serialize behind the registry-wide lock.
pub struct PartitionMetadata {
    partition_id: PartitionId,
    inner: Mutex<MetadataFields>,
}

struct MetadataFields {
    state: StateMachine<PartitionState>,
    location: Option<ExecutorId>,
    producer_indices: HashSet<usize>,
    remaining_producers: HashSet<usize>,
    blocks: Vec<BlockRecord>,
    next_offset: u64,
    subscribers: Vec<oneshot::Sender<RuntimeResult<ExecutorId>>>,
}

struct BlockRecord {
    offset: u64,
    metadata: BlockMetadata,
    committed: bool,
}

impl PartitionMetadata {
    pub fn new(partition_id: PartitionId, producer_indices: HashSet<usize>) -> Self {
        Self {
            partition_id,
            inner: Mutex::new(MetadataFields {
                state: StateMachine::new(PartitionState::Created),
                location: None,
                remaining_producers: producer_indices.clone(),
                producer_indices,
                blocks: Vec::new(),
                next_offset: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn state(&self) -> RuntimeResult<PartitionState> {
        let inner = self.inner.lock()?;
        Ok(inner.state.current_state())
    }

    pub fn location(&self) -> RuntimeResult<Option<ExecutorId>> {
        let inner = self.inner.lock()?;
        Ok(inner.location.clone())
    }

    pub fn producer_indices(&self) -> RuntimeResult<HashSet<usize>> {
        let inner = self.inner.lock()?;
        Ok(inner.producer_indices.clone())
    }

    /// Applies a state report from an executor.
    ///
    /// A `Committed` report carries the owning executor and the producer
    /// index it covers; the state machine only transitions once every
    /// declared producer has reported. A transition into an absent state
    /// fails all pending location subscribers.
    pub fn on_state_changed(
        &self,
        new_state: PartitionState,
        location: Option<ExecutorId>,
        producer_index: Option<usize>,
    ) -> RuntimeResult<()> {
        let mut inner = self.inner.lock()?;
        match new_state {
            PartitionState::Committed => {
                let state = inner.state.current_state();
                if state != PartitionState::Scheduled {
                    return Err(RuntimeError::IllegalStateTransition {
                        entity: "partition",
                        from: state.to_string(),
                        to: PartitionState::Committed.to_string(),
                    });
                }
                let location = location.ok_or_else(|| {
                    RuntimeError::InvalidArgument(format!(
                        "a commit report for partition {} carries no location",
                        self.partition_id
                    ))
                })?;
                let index = match producer_index {
                    Some(index) => index,
                    None if inner.producer_indices.len() == 1 => {
                        *inner.producer_indices.iter().next().unwrap()
                    }
                    None => {
                        return Err(RuntimeError::InvalidArgument(format!(
                            "a commit report for multi-producer partition {} carries no producer index",
                            self.partition_id
                        )));
                    }
                };
                if !inner.remaining_producers.remove(&index) {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "producer {index} has already committed partition {}",
                        self.partition_id
                    )));
                }
                inner.location = Some(location.clone());
                if inner.remaining_producers.is_empty() {
                    inner.state.set_state(PartitionState::Committed)?;
                    for subscriber in inner.subscribers.drain(..) {
                        let _ = subscriber.send(Ok(location.clone()));
                    }
                }
                Ok(())
            }
            PartitionState::Scheduled => {
                inner.state.set_state(PartitionState::Scheduled)?;
                // A new attempt starts from a clean commit ledger.
                inner.remaining_producers = inner.producer_indices.clone();
                inner.location = None;
                inner.blocks.clear();
                inner.next_offset = 0;
                Ok(())
            }
            PartitionState::LostBeforeCommit | PartitionState::Lost | PartitionState::Removed => {
                inner.state.set_state(new_state)?;
                inner.location = None;
                let partition_id = self.partition_id;
                for subscriber in inner.subscribers.drain(..) {
                    let _ = subscriber.send(Err(RuntimeError::AbsentPartition {
                        id: partition_id,
                        state: new_state,
                    }));
                }
                Ok(())
            }
            PartitionState::Created => Err(RuntimeError::InvalidArgument(format!(
                "partition {} cannot be reported as CREATED",
                self.partition_id
            ))),
        }
    }

    /// A future for the owning executor id: already resolved for a committed
    /// partition, pending for a scheduled one, and an immediate
    /// absent-partition error otherwise.
    pub fn location_future(&self) -> RuntimeResult<PartitionLocationFuture> {
        let mut inner = self.inner.lock()?;
        let state = inner.state.current_state();
        let (tx, rx) = oneshot::channel();
        match state {
            PartitionState::Committed => {
                let location = inner.location.clone().ok_or_else(|| {
                    RuntimeError::InternalError(format!(
                        "committed partition {} has no location",
                        self.partition_id
                    ))
                })?;
                let _ = tx.send(Ok(location));
            }
            PartitionState::Scheduled => {
                inner.subscribers.push(tx);
            }
            _ => {
                return Err(RuntimeError::AbsentPartition {
                    id: self.partition_id,
                    state,
                });
            }
        }
        Ok(PartitionLocationFuture {
            partition_id: self.partition_id,
            receiver: rx,
        })
    }

    /// Reserves the region for one sub-block and returns its index and the
    /// position to write at.
    pub fn reserve_block(&self, metadata: BlockMetadata) -> RuntimeResult<(usize, u64)> {
        let mut inner = self.inner.lock()?;
        if inner.state.current_state() != PartitionState::Scheduled {
            return Err(RuntimeError::InvalidArgument(format!(
                "cannot reserve a block in partition {} ({})",
                self.partition_id,
                inner.state.current_state()
            )));
        }
        let index = inner.blocks.len();
        let offset = inner.next_offset;
        inner.next_offset += metadata.size;
        inner.blocks.push(BlockRecord {
            offset,
            metadata,
            committed: false,
        });
        Ok((index, offset))
    }

    pub fn commit_blocks(&self, block_indices: &[usize]) -> RuntimeResult<()> {
        let mut inner = self.inner.lock()?;
        for &index in block_indices {
            match inner.blocks.get_mut(index) {
                Some(block) => {
                    if block.committed {
                        warn!(
                            "block {index} of partition {} is already committed",
                            self.partition_id
                        );
                    }
                    block.committed = true;
                }
                None => {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "partition {} has no reserved block {index}",
                        self.partition_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// The committed sub-blocks in reservation order, for incremental readers.
    pub fn committed_blocks(&self) -> RuntimeResult<Vec<BlockDescriptor>> {
        let inner = self.inner.lock()?;
        Ok(inner
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.committed)
            .map(|(index, block)| BlockDescriptor {
                index,
                offset: block.offset,
                metadata: block.metadata.clone(),
            })
            .collect())
    }
}
