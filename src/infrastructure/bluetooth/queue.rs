//! GATT write serialization
//!
//! The adapter accepts one GATT operation at a time and drops or corrupts
//! overlapping writes, so every characteristic and descriptor write goes
//! through [`OperationQueue`]. Only the head of the queue is ever submitted.

use crate::error::DroError;
use crate::infrastructure::bluetooth::transport::{
    AttributeHandle, GattStatus, TransportError, WriteTarget,
};
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// A queued GATT write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    CharacteristicWrite {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    DescriptorWrite {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
}

impl PendingOperation {
    pub fn target(&self) -> WriteTarget {
        match self {
            PendingOperation::CharacteristicWrite { handle, .. } => {
                WriteTarget::Characteristic(*handle)
            }
            PendingOperation::DescriptorWrite { handle, .. } => WriteTarget::Descriptor(*handle),
        }
    }

    pub fn value(&self) -> &[u8] {
        match self {
            PendingOperation::CharacteristicWrite { value, .. }
            | PendingOperation::DescriptorWrite { value, .. } => value,
        }
    }
}

/// Where the queue hands its head operation.
pub trait OperationSink {
    fn submit(&self, op: &PendingOperation) -> Result<(), TransportError>;
}

/// Result of one write leaving the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub operation: PendingOperation,
    pub result: Result<(), DroError>,
}

/// FIFO of pending writes with at most one in flight.
#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<PendingOperation>,
    in_flight: bool,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The operation currently submitted to the transport.
    pub fn in_flight(&self) -> Option<&PendingOperation> {
        if self.in_flight {
            self.pending.front()
        } else {
            None
        }
    }

    /// Append `op`. If nothing is in flight the head is submitted right away.
    ///
    /// Returns the writes the transport refused synchronously; those count
    /// as failed completions and the queue moves past them.
    pub fn enqueue(&mut self, op: PendingOperation, sink: &dyn OperationSink) -> Vec<WriteOutcome> {
        debug!("Queueing write to {} ({} pending)", op.target(), self.pending.len());
        self.pending.push_back(op);
        if self.in_flight {
            return Vec::new();
        }
        self.dispatch(sink)
    }

    /// Handle the transport's completion for the in-flight write.
    ///
    /// The head is popped whatever the status; failed writes are not
    /// retried. A completion that does not match the head is a
    /// [`DroError::ProtocolViolation`] and leaves the queue untouched.
    pub fn on_completion(
        &mut self,
        target: WriteTarget,
        status: GattStatus,
        sink: &dyn OperationSink,
    ) -> Result<Vec<WriteOutcome>, DroError> {
        let expected = self.in_flight().map(PendingOperation::target);
        if expected != Some(target) {
            error!(
                "Write completion for {} does not match in-flight {:?}",
                target, expected
            );
            return Err(DroError::ProtocolViolation {
                expected,
                received: target,
            });
        }

        self.in_flight = false;
        let mut outcomes = Vec::with_capacity(1);
        if let Some(operation) = self.pending.pop_front() {
            let result = if status.is_success() {
                Ok(())
            } else {
                warn!("Write to {} failed: {}", target, status);
                Err(DroError::WriteFailed { target, status })
            };
            outcomes.push(WriteOutcome { operation, result });
        }

        outcomes.extend(self.dispatch(sink));
        Ok(outcomes)
    }

    /// Drop everything, including the in-flight write. Used when the link goes away.
    pub fn clear(&mut self) -> Vec<PendingOperation> {
        self.in_flight = false;
        self.pending.drain(..).collect()
    }

    fn dispatch(&mut self, sink: &dyn OperationSink) -> Vec<WriteOutcome> {
        let mut refused = Vec::new();
        while let Some(head) = self.pending.front() {
            match sink.submit(head) {
                Ok(()) => {
                    self.in_flight = true;
                    break;
                }
                Err(e) => {
                    warn!("Transport refused write to {}: {}", head.target(), e);
                    if let Some(operation) = self.pending.pop_front() {
                        refused.push(WriteOutcome {
                            operation,
                            result: Err(e.into()),
                        });
                    }
                }
            }
        }
        refused
    }
}
