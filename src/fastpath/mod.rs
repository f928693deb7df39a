//! Fast-path services stream fixed-layout binary samples between a
//! privileged producer and a consumer over shared-memory circular queues,
//! without per-sample syscalls. Each service publishes a [SampleDescriptor]
//! so consumers can decode samples without a shared header.

pub mod led;
pub mod queue;
pub mod sensor;

use std::os::fd::OwnedFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::{SendError, SendTimeoutError};
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::sync::{ReceiveTimeoutError, TimeoutReceiver};
use queue::QueueError;

/// Maximum duration to wait for a response from a service command
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one field of a fast-path sample across the privilege boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    EventTimestamp,
    SampleTimestamp,
    SampleId,
    AccelX,
    AccelY,
    AccelZ,
    GyroX,
    GyroY,
    GyroZ,
    LedMode,
    LedIntensity,
    LedBlinkDuration,
    LedBlinkPeriod,
}

/// Scalar type of a sample field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Double,
}

/// One (key, type, offset, size) tuple of a sample layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub key: FieldKey,
    pub kind: FieldType,
    pub offset: usize,
    pub size: usize,
}

impl Field {
    pub fn new(key: FieldKey, kind: FieldType, offset: usize, size: usize) -> Self {
        Self {
            key,
            kind,
            offset,
            size,
        }
    }
}

/// Describes the fixed binary layout of one queue sample. The descriptor is
/// the transport's only schema: consumers decode with these tuples rather
/// than a fixed struct, so the layout can evolve without a version number.
/// Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct SampleDescriptor {
    fields: Vec<Field>,
    sample_size: usize,
}

impl SampleDescriptor {
    pub fn new(fields: Vec<Field>) -> Self {
        let sample_size = fields.iter().map(|field| field.size).sum();
        Self {
            fields,
            sample_size,
        }
    }

    /// Total sample size in bytes, the sum of all field sizes
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

/// Commands shared by all fast-path services
#[derive(Debug)]
pub enum ServiceCommand {
    GetDescriptor(Sender<SampleDescriptor>),
    ShareQueue(Sender<Result<OwnedFd, QueueError>>),
    Stop,
}

/// Possible errors for a fast-path service client
#[derive(Error, Debug)]
pub enum ServiceClientError {
    #[error("failed to send command to service: {0}")]
    SendError(SendError<ServiceCommand>),
    #[error("service encountered an error processing the request: {0}")]
    ServiceError(Box<dyn std::error::Error + Send + Sync>),
    #[error("queue error: {0}")]
    Queue(QueueError),
    #[error("service no longer exists")]
    ChannelClosed,
}

impl From<SendError<ServiceCommand>> for ServiceClientError {
    fn from(err: SendError<ServiceCommand>) -> Self {
        Self::SendError(err)
    }
}

/// A client for a running fast-path service task
#[derive(Debug, Clone)]
pub struct ServiceClient {
    tx: Sender<ServiceCommand>,
}

impl ServiceClient {
    pub fn new(tx: Sender<ServiceCommand>) -> Self {
        Self { tx }
    }

    async fn send(&self, cmd: ServiceCommand) -> Result<(), ServiceClientError> {
        let result = self.tx.send_timeout(cmd, DEFAULT_TIMEOUT).await;
        let Err(err) = result else {
            return Ok(());
        };
        match err {
            SendTimeoutError::Timeout(ref cmd) => {
                log::error!("POSSIBLE DEADLOCK: timed out after {DEFAULT_TIMEOUT:?} sending command to service: {cmd:?}");
                Err(ServiceClientError::ServiceError(err.to_string().into()))
            }
            SendTimeoutError::Closed(_) => Err(ServiceClientError::ChannelClosed),
        }
    }

    async fn recv<T>(mut rx: Receiver<T>) -> Option<T>
    where
        T: Send + Sync,
    {
        match rx.recv_timeout(DEFAULT_TIMEOUT).await {
            Ok(value) => Some(value),
            Err(ReceiveTimeoutError::Timeout) => {
                log::error!("POSSIBLE DEADLOCK: timed out after {DEFAULT_TIMEOUT:?} waiting for response from service");
                None
            }
            Err(ReceiveTimeoutError::Closed) => None,
        }
    }

    /// Get the published sample layout descriptor
    pub async fn get_descriptor(&self) -> Result<SampleDescriptor, ServiceClientError> {
        let (tx, rx) = channel(1);
        self.send(ServiceCommand::GetDescriptor(tx)).await?;
        match Self::recv(rx).await {
            Some(descriptor) => Ok(descriptor),
            None => Err(ServiceClientError::ChannelClosed),
        }
    }

    /// Duplicate the service's queue fd so another endpoint can attach
    pub async fn share_queue(&self) -> Result<OwnedFd, ServiceClientError> {
        let (tx, rx) = channel(1);
        self.send(ServiceCommand::ShareQueue(tx)).await?;
        match Self::recv(rx).await {
            Some(Ok(fd)) => Ok(fd),
            Some(Err(err)) => Err(ServiceClientError::Queue(err)),
            None => Err(ServiceClientError::ChannelClosed),
        }
    }

    /// Stop the service task
    pub async fn stop(&self) -> Result<(), ServiceClientError> {
        self.send(ServiceCommand::Stop).await?;
        Ok(())
    }
}
