use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::mpsc::{channel, error::SendError, Receiver, Sender};

use crate::drivers::collections::driver::{ProcessorPropertyRequest, PropertyError};
use crate::drivers::collections::processor::LedElements;
use crate::hid::InputReport;
use crate::input::event::EventNode;
use crate::sync::{ReceiveTimeoutError, TimeoutReceiver};

use super::command::DeviceCommand;

/// Maximum duration to wait for a response from a command. If this timeout
/// is reached, that typically indicates a deadlock somewhere in the code.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Possible errors for a device client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to send command to device: {0}")]
    SendError(SendError<DeviceCommand>),
    #[error("service encountered an error processing the request: {0}")]
    ServiceError(Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid property request: {0}")]
    BadRequest(PropertyError),
    #[error("device no longer exists")]
    ChannelClosed,
}

impl From<SendError<DeviceCommand>> for ClientError {
    fn from(err: SendError<DeviceCommand>) -> Self {
        Self::SendError(err)
    }
}

/// A client for a running [Device] task
#[derive(Debug, Clone)]
pub struct DeviceClient {
    tx: Sender<DeviceCommand>,
}

impl From<Sender<DeviceCommand>> for DeviceClient {
    fn from(tx: Sender<DeviceCommand>) -> Self {
        DeviceClient::new(tx)
    }
}

impl DeviceClient {
    pub fn new(tx: Sender<DeviceCommand>) -> Self {
        Self { tx }
    }

    /// Send the given command to the device. This method uses a timeout to
    /// detect potential deadlocks.
    async fn send(&self, cmd: DeviceCommand) -> Result<(), ClientError> {
        let result = self.tx.send_timeout(cmd, DEFAULT_TIMEOUT).await;
        let Err(err) = result else {
            return Ok(());
        };
        match err {
            SendTimeoutError::Timeout(ref cmd) => {
                log::error!("POSSIBLE DEADLOCK: timed out after {DEFAULT_TIMEOUT:?} sending command to device: {cmd:?}");
                Err(ClientError::ServiceError(err.to_string().into()))
            }
            SendTimeoutError::Closed(_) => Err(ClientError::ChannelClosed),
        }
    }

    /// Use the given receiver to wait for a response from the device. This
    /// method uses a timeout to detect potential deadlocks.
    async fn recv<T>(mut rx: Receiver<T>) -> Option<T>
    where
        T: Send + Sync,
    {
        let result = rx.recv_timeout(DEFAULT_TIMEOUT).await;
        let Err(err) = result else {
            return result.ok();
        };
        match err {
            ReceiveTimeoutError::Timeout => {
                log::error!("POSSIBLE DEADLOCK: timed out after {DEFAULT_TIMEOUT:?} waiting for response from device");
                None
            }
            ReceiveTimeoutError::Closed => None,
        }
    }

    /// Process the given input report
    pub async fn process_report(&self, report: InputReport) -> Result<(), ClientError> {
        self.send(DeviceCommand::ProcessReport(report)).await?;
        Ok(())
    }

    /// Process the given input report (blocking)
    pub fn blocking_process_report(&self, report: InputReport) -> Result<(), ClientError> {
        self.tx
            .blocking_send(DeviceCommand::ProcessReport(report))?;
        Ok(())
    }

    /// Apply a batch of processor property requests. The batch is rejected
    /// as a whole if any entry is malformed.
    pub async fn set_processor_properties(
        &self,
        requests: Vec<ProcessorPropertyRequest>,
    ) -> Result<(), ClientError> {
        let (tx, rx) = channel(1);
        self.send(DeviceCommand::SetProcessorProperties(requests, tx))
            .await?;
        match Self::recv(rx).await {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => Err(ClientError::BadRequest(err)),
            None => Err(ClientError::ChannelClosed),
        }
    }

    /// Get the value of a device property
    pub async fn get_property(&self, key: &str) -> Result<Option<Value>, ClientError> {
        let (tx, rx) = channel(1);
        self.send(DeviceCommand::GetProperty(key.to_string(), tx))
            .await?;
        match Self::recv(rx).await {
            Some(value) => Ok(value),
            None => Err(ClientError::ChannelClosed),
        }
    }

    /// Set a device property
    pub async fn set_property(&self, key: &str, value: Value) -> Result<(), ClientError> {
        self.send(DeviceCommand::SetProperty(key.to_string(), value))
            .await?;
        Ok(())
    }

    /// Get the capability flags discovered from the device descriptor
    pub async fn get_capabilities(&self) -> Result<Vec<String>, ClientError> {
        let (tx, rx) = channel(1);
        self.send(DeviceCommand::GetCapabilities(tx)).await?;
        match Self::recv(rx).await {
            Some(capabilities) => Ok(capabilities),
            None => Err(ClientError::ChannelClosed),
        }
    }

    /// Get the LED constellation element set, if the device has one
    pub async fn get_led_elements(&self) -> Result<Option<LedElements>, ClientError> {
        let (tx, rx) = channel(1);
        self.send(DeviceCommand::GetLedElements(tx)).await?;
        match Self::recv(rx).await {
            Some(elements) => Ok(elements),
            None => Err(ClientError::ChannelClosed),
        }
    }

    /// Subscribe to the event trees this device produces
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<EventNode>, ClientError> {
        let (tx, rx) = channel(1);
        self.send(DeviceCommand::Subscribe(tx)).await?;
        match Self::recv(rx).await {
            Some(events) => Ok(events),
            None => Err(ClientError::ChannelClosed),
        }
    }

    /// Stop the device task
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.send(DeviceCommand::Stop).await?;
        Ok(())
    }
}
