use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::drivers::collections::driver::{ProcessorPropertyRequest, PropertyError};
use crate::drivers::collections::processor::LedElements;
use crate::hid::InputReport;
use crate::input::event::EventNode;

/// Device commands define all the different ways to interact with [Device]
/// over a channel. These commands are processed in an asynchronous task and
/// dispatched as they come in.
#[derive(Debug)]
pub enum DeviceCommand {
    ProcessReport(InputReport),
    SetProcessorProperties(
        Vec<ProcessorPropertyRequest>,
        mpsc::Sender<Result<(), PropertyError>>,
    ),
    GetProperty(String, mpsc::Sender<Option<Value>>),
    SetProperty(String, Value),
    GetCapabilities(mpsc::Sender<Vec<String>>),
    GetLedElements(mpsc::Sender<Option<LedElements>>),
    Subscribe(mpsc::Sender<broadcast::Receiver<EventNode>>),
    Stop,
}
