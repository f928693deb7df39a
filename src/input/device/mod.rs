pub mod client;
pub mod command;

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::drivers::collections::driver::Driver;
use crate::drivers::collections::processor::BuildSettings;
use crate::hid::element::ElementRef;
use crate::hid::InputReport;
use crate::input::event::EventNode;

use command::DeviceCommand;

const BUFFER_SIZE: usize = 2048;

/// A [Device] wraps one element-processor [Driver] and serializes all report
/// processing and property access onto its own task, so no two processing
/// passes for the same device ever run concurrently.
pub struct Device {
    driver: Driver,
    rx: mpsc::Receiver<DeviceCommand>,
    tx: mpsc::Sender<DeviceCommand>,
    events: broadcast::Sender<EventNode>,
    properties: HashMap<String, Value>,
}

impl Device {
    pub fn new(
        device_id: String,
        root: &ElementRef,
        settings: &BuildSettings,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let driver = Driver::new(device_id, root, settings)?;
        let (tx, rx) = mpsc::channel(BUFFER_SIZE);
        let (events, _) = broadcast::channel(BUFFER_SIZE);

        let mut properties = HashMap::new();
        for capability in driver.capabilities() {
            properties.insert(capability.to_string(), Value::Bool(true));
        }

        Ok(Self {
            driver,
            rx,
            tx,
            events,
            properties,
        })
    }

    /// Returns a client handle for sending commands to this device
    pub fn client(&self) -> client::DeviceClient {
        client::DeviceClient::new(self.tx.clone())
    }

    /// Subscribe to the event trees this device produces
    pub fn subscribe(&self) -> broadcast::Receiver<EventNode> {
        self.events.subscribe()
    }

    /// Capability flags discovered from the device descriptor
    pub fn capabilities(&self) -> Vec<String> {
        self.driver
            .capabilities()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    /// The LED constellation element set, if the device has one
    pub fn led_elements(&self) -> Option<crate::drivers::collections::processor::LedElements> {
        self.driver.led_elements().cloned()
    }

    /// Process device commands until stopped
    pub async fn run(&mut self) {
        log::debug!("Device started: {}", self.driver.device_id());
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                DeviceCommand::ProcessReport(report) => self.handle_report(report),
                DeviceCommand::SetProcessorProperties(requests, tx) => {
                    let result = self.driver.set_processor_properties(&requests);
                    if let Err(err) = tx.send(result).await {
                        log::error!("failed to send property response: {err}");
                    }
                }
                DeviceCommand::GetProperty(key, tx) => {
                    let value = self.properties.get(&key).cloned();
                    if let Err(err) = tx.send(value).await {
                        log::error!("failed to send property value: {err}");
                    }
                }
                DeviceCommand::SetProperty(key, value) => {
                    self.properties.insert(key, value);
                }
                DeviceCommand::GetCapabilities(tx) => {
                    let capabilities = self
                        .driver
                        .capabilities()
                        .iter()
                        .map(|c| c.to_string())
                        .collect();
                    if let Err(err) = tx.send(capabilities).await {
                        log::error!("failed to send capabilities: {err}");
                    }
                }
                DeviceCommand::GetLedElements(tx) => {
                    let elements = self.driver.led_elements().cloned();
                    if let Err(err) = tx.send(elements).await {
                        log::error!("failed to send LED elements: {err}");
                    }
                }
                DeviceCommand::Subscribe(tx) => {
                    if let Err(err) = tx.send(self.events.subscribe()).await {
                        log::error!("failed to send event receiver: {err}");
                    }
                }
                DeviceCommand::Stop => break,
            }
        }
        log::debug!("Device stopped: {}", self.driver.device_id());
    }

    fn handle_report(&mut self, report: InputReport) {
        let Some(event) = self.driver.handle_report(&report) else {
            return;
        };
        // services may not have subscribed yet
        if self.events.receiver_count() == 0 {
            return;
        }
        if let Err(err) = self.events.send(event) {
            log::warn!("failed to dispatch event tree: {err}");
        }
    }
}
