//! The manager composes devices and their fast-path services: it attaches
//! devices published by the transport layer, spawns the per-device driver
//! task and whichever fast-path services the device's capabilities justify,
//! and pairs services with time-sync providers as they publish.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::drivers::collections::processor::{
    BuildSettings, SUPPORTS_ACCEL_EVENTS, SUPPORTS_GYRO_EVENTS,
};
use crate::fastpath::led::LedActuatorService;
use crate::fastpath::sensor::{MotionKind, SensorSampleService};
use crate::fastpath::ServiceClient;
use crate::hid::element::{ElementRef, OutputPoster};
use crate::hid::InputReport;
use crate::input::device::client::DeviceClient;
use crate::input::device::Device;
use crate::timesync::{ProviderRef, TimeSyncRegistry};

const BUFFER_SIZE: usize = 1024;
const SERVICE_BUFFER_SIZE: usize = 16;

/// Everything the transport layer publishes about one device
pub struct DeviceInfo {
    /// Unique identifier of the physical device
    pub id: String,
    /// The application collection at the root of the parsed descriptor
    pub root_collection: ElementRef,
    /// Stream of raw report callbacks from the transport
    pub reports: mpsc::Receiver<InputReport>,
    /// Posts staged element values back to the device
    pub poster: Arc<dyn OutputPoster>,
    /// Whether a time-sync provider may publish for this device
    pub timesync_enabled: bool,
}

impl std::fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInfo")
            .field("id", &self.id)
            .field("timesync_enabled", &self.timesync_enabled)
            .finish()
    }
}

/// Manager commands define all the different ways to interact with [Manager]
/// over a channel.
pub enum ManagerCommand {
    AttachDevice(DeviceInfo, mpsc::Sender<Result<(), String>>),
    DetachDevice(String),
    PublishTimeSyncProvider(String, ProviderRef),
    GetDeviceIds(mpsc::Sender<Vec<String>>),
    GetDevice(String, mpsc::Sender<Option<DeviceClient>>),
    GetService(String, String, mpsc::Sender<Option<ServiceClient>>),
    Stop,
}

/// One attached device: its driver task client plus its fast-path service
/// clients, keyed by service name.
struct AttachedDevice {
    client: DeviceClient,
    services: HashMap<String, ServiceClient>,
}

/// Composition root owning every device and fast-path service task
pub struct Manager {
    config: Config,
    rx: mpsc::Receiver<ManagerCommand>,
    tx: mpsc::Sender<ManagerCommand>,
    devices: HashMap<String, AttachedDevice>,
    registry: TimeSyncRegistry,
    tasks: JoinSet<()>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = mpsc::channel(BUFFER_SIZE);
        Self {
            config,
            rx,
            tx,
            devices: HashMap::new(),
            registry: TimeSyncRegistry::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Returns a client handle for sending commands to the manager
    pub fn client(&self) -> ManagerClient {
        ManagerClient {
            tx: self.tx.clone(),
        }
    }

    /// Process manager commands until stopped
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ManagerCommand::AttachDevice(info, tx) => {
                    let result = self
                        .attach_device(info)
                        .await
                        .map_err(|err| err.to_string());
                    if tx.send(result).await.is_err() {
                        log::error!("failed to send attach response");
                    }
                }
                ManagerCommand::DetachDevice(id) => self.detach_device(&id).await,
                ManagerCommand::PublishTimeSyncProvider(id, provider) => {
                    self.registry.publish(&id, provider);
                }
                ManagerCommand::GetDeviceIds(tx) => {
                    let ids = self.devices.keys().cloned().collect();
                    if tx.send(ids).await.is_err() {
                        log::error!("failed to send device ids");
                    }
                }
                ManagerCommand::GetDevice(id, tx) => {
                    let client = self.devices.get(&id).map(|device| device.client.clone());
                    if tx.send(client).await.is_err() {
                        log::error!("failed to send device client");
                    }
                }
                ManagerCommand::GetService(id, name, tx) => {
                    let client = self
                        .devices
                        .get(&id)
                        .and_then(|device| device.services.get(&name))
                        .cloned();
                    if tx.send(client).await.is_err() {
                        log::error!("failed to send service client");
                    }
                }
                ManagerCommand::Stop => break,
            }
        }
        self.stop_all().await;
        Ok(())
    }

    /// Build the driver and fast-path services for a newly published device
    async fn attach_device(
        &mut self,
        info: DeviceInfo,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.devices.contains_key(&info.id) {
            return Err(format!("device already attached: {}", info.id).into());
        }

        let settings = BuildSettings {
            button: self.config.button.thresholds(),
        };
        let mut device = Device::new(info.id.clone(), &info.root_collection, &settings)?;
        let client = device.client();
        let capabilities = device.capabilities();
        let led_elements = device.led_elements();

        // fast-path services subscribe before the device task starts so no
        // report can slip past them
        let queue_entries = self.config.fastpath.queue_entries;
        let mut services = HashMap::new();
        for (name, kind, capability) in [
            ("accel", MotionKind::Accelerometer, SUPPORTS_ACCEL_EVENTS),
            ("gyro", MotionKind::Gyro, SUPPORTS_GYRO_EVENTS),
        ] {
            if !capabilities.iter().any(|c| c == capability) {
                continue;
            }
            let watch = info
                .timesync_enabled
                .then(|| self.registry.watch(&info.id));
            let (tx, rx) = mpsc::channel(SERVICE_BUFFER_SIZE);
            let mut service =
                SensorSampleService::new(kind, queue_entries, device.subscribe(), rx, watch)?;
            self.tasks.spawn(async move { service.run().await });
            services.insert(name.to_string(), ServiceClient::new(tx));
        }
        if let Some(elements) = led_elements {
            let watch = info
                .timesync_enabled
                .then(|| self.registry.watch(&info.id));
            let (tx, rx) = mpsc::channel(SERVICE_BUFFER_SIZE);
            let refresh = self.config.fastpath.led_refresh_interval();
            let mut service = LedActuatorService::new(
                elements,
                info.poster.clone(),
                queue_entries,
                refresh,
                rx,
                watch,
            )?;
            self.tasks.spawn(async move { service.run().await });
            services.insert("leds".to_string(), ServiceClient::new(tx));
        }

        // pump raw transport reports into the device task
        let pump_client = client.clone();
        let mut reports = info.reports;
        self.tasks.spawn(async move {
            while let Some(report) = reports.recv().await {
                if pump_client.process_report(report).await.is_err() {
                    break;
                }
            }
        });

        self.tasks.spawn(async move { device.run().await });

        log::info!("Attached device: {} ({capabilities:?})", info.id);
        self.devices
            .insert(info.id, AttachedDevice { client, services });
        Ok(())
    }

    /// Stop a device's services before its driver, so no in-flight callback
    /// can touch a stopped driver's elements.
    async fn detach_device(&mut self, id: &str) {
        let Some(device) = self.devices.remove(id) else {
            return;
        };
        for (name, service) in device.services {
            if let Err(err) = service.stop().await {
                log::warn!("failed to stop service {name}: {err}");
            }
        }
        if let Err(err) = device.client.stop().await {
            log::warn!("failed to stop device {id}: {err}");
        }
        log::info!("Detached device: {id}");
    }

    async fn stop_all(&mut self) {
        let ids: Vec<String> = self.devices.keys().cloned().collect();
        for id in ids {
            self.detach_device(&id).await;
        }
        self.tasks.shutdown().await;
    }
}

/// A client for a running [Manager] task
#[derive(Debug, Clone)]
pub struct ManagerClient {
    tx: mpsc::Sender<ManagerCommand>,
}

impl ManagerClient {
    /// Attach a device published by the transport layer
    pub async fn attach_device(&self, info: DeviceInfo) -> Result<(), String> {
        let (tx, mut rx) = mpsc::channel(1);
        self.tx
            .send(ManagerCommand::AttachDevice(info, tx))
            .await
            .map_err(|err| err.to_string())?;
        match rx.recv().await {
            Some(result) => result,
            None => Err("manager no longer exists".to_string()),
        }
    }

    /// Detach a previously attached device
    pub async fn detach_device(&self, id: &str) -> Result<(), String> {
        self.tx
            .send(ManagerCommand::DetachDevice(id.to_string()))
            .await
            .map_err(|err| err.to_string())
    }

    /// Publish a time-sync provider for the given physical device
    pub async fn publish_time_sync_provider(
        &self,
        device_id: &str,
        provider: ProviderRef,
    ) -> Result<(), String> {
        self.tx
            .send(ManagerCommand::PublishTimeSyncProvider(
                device_id.to_string(),
                provider,
            ))
            .await
            .map_err(|err| err.to_string())
    }

    /// Get the ids of all attached devices
    pub async fn get_device_ids(&self) -> Result<Vec<String>, String> {
        let (tx, mut rx) = mpsc::channel(1);
        self.tx
            .send(ManagerCommand::GetDeviceIds(tx))
            .await
            .map_err(|err| err.to_string())?;
        rx.recv().await.ok_or("manager no longer exists".to_string())
    }

    /// Get a client for an attached device
    pub async fn get_device(&self, id: &str) -> Result<Option<DeviceClient>, String> {
        let (tx, mut rx) = mpsc::channel(1);
        self.tx
            .send(ManagerCommand::GetDevice(id.to_string(), tx))
            .await
            .map_err(|err| err.to_string())?;
        rx.recv().await.ok_or("manager no longer exists".to_string())
    }

    /// Get a client for one of a device's fast-path services ("accel",
    /// "gyro", or "leds")
    pub async fn get_service(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<Option<ServiceClient>, String> {
        let (tx, mut rx) = mpsc::channel(1);
        self.tx
            .send(ManagerCommand::GetService(
                device_id.to_string(),
                name.to_string(),
                tx,
            ))
            .await
            .map_err(|err| err.to_string())?;
        rx.recv().await.ok_or("manager no longer exists".to_string())
    }

    /// Stop the manager and everything it owns
    pub async fn stop(&self) -> Result<(), String> {
        self.tx
            .send(ManagerCommand::Stop)
            .await
            .map_err(|err| err.to_string())
    }
}
