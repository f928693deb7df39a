//! Producer services streaming accelerometer and gyro samples into the
//! fast-path queue. Each matching event is time-synced against the device's
//! clock domain, stamped with a generation counter, and enqueued as one
//! fixed-layout sample.

use packed_struct::{PackedStruct, PackingResult};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::hid::{PAGE_VENDOR_SENSOR, USAGE_VENDOR_TIMESYNC_TIMESTAMP};
use crate::input::event::{EventKind, EventNode, EventPayload};
use crate::timesync::{
    ProviderRef, TimeSyncError, TimeSyncSession,
};

use super::queue::{CircularQueue, Role};
use super::{Field, FieldKey, FieldType, SampleDescriptor, ServiceCommand};

/// Fixed binary layout of one motion sample, little-endian
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionSample {
    /// Local timestamp of the event that produced the sample
    pub event_timestamp: u64,
    /// Synced device-domain timestamp, 0 until time-sync becomes available
    pub sample_timestamp: u64,
    /// Monotonically increasing generation counter
    pub sample_id: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

pub const MOTION_SAMPLE_SIZE: usize = 48;

impl PackedStruct for MotionSample {
    type ByteArray = [u8; MOTION_SAMPLE_SIZE];

    fn pack(&self) -> PackingResult<Self::ByteArray> {
        let mut buf = [0; MOTION_SAMPLE_SIZE];
        buf[0..8].copy_from_slice(&self.event_timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sample_timestamp.to_le_bytes());
        buf[16..24].copy_from_slice(&self.sample_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.x.to_le_bytes());
        buf[32..40].copy_from_slice(&self.y.to_le_bytes());
        buf[40..48].copy_from_slice(&self.z.to_le_bytes());
        Ok(buf)
    }

    fn unpack(src: &Self::ByteArray) -> PackingResult<Self> {
        let u64_at = |offset: usize| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&src[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        let f64_at = |offset: usize| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&src[offset..offset + 8]);
            f64::from_le_bytes(bytes)
        };
        Ok(Self {
            event_timestamp: u64_at(0),
            sample_timestamp: u64_at(8),
            sample_id: u64_at(16),
            x: f64_at(24),
            y: f64_at(32),
            z: f64_at(40),
        })
    }
}

/// Which motion events a [SensorSampleService] consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionKind {
    Accelerometer,
    Gyro,
}

impl MotionKind {
    /// The published layout descriptor for this sample stream
    pub fn descriptor(&self) -> SampleDescriptor {
        let (x, y, z) = match self {
            MotionKind::Accelerometer => (FieldKey::AccelX, FieldKey::AccelY, FieldKey::AccelZ),
            MotionKind::Gyro => (FieldKey::GyroX, FieldKey::GyroY, FieldKey::GyroZ),
        };
        SampleDescriptor::new(vec![
            Field::new(FieldKey::EventTimestamp, FieldType::Integer, 0, 8),
            Field::new(FieldKey::SampleTimestamp, FieldType::Integer, 8, 8),
            Field::new(FieldKey::SampleId, FieldType::Integer, 16, 8),
            Field::new(x, FieldType::Double, 24, 8),
            Field::new(y, FieldType::Double, 32, 8),
            Field::new(z, FieldType::Double, 40, 8),
        ])
    }

    fn event_kind(&self) -> EventKind {
        match self {
            MotionKind::Accelerometer => EventKind::Accelerometer,
            MotionKind::Gyro => EventKind::Gyro,
        }
    }
}

/// Streams one device's accelerometer or gyro samples into a producer-role
/// circular queue. Runs on its own task; events arrive over the device's
/// broadcast channel.
pub struct SensorSampleService {
    kind: MotionKind,
    queue: CircularQueue,
    descriptor: SampleDescriptor,
    events: broadcast::Receiver<EventNode>,
    rx: mpsc::Receiver<ServiceCommand>,
    session: Option<TimeSyncSession>,
    provider_watch: Option<oneshot::Receiver<ProviderRef>>,
    /// Translation attempts rejected before the session became ready
    sync_not_ready_count: u64,
    generation: u64,
}

impl SensorSampleService {
    /// Create the service with a queue of `capacity` entries. The provider
    /// watch channel fires once when a time-sync provider publishes for the
    /// same physical device; pass `None` for devices without time-sync.
    pub fn new(
        kind: MotionKind,
        capacity: usize,
        events: broadcast::Receiver<EventNode>,
        rx: mpsc::Receiver<ServiceCommand>,
        provider_watch: Option<oneshot::Receiver<ProviderRef>>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let descriptor = kind.descriptor();
        let queue = CircularQueue::with_entries(Role::Producer, capacity, MOTION_SAMPLE_SIZE)?;
        Ok(Self {
            kind,
            queue,
            descriptor,
            events,
            rx,
            session: None,
            provider_watch,
            sync_not_ready_count: 0,
            generation: 0,
        })
    }

    /// Process events and service commands until stopped
    pub async fn run(&mut self) {
        log::debug!("Sensor sample service started: {:?}", self.kind);
        loop {
            tokio::select! {
                result = self.events.recv() => match result {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        log::warn!("sensor service lagged, missed {count} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                provider = watch_provider(&mut self.provider_watch) => {
                    self.provider_watch = None;
                    if let Ok(provider) = provider {
                        self.open_session(provider);
                    }
                },
                cmd = self.rx.recv() => match cmd {
                    Some(ServiceCommand::GetDescriptor(tx)) => {
                        if let Err(err) = tx.send(self.descriptor.clone()).await {
                            log::error!("failed to send descriptor: {err}");
                        }
                    }
                    Some(ServiceCommand::ShareQueue(tx)) => {
                        if let Err(err) = tx.send(self.queue.share_fd()).await {
                            log::error!("failed to send queue fd: {err}");
                        }
                    }
                    Some(ServiceCommand::Stop) | None => break,
                },
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.cancel();
        }
        log::debug!("Sensor sample service stopped: {:?}", self.kind);
    }

    /// Open a time-sync session against a freshly matched provider
    fn open_session(&mut self, provider: ProviderRef) {
        let kind = self.kind;
        let mut session = TimeSyncSession::new(provider);
        session.set_event_handler(Box::new(move |event, precision| {
            log::debug!("{kind:?} time-sync event: {event:?} (precision: {precision:?})");
        }));
        match session.activate() {
            Ok(()) => {
                log::debug!(
                    "time-sync session opened ({} earlier attempts to time-sync failed)",
                    self.sync_not_ready_count
                );
                self.session = Some(session);
            }
            Err(err) => log::error!("failed to activate time-sync session: {err}"),
        }
    }

    /// Recursively unwrap collection events and enqueue every matching
    /// motion sample.
    fn handle_event(&mut self, event: &EventNode) {
        match event.payload() {
            EventPayload::Accelerometer { x, y, z } if self.kind == MotionKind::Accelerometer => {
                self.enqueue_sample(event, *x, *y, *z)
            }
            EventPayload::Gyro { x, y, z } if self.kind == MotionKind::Gyro => {
                self.enqueue_sample(event, *x, *y, *z)
            }
            EventPayload::Collection { .. } => {
                for child in event.children() {
                    self.handle_event(child);
                }
            }
            _ => (),
        }
    }

    fn enqueue_sample(&mut self, event: &EventNode, x: f64, y: f64, z: f64) {
        let mut sample = MotionSample {
            event_timestamp: event.timestamp(),
            sample_timestamp: 0,
            sample_id: self.generation,
            x,
            y,
            z,
        };
        self.generation += 1;

        match self.time_sync_event(event) {
            Ok(synced) => sample.sample_timestamp = synced,
            // too chatty before time-sync becomes available to log
            Err(TimeSyncError::NotReady) | Err(TimeSyncError::NotActivated) => {
                self.sync_not_ready_count += 1;
            }
            Err(err) => log::error!("failed to sync sample timestamp: {err}"),
        }

        let Ok(bytes) = sample.pack() else {
            return;
        };
        if let Err(err) = self.queue.enqueue(&bytes) {
            log::error!("failed to enqueue {:?} sample: {err}", self.kind);
        }
    }

    /// Translate the event's embedded device timestamp into the local clock
    /// domain using the matched time-sync session.
    fn time_sync_event(&mut self, event: &EventNode) -> Result<u64, TimeSyncError> {
        let Some(session) = self.session.as_mut() else {
            return Err(TimeSyncError::NotReady);
        };
        let Some(child) = event.find_child(
            EventKind::VendorDefined,
            PAGE_VENDOR_SENSOR,
            USAGE_VENDOR_TIMESYNC_TIMESTAMP,
        ) else {
            return Err(TimeSyncError::Unsupported);
        };
        let EventPayload::VendorDefined { data, .. } = child.payload() else {
            return Err(TimeSyncError::Unsupported);
        };
        session.synced_time_from_data(data)
    }
}

/// Await the provider watch channel, pending forever once it has fired
async fn watch_provider(
    watch: &mut Option<oneshot::Receiver<ProviderRef>>,
) -> Result<ProviderRef, oneshot::error::RecvError> {
    match watch {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}
