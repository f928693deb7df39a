//! Consumer service driving an LED constellation from the fast-path queue.
//! A privileged user-space writer enqueues desired LED state; this service
//! polls the latest sample on a fixed-period timer, and when the decoded
//! state changes, time-syncs the pulse midpoint and posts all seven output
//! elements to the device as one report.

use std::sync::Arc;
use std::time::Duration;

use packed_struct::{PackedStruct, PackingResult};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

use crate::drivers::collections::processor::LedElements;
use crate::hid::element::{Element, OutputPoster};
use crate::timesync::{ProviderRef, TimeSyncSession};

use super::queue::{CircularQueue, QueueError, Role};
use super::{Field, FieldKey, FieldType, SampleDescriptor, ServiceCommand};

/// Fixed binary layout of one LED state sample, little-endian. Field values
/// wider than their element ranges are clamped during decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedSample {
    /// Local timestamp of the desired pulse midpoint
    pub pulse_timestamp: u64,
    pub mode: u64,
    pub intensity: u64,
    pub blink_duration: u64,
    pub blink_period: u64,
}

pub const LED_SAMPLE_SIZE: usize = 40;

pub const LED_MODE_OFF: u8 = 0;
pub const LED_MODE_ON: u8 = 1;
pub const LED_MODE_BLINK: u8 = 2;

impl PackedStruct for LedSample {
    type ByteArray = [u8; LED_SAMPLE_SIZE];

    fn pack(&self) -> PackingResult<Self::ByteArray> {
        let mut buf = [0; LED_SAMPLE_SIZE];
        buf[0..8].copy_from_slice(&self.pulse_timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&self.mode.to_le_bytes());
        buf[16..24].copy_from_slice(&self.intensity.to_le_bytes());
        buf[24..32].copy_from_slice(&self.blink_duration.to_le_bytes());
        buf[32..40].copy_from_slice(&self.blink_period.to_le_bytes());
        Ok(buf)
    }

    fn unpack(src: &Self::ByteArray) -> PackingResult<Self> {
        let u64_at = |offset: usize| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&src[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        Ok(Self {
            pulse_timestamp: u64_at(0),
            mode: u64_at(8),
            intensity: u64_at(16),
            blink_duration: u64_at(24),
            blink_period: u64_at(32),
        })
    }
}

/// The published layout descriptor for the LED sample stream
pub fn led_descriptor() -> SampleDescriptor {
    SampleDescriptor::new(vec![
        Field::new(FieldKey::EventTimestamp, FieldType::Integer, 0, 8),
        Field::new(FieldKey::LedMode, FieldType::Integer, 8, 8),
        Field::new(FieldKey::LedIntensity, FieldType::Integer, 16, 8),
        Field::new(FieldKey::LedBlinkDuration, FieldType::Integer, 24, 8),
        Field::new(FieldKey::LedBlinkPeriod, FieldType::Integer, 32, 8),
    ])
}

/// Decoded, range-clamped LED state as it will be written to the device
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedState {
    pub on: bool,
    pub off: bool,
    pub blink: bool,
    pub intensity: u8,
    pub blink_on_time: u16,
    pub blink_off_time: u16,
    pub pulse_midpoint: u64,
}

impl LedState {
    /// Decode one queue sample, clamping every field into its element's
    /// valid range. The blink period is clamped to be at least the blink
    /// duration so the off time can never underflow.
    pub fn from_sample(sample: &LedSample) -> Self {
        let mode = sample.mode.min(u8::MAX as u64) as u8;
        let intensity = sample.intensity.min(u8::MAX as u64) as u8;
        let duration = sample.blink_duration.min(u16::MAX as u64) as u16;
        let period = sample
            .blink_period
            .clamp(duration as u64, u16::MAX as u64) as u16;

        Self {
            on: mode == LED_MODE_ON,
            off: mode == LED_MODE_OFF,
            blink: mode == LED_MODE_BLINK,
            intensity,
            blink_on_time: duration,
            blink_off_time: period - duration,
            pulse_midpoint: sample.pulse_timestamp,
        }
    }
}

/// Drives an LED constellation by polling the latest queue sample on a fixed
/// period and writing state changes through the constellation's output
/// elements.
pub struct LedActuatorService {
    queue: CircularQueue,
    descriptor: SampleDescriptor,
    elements: LedElements,
    poster: Arc<dyn OutputPoster>,
    refresh: Duration,
    rx: mpsc::Receiver<ServiceCommand>,
    session: Option<TimeSyncSession>,
    provider_watch: Option<oneshot::Receiver<ProviderRef>>,
    state: LedState,
    sample_buf: Vec<u8>,
    /// Poll ticks that found the queue never written
    empty_poll_count: u64,
    dequeued_once: bool,
}

impl LedActuatorService {
    pub fn new(
        elements: LedElements,
        poster: Arc<dyn OutputPoster>,
        capacity: usize,
        refresh: Duration,
        rx: mpsc::Receiver<ServiceCommand>,
        provider_watch: Option<oneshot::Receiver<ProviderRef>>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let queue = CircularQueue::with_entries(Role::Consumer, capacity, LED_SAMPLE_SIZE)?;
        Ok(Self {
            queue,
            descriptor: led_descriptor(),
            elements,
            poster,
            refresh,
            rx,
            session: None,
            provider_watch,
            state: LedState::default(),
            sample_buf: vec![0; LED_SAMPLE_SIZE],
            empty_poll_count: 0,
            dequeued_once: false,
        })
    }

    /// Poll the queue and process service commands until stopped
    pub async fn run(&mut self) {
        log::debug!("LED actuator service started");
        let mut ticker = interval(self.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_queue(),
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
        log::debug!("LED actuator service stopped");
    }

    fn open_session(&mut self, provider: ProviderRef) {
        let mut session = TimeSyncSession::new(provider);
        session.set_event_handler(Box::new(|event, precision| {
            log::debug!("LED time-sync event: {event:?} (precision: {precision:?})");
        }));
        match session.activate() {
            Ok(()) => self.session = Some(session),
            Err(err) => log::error!("failed to activate time-sync session: {err}"),
        }
    }

    /// One timer tick: peek the newest sample and apply it if it differs
    /// from the last applied state.
    fn poll_queue(&mut self) {
        match self.queue.copy_latest(&mut self.sample_buf) {
            Ok(_) => (),
            // a writer may simply not have started yet
            Err(QueueError::Underrun) => {
                self.empty_poll_count += 1;
                return;
            }
            Err(err) => {
                log::error!("failed to read latest LED sample: {err}");
                return;
            }
        }
        if !self.dequeued_once {
            log::debug!(
                "{} attempts to dequeue before first enqueue",
                self.empty_poll_count
            );
            self.dequeued_once = true;
        }

        let mut bytes = [0; LED_SAMPLE_SIZE];
        bytes.copy_from_slice(&self.sample_buf);
        let sample = match LedSample::unpack(&bytes) {
            Ok(sample) => sample,
            Err(err) => {
                log::error!("failed to unpack LED sample: {err}");
                return;
            }
        };

        let new_state = LedState::from_sample(&sample);
        if new_state != self.state {
            self.update_led_state(new_state);
        }
    }

    /// Write the new state through the constellation elements as one
    /// outbound report. The pulse midpoint is time-synced first; if that
    /// fails the whole update is abandoned and the last good state kept.
    fn update_led_state(&mut self, new_state: LedState) {
        let time_data = match self.session.as_mut() {
            Some(session) => match session.data_from_synced_time(new_state.pulse_midpoint) {
                Ok(data) => data,
                Err(err) => {
                    log::error!("failed to sync LED pulse timestamp: {err}");
                    return;
                }
            },
            None => {
                log::error!("no time-sync session for LED pulse timestamp");
                return;
            }
        };

        self.state = new_state;

        let elements = &self.elements;
        let staged = [
            elements.timestamp.set_data_bits(&time_data),
            elements
                .mode_on
                .set_data_bits(&[new_state.on as u8]),
            elements
                .mode_off
                .set_data_bits(&[new_state.off as u8]),
            elements
                .mode_blink
                .set_data_bits(&[new_state.blink as u8]),
            elements
                .intensity
                .set_data_bits(&[new_state.intensity]),
            elements
                .blink_on_time
                .set_data_bits(&new_state.blink_on_time.to_le_bytes()),
            elements
                .blink_off_time
                .set_data_bits(&new_state.blink_off_time.to_le_bytes()),
        ];
        for result in staged {
            if let Err(err) = result {
                log::error!("failed to stage LED element: {err}");
                return;
            }
        }

        if let Err(err) = self.poster.post_element_values(&elements.cookies()) {
            log::error!("failed to post LED output report: {err}");
        }
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
