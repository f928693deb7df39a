//! HID usage tables, unit codes, and the element accessor interface that the
//! element processors consume. The report-descriptor parser itself lives in
//! the transport layer; this module only defines the surface the decoders use.

pub mod element;
#[cfg(test)]
pub mod fake;

// Usage pages
pub const PAGE_GENERIC_DESKTOP: u16 = 0x01;
pub const PAGE_LED: u16 = 0x08;
pub const PAGE_BUTTON: u16 = 0x09;
pub const PAGE_ORDINAL: u16 = 0x0A;
pub const PAGE_SENSOR: u16 = 0x20;
/// Vendor page carrying opaque time-sync timestamps alongside sensor samples
pub const PAGE_VENDOR_SENSOR: u16 = 0xFF0A;
/// Vendor page for the LED constellation output collection
pub const PAGE_VENDOR_LED: u16 = 0xFF0C;

// Generic desktop usages
pub const USAGE_GD_X: u16 = 0x30;
pub const USAGE_GD_Y: u16 = 0x31;
pub const USAGE_GD_THUMBSTICK: u16 = 0x96;

// Sensor page usages
pub const USAGE_SENSOR_HUMAN_PROXIMITY: u16 = 0x12;
pub const USAGE_SENSOR_HUMAN_TOUCH: u16 = 0x13;
pub const USAGE_SENSOR_MECHANICAL_FORCE: u16 = 0x64;
pub const USAGE_SENSOR_MOTION: u16 = 0x70;
pub const USAGE_SENSOR_ACCELEROMETER_3D: u16 = 0x73;
pub const USAGE_SENSOR_GYROMETER_3D: u16 = 0x76;

// Sensor page data fields
pub const USAGE_SENSOR_DATA_ACCEL_X: u16 = 0x0453;
pub const USAGE_SENSOR_DATA_ACCEL_Y: u16 = 0x0454;
pub const USAGE_SENSOR_DATA_ACCEL_Z: u16 = 0x0455;
pub const USAGE_SENSOR_DATA_ANGULAR_VELOCITY_X: u16 = 0x0457;
pub const USAGE_SENSOR_DATA_ANGULAR_VELOCITY_Y: u16 = 0x0458;
pub const USAGE_SENSOR_DATA_ANGULAR_VELOCITY_Z: u16 = 0x0459;
pub const USAGE_SENSOR_DATA_PROXIMITY_RANGE: u16 = 0x04B2;
pub const USAGE_SENSOR_DATA_TOUCH_STATE: u16 = 0x04B3;
pub const USAGE_SENSOR_DATA_FORCE: u16 = 0x0544;

// Sensor page feature properties
pub const USAGE_SENSOR_PROP_REPORT_INTERVAL: u16 = 0x030E;
pub const USAGE_SENSOR_PROP_SAMPLING_RATE: u16 = 0x0317;

// LED page usages
pub const USAGE_LED_MULTI_MODE_INDICATOR: u16 = 0x3C;
pub const USAGE_LED_INDICATOR_ON: u16 = 0x3D;
pub const USAGE_LED_INDICATOR_FAST_BLINK: u16 = 0x40;
pub const USAGE_LED_INDICATOR_OFF: u16 = 0x41;
pub const USAGE_LED_FAST_BLINK_ON_TIME: u16 = 0x42;
pub const USAGE_LED_FAST_BLINK_OFF_TIME: u16 = 0x45;
pub const USAGE_LED_INTENSITY: u16 = 0x4D;

// Vendor usages
pub const USAGE_VENDOR_TIMESYNC_TIMESTAMP: u16 = 0x01;
pub const USAGE_VENDOR_LED_CONSTELLATION: u16 = 0x01;

/// HID unit code for acceleration (cm/s^2)
pub const UNIT_ACCELERATION: u32 = 0xE011;
/// Conversion factor from acceleration units to G's
pub const ACCEL_UNITS_PER_G: f64 = 9.81;

/// The kind of report a transport callback delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Input,
    Output,
    Feature,
}

/// One raw report delivered by the underlying device transport. The element
/// accessors already reflect the report contents by the time this arrives;
/// the decoders only use the timestamp and report identity.
#[derive(Debug, Clone)]
pub struct InputReport {
    /// Monotonic timestamp of report arrival
    pub timestamp: u64,
    /// Report type delivered by the transport
    pub report_type: ReportType,
    /// HID report ID, 0 when the device does not number reports
    pub report_id: u8,
    /// Raw report payload
    pub data: Vec<u8>,
}
