//! Element processors decode recognized descriptor collections into typed
//! events. The tree is built once from the static descriptor and re-walked on
//! every input report; processing is post-order, and a node only produces an
//! event when its own report ID matched or at least one child produced one.

use std::collections::HashMap;

use serde_json::Value;

use crate::hid::element::{
    find_element, CollectionType, Element, ElementRef, ElementType, ScaleKind,
};
use crate::hid::{
    ACCEL_UNITS_PER_G, PAGE_BUTTON, PAGE_GENERIC_DESKTOP, PAGE_LED, PAGE_ORDINAL, PAGE_SENSOR,
    PAGE_VENDOR_LED, PAGE_VENDOR_SENSOR, UNIT_ACCELERATION, USAGE_GD_THUMBSTICK, USAGE_GD_X,
    USAGE_GD_Y, USAGE_LED_FAST_BLINK_OFF_TIME, USAGE_LED_FAST_BLINK_ON_TIME,
    USAGE_LED_INDICATOR_FAST_BLINK, USAGE_LED_INDICATOR_OFF, USAGE_LED_INDICATOR_ON,
    USAGE_LED_INTENSITY, USAGE_LED_MULTI_MODE_INDICATOR, USAGE_SENSOR_ACCELEROMETER_3D,
    USAGE_SENSOR_DATA_ACCEL_X, USAGE_SENSOR_DATA_ACCEL_Y, USAGE_SENSOR_DATA_ACCEL_Z,
    USAGE_SENSOR_DATA_ANGULAR_VELOCITY_X, USAGE_SENSOR_DATA_ANGULAR_VELOCITY_Y,
    USAGE_SENSOR_DATA_ANGULAR_VELOCITY_Z, USAGE_SENSOR_DATA_FORCE,
    USAGE_SENSOR_DATA_PROXIMITY_RANGE, USAGE_SENSOR_DATA_TOUCH_STATE, USAGE_SENSOR_GYROMETER_3D,
    USAGE_SENSOR_HUMAN_PROXIMITY, USAGE_SENSOR_HUMAN_TOUCH, USAGE_SENSOR_MECHANICAL_FORCE,
    USAGE_SENSOR_MOTION, USAGE_SENSOR_PROP_REPORT_INTERVAL, USAGE_SENSOR_PROP_SAMPLING_RATE,
    USAGE_VENDOR_LED_CONSTELLATION, USAGE_VENDOR_TIMESYNC_TIMESTAMP,
};
use crate::input::event::{EventNode, EventPayload};

// Property keys understood by individual processors
pub const PROPERTY_REPORT_INTERVAL: &str = "ReportInterval";
pub const PROPERTY_SAMPLE_INTERVAL: &str = "SampleInterval";
pub const PROPERTY_MULTI_BIT: &str = "MultiBit";
pub const PROPERTY_PRESS_THRESHOLD: &str = "ButtonPressThreshold";
pub const PROPERTY_RELEASE_THRESHOLD: &str = "ButtonReleaseThreshold";

// Capability flags recorded on the owning device as processors build
pub const SUPPORTS_ACCEL_EVENTS: &str = "SupportsAccelEvents";
pub const SUPPORTS_GYRO_EVENTS: &str = "SupportsGyroEvents";
pub const SUPPORTS_MULTI_AXIS_POINTER_EVENTS: &str = "SupportsMultiAxisPointerEvents";
pub const SUPPORTS_BUTTON_EVENTS: &str = "SupportsButtonEvents";
pub const SUPPORTS_FORCE_EVENTS: &str = "SupportsForceEvents";
pub const SUPPORTS_PROXIMITY_EVENTS: &str = "SupportsProximityEvents";
pub const SUPPORTS_LED_CONSTELLATION: &str = "SupportsLEDConstellation";

/// Button press/release thresholds in the button's physical range. The
/// release threshold must not exceed the press threshold; the gap between
/// them is the dead-band that suppresses chatter around a single crossing.
#[derive(Debug, Clone, Copy)]
pub struct ButtonThresholds {
    pub press: f64,
    pub release: f64,
}

impl Default for ButtonThresholds {
    fn default() -> Self {
        Self {
            press: 0.5,
            release: 0.4,
        }
    }
}

/// Tunables applied while building a [ProcessorTree]
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildSettings {
    pub button: ButtonThresholds,
}

/// Which motion quantity a set of sensor axis elements reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionAxis {
    Acceleration,
    AngularVelocity,
}

/// Input and feature elements backing an accelerometer or gyro collection.
/// Axis vectors are index-aligned: entry `i` of each vector belongs to sample
/// `i` of a batched report.
#[derive(Debug)]
pub struct MotionElements {
    axis: MotionAxis,
    x: Vec<ElementRef>,
    y: Vec<ElementRef>,
    z: Vec<ElementRef>,
    timestamps: Vec<ElementRef>,
    report_interval: ElementRef,
    sample_interval: Option<ElementRef>,
}

impl MotionElements {
    /// Number of samples carried by one report
    pub fn sample_count(&self) -> usize {
        self.x.len()
    }

    fn sample_event(&self, timestamp: u64, index: usize) -> EventNode {
        let x = self.axis_value(&self.x[index]);
        let y = self.axis_value(&self.y[index]);
        let z = self.axis_value(&self.z[index]);
        let payload = match self.axis {
            MotionAxis::Acceleration => EventPayload::Accelerometer { x, y, z },
            MotionAxis::AngularVelocity => EventPayload::Gyro { x, y, z },
        };
        let mut event = EventNode::new(timestamp, payload);
        if let Some(element) = self.timestamps.get(index) {
            // raw, unconverted per-sample timestamp; consumers own the decoding
            event.append_child(EventNode::new(
                timestamp,
                EventPayload::VendorDefined {
                    usage_page: PAGE_VENDOR_SENSOR,
                    usage: USAGE_VENDOR_TIMESYNC_TIMESTAMP,
                    version: 0,
                    data: element.data_value(),
                },
            ));
        }
        event
    }

    fn axis_value(&self, element: &ElementRef) -> f64 {
        let value = element.scaled_value(ScaleKind::Exponent);
        if self.axis == MotionAxis::Acceleration && element.unit() == UNIT_ACCELERATION {
            // convert acceleration units to G's
            return value * ACCEL_UNITS_PER_G;
        }
        value
    }
}

/// Elements backing a thumbstick collection
#[derive(Debug)]
pub struct ThumbstickElements {
    x: ElementRef,
    y: ElementRef,
    /// Ordinal usage of the stick instance, 0 when no ordinal sub-collection
    /// was present
    ordinal: u16,
}

/// Input element and hysteresis state of a button collection
#[derive(Debug)]
pub struct ButtonState {
    input: ElementRef,
    thresholds: ButtonThresholds,
    pressed: bool,
}

impl ButtonState {
    /// Apply one pressure reading to the hysteresis state. The state only
    /// transitions when the pressure crosses the press threshold upward or
    /// the release threshold downward.
    fn update(&mut self, pressure: f64) -> bool {
        if !self.pressed && pressure >= self.thresholds.press {
            self.pressed = true;
        } else if self.pressed && pressure < self.thresholds.release {
            self.pressed = false;
        }
        self.pressed
    }
}

/// Input element of a force sensor collection
#[derive(Debug)]
pub struct ForceElements {
    force: ElementRef,
}

/// Input elements of a proximity sensor collection
#[derive(Debug)]
pub struct ProximityElements {
    touch: ElementRef,
    range: Option<ElementRef>,
}

/// The seven output elements of an LED constellation collection, published to
/// the actuator service that drives them directly.
#[derive(Debug, Clone)]
pub struct LedElements {
    pub mode_on: ElementRef,
    pub mode_off: ElementRef,
    pub mode_blink: ElementRef,
    pub intensity: ElementRef,
    pub blink_on_time: ElementRef,
    pub blink_off_time: ElementRef,
    pub timestamp: ElementRef,
}

impl LedElements {
    /// Element cookies in outbound report order
    pub fn cookies(&self) -> [u32; 7] {
        [
            self.mode_on.cookie(),
            self.mode_off.cookie(),
            self.mode_blink.cookie(),
            self.intensity.cookie(),
            self.blink_on_time.cookie(),
            self.blink_off_time.cookie(),
            self.timestamp.cookie(),
        ]
    }
}

/// Per-variant data of a [Processor]
#[derive(Debug)]
pub enum ProcessorKind {
    /// The application collection at the top of the tree. Holds no elements;
    /// only ever triggered through its children.
    Root,
    Accel(MotionElements),
    Gyro(MotionElements),
    Thumbstick(ThumbstickElements),
    Button(ButtonState),
    Force(ForceElements),
    Proximity(ProximityElements),
    LedConstellation(LedElements),
}

impl ProcessorKind {
    /// Capability flag recorded on the owning device when this variant builds
    fn capability(&self) -> Option<&'static str> {
        match self {
            ProcessorKind::Root => None,
            ProcessorKind::Accel(_) => Some(SUPPORTS_ACCEL_EVENTS),
            ProcessorKind::Gyro(_) => Some(SUPPORTS_GYRO_EVENTS),
            ProcessorKind::Thumbstick(_) => Some(SUPPORTS_MULTI_AXIS_POINTER_EVENTS),
            ProcessorKind::Button(_) => Some(SUPPORTS_BUTTON_EVENTS),
            ProcessorKind::Force(_) => Some(SUPPORTS_FORCE_EVENTS),
            ProcessorKind::Proximity(_) => Some(SUPPORTS_PROXIMITY_EVENTS),
            ProcessorKind::LedConstellation(_) => Some(SUPPORTS_LED_CONSTELLATION),
        }
    }
}

type Builder = fn(&ElementRef, &BuildSettings) -> Option<Processor>;

/// Variant builders tried on every nested collection, in priority order. A
/// collection may match more than one builder; every success is kept.
const BUILDERS: &[Builder] = &[
    Processor::try_build_accel,
    Processor::try_build_gyro,
    Processor::try_build_proximity,
    Processor::try_build_thumbstick,
    Processor::try_build_button,
    Processor::try_build_force,
    Processor::try_build_led_constellation,
];

/// One node of the processor tree. Construction either fully succeeds with
/// all required elements resolved, or the processor never comes into
/// existence; no partially-built processor joins the tree.
#[derive(Debug)]
pub struct Processor {
    /// Report ID whose arrival triggers this processor directly. 0 is a
    /// sentinel meaning "only ever triggered through children".
    report_id: u8,
    cookie: u32,
    usage_page: u16,
    usage: u16,
    children: Vec<u32>,
    properties: Option<HashMap<String, Value>>,
    kind: ProcessorKind,
}

impl Processor {
    fn new(report_id: u8, usage_page: u16, usage: u16, kind: ProcessorKind) -> Self {
        Self {
            report_id,
            cookie: 0,
            usage_page,
            usage,
            children: Vec::new(),
            properties: None,
            kind,
        }
    }

    pub fn report_id(&self) -> u8 {
        self.report_id
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn usage_page(&self) -> u16 {
        self.usage_page
    }

    pub fn usage(&self) -> u16 {
        self.usage
    }

    pub fn kind(&self) -> &ProcessorKind {
        &self.kind
    }

    pub fn children(&self) -> &[u32] {
        &self.children
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.as_ref()?.get(key)
    }

    fn matches_report(&self, report_id: u8) -> bool {
        self.report_id != 0 && self.report_id == report_id
    }

    /// Set a property on this processor. Sensor interval and button threshold
    /// keys are intercepted and applied; anything else is just recorded in
    /// the lazily allocated property map. Invalid threshold updates are
    /// rejected and the prior value retained.
    pub fn set_property(&mut self, key: &str, value: Value) {
        match &mut self.kind {
            ProcessorKind::Accel(motion) | ProcessorKind::Gyro(motion) => {
                let element = match key {
                    PROPERTY_REPORT_INTERVAL => Some(&motion.report_interval),
                    PROPERTY_SAMPLE_INTERVAL => motion.sample_interval.as_ref(),
                    _ => None,
                };
                if let (Some(element), Some(interval)) = (element, value.as_u64()) {
                    let data = (interval as u32).to_le_bytes();
                    if let Err(err) = element.set_data_bits(&data) {
                        log::warn!("failed to write {key} feature element: {err}");
                    }
                }
            }
            ProcessorKind::Button(button)
                if key == PROPERTY_PRESS_THRESHOLD || key == PROPERTY_RELEASE_THRESHOLD =>
            {
                let Some(threshold) = value.as_f64() else {
                    return;
                };
                if threshold < button.input.physical_min()
                    || threshold > button.input.physical_max()
                {
                    return;
                }
                if key == PROPERTY_PRESS_THRESHOLD {
                    if threshold < button.thresholds.release {
                        log::error!(
                            "cannot set press threshold ({threshold}) lower than release ({})",
                            button.thresholds.release
                        );
                        return;
                    }
                    button.thresholds.press = threshold;
                } else {
                    if threshold > button.thresholds.press {
                        log::error!(
                            "cannot set release threshold ({threshold}) higher than press ({})",
                            button.thresholds.press
                        );
                        return;
                    }
                    button.thresholds.release = threshold;
                }
            }
            _ => (),
        }
        self.properties
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
    }

    /// Create this processor's event for one report. Returns `None` for
    /// variants that never produce input events.
    fn create_event(&mut self, timestamp: u64) -> Option<EventNode> {
        match &mut self.kind {
            ProcessorKind::Root => Some(EventNode::collection(
                timestamp,
                self.usage_page,
                self.usage,
            )),
            ProcessorKind::Accel(motion) | ProcessorKind::Gyro(motion) => {
                let mut event = EventNode::collection(timestamp, self.usage_page, self.usage);
                for i in 0..motion.sample_count() {
                    event.append_child(motion.sample_event(timestamp, i));
                }
                Some(event)
            }
            ProcessorKind::Thumbstick(stick) => {
                let x = stick.x.scaled_value(ScaleKind::Physical);
                let y = stick.y.scaled_value(ScaleKind::Physical);
                let mut event = EventNode::new(timestamp, EventPayload::MultiAxisPointer { x, y });
                if stick.ordinal != 0 {
                    // zero-length marker carrying the stick instance ordinal
                    event.append_child(EventNode::new(
                        timestamp,
                        EventPayload::VendorDefined {
                            usage_page: PAGE_ORDINAL,
                            usage: stick.ordinal,
                            version: 0,
                            data: Vec::new(),
                        },
                    ));
                }
                Some(event)
            }
            ProcessorKind::Button(button) => {
                let pressure = button.input.scaled_value(ScaleKind::Physical);
                let pressed = button.update(pressure);
                Some(EventNode::new(
                    timestamp,
                    EventPayload::Button {
                        button: button.input.usage(),
                        pressure,
                        pressed,
                    },
                ))
            }
            ProcessorKind::Force(force) => {
                let value = force.force.scaled_value(ScaleKind::Exponent);
                Some(EventNode::new(
                    timestamp,
                    EventPayload::VendorDefined {
                        usage_page: PAGE_SENSOR,
                        usage: USAGE_SENSOR_DATA_FORCE,
                        version: 0,
                        data: value.to_le_bytes().to_vec(),
                    },
                ))
            }
            ProcessorKind::Proximity(proximity) => {
                let touched = proximity.touch.value() != 0;
                let level = proximity
                    .range
                    .as_ref()
                    .map(|range| range.value().clamp(0, u32::MAX as i64) as u32)
                    .unwrap_or(0);
                Some(EventNode::new(
                    timestamp,
                    EventPayload::Proximity { touched, level },
                ))
            }
            // the constellation only drives outputs
            ProcessorKind::LedConstellation(_) => None,
        }
    }

    fn try_build_root(collection: &ElementRef) -> Option<Processor> {
        if collection.element_type() != ElementType::Collection {
            log::warn!("unexpected element type for root collection");
            return None;
        }
        if collection.collection_type() != Some(CollectionType::Application) {
            log::warn!(
                "unexpected collection type for root: {:?}",
                collection.collection_type()
            );
            return None;
        }
        Some(Processor::new(
            0,
            collection.usage_page(),
            collection.usage(),
            ProcessorKind::Root,
        ))
    }

    fn try_build_accel(collection: &ElementRef, _settings: &BuildSettings) -> Option<Processor> {
        if collection.usage_page() != PAGE_SENSOR {
            return None;
        }
        if collection.usage() != USAGE_SENSOR_ACCELEROMETER_3D
            && collection.usage() != USAGE_SENSOR_MOTION
        {
            return None;
        }
        let (report_id, elements) = Self::collect_motion_elements(
            collection,
            MotionAxis::Acceleration,
            USAGE_SENSOR_DATA_ACCEL_X,
            USAGE_SENSOR_DATA_ACCEL_Y,
            USAGE_SENSOR_DATA_ACCEL_Z,
        )?;
        Some(Processor::new(
            report_id,
            PAGE_SENSOR,
            USAGE_SENSOR_ACCELEROMETER_3D,
            ProcessorKind::Accel(elements),
        ))
    }

    fn try_build_gyro(collection: &ElementRef, _settings: &BuildSettings) -> Option<Processor> {
        if collection.usage_page() != PAGE_SENSOR {
            return None;
        }
        if collection.usage() != USAGE_SENSOR_GYROMETER_3D
            && collection.usage() != USAGE_SENSOR_MOTION
        {
            return None;
        }
        let (report_id, elements) = Self::collect_motion_elements(
            collection,
            MotionAxis::AngularVelocity,
            USAGE_SENSOR_DATA_ANGULAR_VELOCITY_X,
            USAGE_SENSOR_DATA_ANGULAR_VELOCITY_Y,
            USAGE_SENSOR_DATA_ANGULAR_VELOCITY_Z,
        )?;
        Some(Processor::new(
            report_id,
            PAGE_SENSOR,
            USAGE_SENSOR_GYROMETER_3D,
            ProcessorKind::Gyro(elements),
        ))
    }

    /// Gather the index-aligned (X, Y, Z, timestamp) input tuples and the
    /// interval feature elements of a motion collection. All input elements
    /// must share one report ID; elements from other reports are skipped.
    fn collect_motion_elements(
        collection: &ElementRef,
        axis: MotionAxis,
        x_usage: u16,
        y_usage: u16,
        z_usage: u16,
    ) -> Option<(u8, MotionElements)> {
        if collection.element_type() != ElementType::Collection
            || collection.collection_type() != Some(CollectionType::Physical)
        {
            return None;
        }
        let children = collection.children();
        if children.is_empty() {
            log::debug!("motion collection has no child elements");
            return None;
        }

        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut z = Vec::new();
        let mut timestamps = Vec::new();
        let mut report_id: Option<u8> = None;
        for element in &children {
            // only consider input elements
            if element.element_type() != ElementType::InputMisc {
                continue;
            }
            // all input elements should be in the same report
            match report_id {
                None => report_id = Some(element.report_id()),
                Some(id) if element.report_id() != id => continue,
                Some(_) => (),
            }
            match (element.usage_page(), element.usage()) {
                (PAGE_SENSOR, usage) if usage == x_usage => x.push(element.clone()),
                (PAGE_SENSOR, usage) if usage == y_usage => y.push(element.clone()),
                (PAGE_SENSOR, usage) if usage == z_usage => z.push(element.clone()),
                (PAGE_VENDOR_SENSOR, USAGE_VENDOR_TIMESYNC_TIMESTAMP) => {
                    timestamps.push(element.clone())
                }
                _ => (),
            }
        }

        let sample_count = x.len();
        if sample_count == 0 {
            log::debug!("no complete (x, y, z) input tuples");
            return None;
        }
        if y.len() != sample_count || z.len() != sample_count {
            log::warn!(
                "axis element count mismatch: x={sample_count} y={} z={}",
                y.len(),
                z.len()
            );
            return None;
        }
        if !timestamps.is_empty() && timestamps.len() != sample_count {
            log::warn!(
                "timestamp element count mismatch: x={sample_count} ts={}",
                timestamps.len()
            );
            return None;
        }
        let report_id = report_id?;

        let Some(report_interval) = find_element(
            &children,
            ElementType::Feature,
            PAGE_SENSOR,
            USAGE_SENSOR_PROP_REPORT_INTERVAL,
        ) else {
            log::warn!("missing report interval element");
            return None;
        };
        let sample_interval = find_element(
            &children,
            ElementType::Feature,
            PAGE_SENSOR,
            USAGE_SENSOR_PROP_SAMPLING_RATE,
        );

        Some((
            report_id,
            MotionElements {
                axis,
                x,
                y,
                z,
                timestamps,
                report_interval,
                sample_interval,
            },
        ))
    }

    fn try_build_thumbstick(
        collection: &ElementRef,
        _settings: &BuildSettings,
    ) -> Option<Processor> {
        if collection.usage_page() != PAGE_GENERIC_DESKTOP
            || collection.usage() != USAGE_GD_THUMBSTICK
        {
            return None;
        }
        if collection.element_type() != ElementType::Collection
            || collection.collection_type() != Some(CollectionType::Physical)
        {
            return None;
        }
        let mut children = collection.children();
        if children.is_empty() {
            log::debug!("thumbstick collection has no child elements");
            return None;
        }

        // multiple stick instances share a usage through an ordinal
        // sub-collection; descend one level when present
        let mut ordinal = 0;
        if children.len() == 1 {
            let child = &children[0];
            if child.usage_page() != PAGE_ORDINAL
                || child.element_type() != ElementType::Collection
                || child.collection_type() != Some(CollectionType::Logical)
            {
                log::warn!("unexpected thumbstick sub-collection");
                return None;
            }
            ordinal = child.usage();
            children = child.children();
            if children.is_empty() {
                log::warn!("ordinal sub-collection has no child elements");
                return None;
            }
        }

        let Some(x) = find_element(
            &children,
            ElementType::InputMisc,
            PAGE_GENERIC_DESKTOP,
            USAGE_GD_X,
        ) else {
            log::warn!("missing x-axis element");
            return None;
        };
        let Some(y) = find_element(
            &children,
            ElementType::InputMisc,
            PAGE_GENERIC_DESKTOP,
            USAGE_GD_Y,
        ) else {
            log::warn!("missing y-axis element");
            return None;
        };
        if x.report_id() != y.report_id() {
            log::warn!(
                "x,y inputs do not share a report id ({}/{})",
                x.report_id(),
                y.report_id()
            );
            return None;
        }

        Some(Processor::new(
            x.report_id(),
            PAGE_GENERIC_DESKTOP,
            USAGE_GD_THUMBSTICK,
            ProcessorKind::Thumbstick(ThumbstickElements { x, y, ordinal }),
        ))
    }

    fn try_build_button(collection: &ElementRef, settings: &BuildSettings) -> Option<Processor> {
        if collection.usage_page() != PAGE_BUTTON {
            return None;
        }
        if collection.element_type() != ElementType::Collection
            || collection.collection_type() != Some(CollectionType::Physical)
        {
            return None;
        }
        let children = collection.children();
        if children.is_empty() {
            log::debug!("button collection has no child elements");
            return None;
        }

        let mut multi_bit = false;
        let input = if let Some(input) =
            find_element(&children, ElementType::InputButton, PAGE_BUTTON, 0)
        {
            // 1-bit digital element
            if input.report_size() != 1 {
                log::warn!(
                    "unexpected report size {} for button {}",
                    input.report_size(),
                    collection.usage()
                );
                return None;
            }
            if input.logical_min() != 0 || input.logical_max() != 1 {
                log::warn!("unexpected logical range for button {}", collection.usage());
                return None;
            }
            input
        } else {
            // multi-bit linear element with a normalized physical range
            let Some(input) = find_element(&children, ElementType::InputMisc, PAGE_BUTTON, 0)
            else {
                log::debug!("missing input element for button {}", collection.usage());
                return None;
            };
            if input.physical_min() != 0.0 || input.physical_max() != 1.0 {
                log::warn!(
                    "unexpected physical range for button {}",
                    collection.usage()
                );
                return None;
            }
            multi_bit = true;
            input
        };

        let mut processor = Processor::new(
            input.report_id(),
            PAGE_BUTTON,
            collection.usage(),
            ProcessorKind::Button(ButtonState {
                input,
                thresholds: settings.button,
                pressed: false,
            }),
        );
        processor.set_property(PROPERTY_MULTI_BIT, Value::Bool(multi_bit));
        Some(processor)
    }

    fn try_build_force(collection: &ElementRef, _settings: &BuildSettings) -> Option<Processor> {
        if collection.usage_page() != PAGE_SENSOR
            || collection.usage() != USAGE_SENSOR_MECHANICAL_FORCE
        {
            return None;
        }
        if collection.element_type() != ElementType::Collection
            || collection.collection_type() != Some(CollectionType::Physical)
        {
            return None;
        }
        let children = collection.children();
        if children.is_empty() {
            log::debug!("force collection has no child elements");
            return None;
        }

        let Some(force) = find_element(
            &children,
            ElementType::InputMisc,
            PAGE_SENSOR,
            USAGE_SENSOR_DATA_FORCE,
        ) else {
            log::warn!("missing force element");
            return None;
        };

        Some(Processor::new(
            force.report_id(),
            PAGE_SENSOR,
            USAGE_SENSOR_MECHANICAL_FORCE,
            ProcessorKind::Force(ForceElements { force }),
        ))
    }

    fn try_build_proximity(
        collection: &ElementRef,
        _settings: &BuildSettings,
    ) -> Option<Processor> {
        if collection.usage_page() != PAGE_SENSOR
            || collection.usage() != USAGE_SENSOR_HUMAN_PROXIMITY
        {
            return None;
        }
        if collection.element_type() != ElementType::Collection
            || collection.collection_type() != Some(CollectionType::Physical)
        {
            return None;
        }
        let children = collection.children();
        if children.is_empty() {
            log::debug!("proximity collection has no child elements");
            return None;
        }

        let Some(touch) = find_element(
            &children,
            ElementType::InputButton,
            PAGE_SENSOR,
            USAGE_SENSOR_DATA_TOUCH_STATE,
        ) else {
            log::debug!("missing touch element");
            return None;
        };
        // the analog range element is optional; without it the processor
        // reports touch only
        let range = find_element(
            &children,
            ElementType::InputMisc,
            PAGE_SENSOR,
            USAGE_SENSOR_DATA_PROXIMITY_RANGE,
        );
        if let Some(range) = &range {
            if touch.report_id() != range.report_id() {
                log::warn!(
                    "touch,prox inputs do not share a report id ({}/{})",
                    touch.report_id(),
                    range.report_id()
                );
                return None;
            }
        }

        let usage = if range.is_some() {
            USAGE_SENSOR_HUMAN_PROXIMITY
        } else {
            USAGE_SENSOR_HUMAN_TOUCH
        };
        Some(Processor::new(
            touch.report_id(),
            PAGE_SENSOR,
            usage,
            ProcessorKind::Proximity(ProximityElements { touch, range }),
        ))
    }

    fn try_build_led_constellation(
        collection: &ElementRef,
        _settings: &BuildSettings,
    ) -> Option<Processor> {
        if collection.usage_page() != PAGE_VENDOR_LED
            || collection.usage() != USAGE_VENDOR_LED_CONSTELLATION
        {
            return None;
        }
        if collection.element_type() != ElementType::Collection
            || collection.collection_type() != Some(CollectionType::Logical)
        {
            return None;
        }
        let children = collection.children();
        if children.is_empty() {
            log::debug!("constellation collection has no child elements");
            return None;
        }

        // mode selectors live in a usage-modifier sub-collection
        let Some(mode_collection) = find_element(
            &children,
            ElementType::Collection,
            PAGE_LED,
            USAGE_LED_MULTI_MODE_INDICATOR,
        ) else {
            log::warn!("missing mode selector collection");
            return None;
        };
        if mode_collection.collection_type() != Some(CollectionType::UsageModifier) {
            log::warn!(
                "unexpected collection type for mode: {:?}",
                mode_collection.collection_type()
            );
            return None;
        }
        let mode_children = mode_collection.children();
        if mode_children.is_empty() {
            log::warn!("missing mode selector elements");
            return None;
        }

        let Some(mode_on) = find_element(
            &mode_children,
            ElementType::Output,
            PAGE_LED,
            USAGE_LED_INDICATOR_ON,
        ) else {
            log::warn!("missing on mode element");
            return None;
        };
        let Some(mode_off) = find_element(
            &mode_children,
            ElementType::Output,
            PAGE_LED,
            USAGE_LED_INDICATOR_OFF,
        ) else {
            log::warn!("missing off mode element");
            return None;
        };
        let Some(mode_blink) = find_element(
            &mode_children,
            ElementType::Output,
            PAGE_LED,
            USAGE_LED_INDICATOR_FAST_BLINK,
        ) else {
            log::warn!("missing fast blink mode element");
            return None;
        };

        let intensity = find_element(&children, ElementType::Output, PAGE_LED, USAGE_LED_INTENSITY);
        let blink_on_time = find_element(
            &children,
            ElementType::Output,
            PAGE_LED,
            USAGE_LED_FAST_BLINK_ON_TIME,
        );
        let blink_off_time = find_element(
            &children,
            ElementType::Output,
            PAGE_LED,
            USAGE_LED_FAST_BLINK_OFF_TIME,
        );
        let timestamp = find_element(
            &children,
            ElementType::Output,
            PAGE_VENDOR_SENSOR,
            USAGE_VENDOR_TIMESYNC_TIMESTAMP,
        );
        let (Some(intensity), Some(blink_on_time), Some(blink_off_time), Some(timestamp)) =
            (intensity, blink_on_time, blink_off_time, timestamp)
        else {
            log::warn!("missing constellation output element");
            return None;
        };

        // the whole constellation is posted as one report
        let report_id = mode_on.report_id();
        for element in [&intensity, &blink_on_time, &blink_off_time, &timestamp] {
            if element.report_id() != report_id {
                log::warn!(
                    "constellation elements do not share a report id ({}/{})",
                    report_id,
                    element.report_id()
                );
                return None;
            }
        }

        Some(Processor::new(
            0,
            PAGE_VENDOR_LED,
            USAGE_VENDOR_LED_CONSTELLATION,
            ProcessorKind::LedConstellation(LedElements {
                mode_on,
                mode_off,
                mode_blink,
                intensity,
                blink_on_time,
                blink_off_time,
                timestamp,
            }),
        ))
    }
}

/// The full processor tree for one device, stored as an arena. Cookies are
/// dense indexes into the arena, assigned in insertion order and stable for
/// the tree's lifetime; the root lives at cookie 0.
#[derive(Debug)]
pub struct ProcessorTree {
    processors: Vec<Processor>,
    capabilities: Vec<&'static str>,
    led_elements: Option<LedElements>,
}

impl ProcessorTree {
    /// Build the processor tree for the given application collection.
    /// Returns `None` when the collection is not an application collection.
    pub fn build(root: &ElementRef, settings: &BuildSettings) -> Option<Self> {
        let mut tree = Self {
            processors: Vec::new(),
            capabilities: Vec::new(),
            led_elements: None,
        };
        tree.parse_collection(root, None, settings);
        if tree.processors.is_empty() {
            return None;
        }
        Some(tree)
    }

    /// Create processors for one collection, then recurse into its child
    /// collections with the newest processor as their parent. Collections
    /// that match nothing are pruned along with their subtrees.
    fn parse_collection(
        &mut self,
        collection: &ElementRef,
        parent: Option<u32>,
        settings: &BuildSettings,
    ) {
        let count = match parent {
            Some(parent) => self.create_processors(collection, parent, settings),
            None => self.create_root(collection),
        };
        if count == 0 {
            return;
        }
        let last = (self.processors.len() - 1) as u32;
        for element in collection.children() {
            if element.element_type() == ElementType::Collection {
                self.parse_collection(&element, Some(last), settings);
            }
        }
    }

    fn create_root(&mut self, collection: &ElementRef) -> usize {
        match Processor::try_build_root(collection) {
            Some(processor) => {
                self.insert(processor);
                1
            }
            None => 0,
        }
    }

    fn create_processors(
        &mut self,
        collection: &ElementRef,
        parent: u32,
        settings: &BuildSettings,
    ) -> usize {
        let mut count = 0;
        for builder in BUILDERS {
            let Some(processor) = builder(collection, settings) else {
                continue;
            };
            if let Some(capability) = processor.kind.capability() {
                if !self.capabilities.contains(&capability) {
                    self.capabilities.push(capability);
                }
            }
            if let ProcessorKind::LedConstellation(elements) = &processor.kind {
                self.led_elements = Some(elements.clone());
            }
            let cookie = self.insert(processor);
            self.processors[parent as usize].children.push(cookie);
            count += 1;
        }
        count
    }

    fn insert(&mut self, mut processor: Processor) -> u32 {
        let cookie = self.processors.len() as u32;
        processor.cookie = cookie;
        self.processors.push(processor);
        cookie
    }

    /// Run one input report through the tree. Children are visited first, in
    /// registration order; a node produces an event only when its own report
    /// ID matched or at least one child produced one, so reports that match
    /// nothing yield no output at all.
    pub fn process_input(&mut self, timestamp: u64, report_id: u8) -> Option<EventNode> {
        if self.processors.is_empty() {
            return None;
        }
        self.process_at(0, timestamp, report_id)
    }

    fn process_at(&mut self, index: u32, timestamp: u64, report_id: u8) -> Option<EventNode> {
        let children = self.processors[index as usize].children.clone();
        let mut child_events: Vec<EventNode> = Vec::new();
        for child in children {
            if let Some(event) = self.process_at(child, timestamp, report_id) {
                child_events.push(event);
            }
        }

        let processor = &mut self.processors[index as usize];
        if processor.matches_report(report_id) || !child_events.is_empty() {
            let mut event = processor.create_event(timestamp)?;
            for child_event in child_events {
                event.append_child(child_event);
            }
            return Some(event);
        }
        None
    }

    pub fn get(&self, cookie: u32) -> Option<&Processor> {
        self.processors.get(cookie as usize)
    }

    pub fn contains(&self, cookie: u32) -> bool {
        (cookie as usize) < self.processors.len()
    }

    /// Set a property on the processor with the given cookie. Returns false
    /// when the cookie is unknown.
    pub fn set_property(&mut self, cookie: u32, key: &str, value: Value) -> bool {
        match self.processors.get_mut(cookie as usize) {
            Some(processor) => {
                processor.set_property(key, value);
                true
            }
            None => false,
        }
    }

    /// Number of processors in the tree, including the root
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Capability flags recorded while building, in discovery order
    pub fn capabilities(&self) -> &[&'static str] {
        &self.capabilities
    }

    /// The LED constellation element set, when one was discovered
    pub fn led_elements(&self) -> Option<&LedElements> {
        self.led_elements.as_ref()
    }
}
