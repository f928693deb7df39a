use std::sync::Arc;

use serde_json::json;

use crate::hid::element::{CollectionType, Element, ElementRef, ElementType};
use crate::hid::fake::FakeElement;
use crate::hid::{
    PAGE_BUTTON, PAGE_GENERIC_DESKTOP, PAGE_LED, PAGE_ORDINAL, PAGE_SENSOR, PAGE_VENDOR_LED,
    PAGE_VENDOR_SENSOR, UNIT_ACCELERATION, USAGE_GD_THUMBSTICK, USAGE_GD_X, USAGE_GD_Y,
    USAGE_LED_FAST_BLINK_OFF_TIME, USAGE_LED_FAST_BLINK_ON_TIME, USAGE_LED_INDICATOR_FAST_BLINK,
    USAGE_LED_INDICATOR_OFF, USAGE_LED_INDICATOR_ON, USAGE_LED_INTENSITY,
    USAGE_LED_MULTI_MODE_INDICATOR, USAGE_SENSOR_ACCELEROMETER_3D, USAGE_SENSOR_DATA_ACCEL_X,
    USAGE_SENSOR_DATA_ACCEL_Y, USAGE_SENSOR_DATA_ACCEL_Z, USAGE_SENSOR_DATA_PROXIMITY_RANGE,
    USAGE_SENSOR_DATA_TOUCH_STATE, USAGE_SENSOR_HUMAN_PROXIMITY, USAGE_SENSOR_HUMAN_TOUCH,
    USAGE_SENSOR_PROP_REPORT_INTERVAL, USAGE_VENDOR_LED_CONSTELLATION,
    USAGE_VENDOR_TIMESYNC_TIMESTAMP,
};
use crate::input::event::{EventKind, EventPayload};

use super::processor::{
    BuildSettings, ProcessorTree, PROPERTY_MULTI_BIT, PROPERTY_PRESS_THRESHOLD,
    PROPERTY_RELEASE_THRESHOLD, SUPPORTS_ACCEL_EVENTS, SUPPORTS_BUTTON_EVENTS,
    SUPPORTS_LED_CONSTELLATION,
};

/// Handles to the synthetic elements of one accelerometer physical collection
pub struct AccelFixture {
    pub collection: Arc<FakeElement>,
    pub x: Vec<Arc<FakeElement>>,
    pub y: Vec<Arc<FakeElement>>,
    pub z: Vec<Arc<FakeElement>>,
    pub ts: Vec<Arc<FakeElement>>,
    pub report_interval: Arc<FakeElement>,
}

/// Build an accelerometer collection carrying `samples` (X, Y, Z, timestamp)
/// tuples in one report.
pub fn accel_collection(report_id: u8, samples: usize) -> AccelFixture {
    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut z = Vec::new();
    let mut ts = Vec::new();
    let mut children: Vec<ElementRef> = Vec::new();
    for _ in 0..samples {
        let sample_x = FakeElement::new(
            ElementType::InputMisc,
            PAGE_SENSOR,
            USAGE_SENSOR_DATA_ACCEL_X,
        )
        .with_report_id(report_id)
        .build();
        let sample_y = FakeElement::new(
            ElementType::InputMisc,
            PAGE_SENSOR,
            USAGE_SENSOR_DATA_ACCEL_Y,
        )
        .with_report_id(report_id)
        .build();
        let sample_z = FakeElement::new(
            ElementType::InputMisc,
            PAGE_SENSOR,
            USAGE_SENSOR_DATA_ACCEL_Z,
        )
        .with_report_id(report_id)
        .build();
        let sample_ts = FakeElement::new(
            ElementType::InputMisc,
            PAGE_VENDOR_SENSOR,
            USAGE_VENDOR_TIMESYNC_TIMESTAMP,
        )
        .with_report_id(report_id)
        .build();
        children.push(sample_x.clone());
        children.push(sample_y.clone());
        children.push(sample_z.clone());
        children.push(sample_ts.clone());
        x.push(sample_x);
        y.push(sample_y);
        z.push(sample_z);
        ts.push(sample_ts);
    }
    let report_interval = FakeElement::new(
        ElementType::Feature,
        PAGE_SENSOR,
        USAGE_SENSOR_PROP_REPORT_INTERVAL,
    )
    .build();
    children.push(report_interval.clone());

    let collection = FakeElement::collection(
        CollectionType::Physical,
        PAGE_SENSOR,
        USAGE_SENSOR_ACCELEROMETER_3D,
        children,
    );
    AccelFixture {
        collection,
        x,
        y,
        z,
        ts,
        report_interval,
    }
}

/// Handles to the synthetic elements of one button physical collection
pub struct ButtonFixture {
    pub collection: Arc<FakeElement>,
    pub input: Arc<FakeElement>,
}

/// A 1-bit digital button collection
pub fn digital_button_collection(report_id: u8, usage: u16) -> ButtonFixture {
    let input = FakeElement::new(ElementType::InputButton, PAGE_BUTTON, usage)
        .with_report_id(report_id)
        .with_report_size(1)
        .with_logical_range(0, 1)
        .with_physical_range(0.0, 1.0)
        .build();
    let collection = FakeElement::collection(
        CollectionType::Physical,
        PAGE_BUTTON,
        usage,
        vec![input.clone()],
    );
    ButtonFixture { collection, input }
}

/// A multi-bit analog button collection with physical range [0, 1]
pub fn analog_button_collection(report_id: u8, usage: u16) -> ButtonFixture {
    let input = FakeElement::new(ElementType::InputMisc, PAGE_BUTTON, usage)
        .with_report_id(report_id)
        .with_report_size(8)
        .with_physical_range(0.0, 1.0)
        .build();
    let collection = FakeElement::collection(
        CollectionType::Physical,
        PAGE_BUTTON,
        usage,
        vec![input.clone()],
    );
    ButtonFixture { collection, input }
}

/// Handles to the synthetic elements of one LED constellation collection
pub struct LedFixture {
    pub collection: Arc<FakeElement>,
    pub mode_on: Arc<FakeElement>,
    pub mode_off: Arc<FakeElement>,
    pub mode_blink: Arc<FakeElement>,
    pub intensity: Arc<FakeElement>,
    pub blink_on_time: Arc<FakeElement>,
    pub blink_off_time: Arc<FakeElement>,
    pub ts: Arc<FakeElement>,
}

pub fn led_collection(report_id: u8) -> LedFixture {
    let mode_on = FakeElement::new(ElementType::Output, PAGE_LED, USAGE_LED_INDICATOR_ON)
        .with_report_id(report_id)
        .with_report_size(1)
        .build();
    let mode_off = FakeElement::new(ElementType::Output, PAGE_LED, USAGE_LED_INDICATOR_OFF)
        .with_report_id(report_id)
        .with_report_size(1)
        .build();
    let mode_blink = FakeElement::new(
        ElementType::Output,
        PAGE_LED,
        USAGE_LED_INDICATOR_FAST_BLINK,
    )
    .with_report_id(report_id)
    .with_report_size(1)
    .build();
    let modes = FakeElement::collection(
        CollectionType::UsageModifier,
        PAGE_LED,
        USAGE_LED_MULTI_MODE_INDICATOR,
        vec![mode_on.clone(), mode_off.clone(), mode_blink.clone()],
    );
    let intensity = FakeElement::new(ElementType::Output, PAGE_LED, USAGE_LED_INTENSITY)
        .with_report_id(report_id)
        .with_report_size(8)
        .build();
    let blink_on_time =
        FakeElement::new(ElementType::Output, PAGE_LED, USAGE_LED_FAST_BLINK_ON_TIME)
            .with_report_id(report_id)
            .with_report_size(16)
            .build();
    let blink_off_time = FakeElement::new(
        ElementType::Output,
        PAGE_LED,
        USAGE_LED_FAST_BLINK_OFF_TIME,
    )
    .with_report_id(report_id)
    .with_report_size(16)
    .build();
    let ts = FakeElement::new(
        ElementType::Output,
        PAGE_VENDOR_SENSOR,
        USAGE_VENDOR_TIMESYNC_TIMESTAMP,
    )
    .with_report_id(report_id)
    .build();
    let collection = FakeElement::collection(
        CollectionType::Logical,
        PAGE_VENDOR_LED,
        USAGE_VENDOR_LED_CONSTELLATION,
        vec![
            modes,
            intensity.clone(),
            blink_on_time.clone(),
            blink_off_time.clone(),
            ts.clone(),
        ],
    );
    LedFixture {
        collection,
        mode_on,
        mode_off,
        mode_blink,
        intensity,
        blink_on_time,
        blink_off_time,
        ts,
    }
}

/// An application collection grouping the given child collections
pub fn application_collection(children: Vec<ElementRef>) -> ElementRef {
    FakeElement::collection(CollectionType::Application, PAGE_SENSOR, 0x01, children)
}

#[test]
fn test_end_to_end_report() {
    let accel = accel_collection(5, 1);
    accel.x[0].set_scaled_exponent(0.1);
    accel.y[0].set_scaled_exponent(0.2);
    accel.z[0].set_scaled_exponent(0.3);
    accel.ts[0].set_data(vec![1, 2, 3, 4, 5, 6, 7, 8]);
    let button = digital_button_collection(5, 0x01);
    button.input.set_scaled_physical(1.0);

    let root = application_collection(vec![accel.collection.clone(), button.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();
    assert_eq!(tree.len(), 3);

    let event = tree.process_input(1000, 5).unwrap();
    assert_eq!(event.kind(), EventKind::Collection);
    assert_eq!(event.timestamp(), 1000);
    assert_eq!(event.children().len(), 2);

    // first child: the accelerometer collection with one per-sample sub-event
    let accel_event = &event.children()[0];
    assert_eq!(
        *accel_event.payload(),
        EventPayload::Collection {
            usage_page: PAGE_SENSOR,
            usage: USAGE_SENSOR_ACCELEROMETER_3D
        }
    );
    assert_eq!(accel_event.children().len(), 1);
    let sample = &accel_event.children()[0];
    assert_eq!(
        *sample.payload(),
        EventPayload::Accelerometer {
            x: 0.1,
            y: 0.2,
            z: 0.3
        }
    );
    // the sample nests the raw, unconverted timestamp bytes
    let ts_child = sample
        .find_child(
            EventKind::VendorDefined,
            PAGE_VENDOR_SENSOR,
            USAGE_VENDOR_TIMESYNC_TIMESTAMP,
        )
        .unwrap();
    let EventPayload::VendorDefined { data, .. } = ts_child.payload() else {
        panic!("expected vendor-defined child");
    };
    assert_eq!(data, &vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // second child: the button event with the digital press state
    let button_event = &event.children()[1];
    let EventPayload::Button {
        pressure, pressed, ..
    } = button_event.payload()
    else {
        panic!("expected button event");
    };
    assert_eq!(*pressure, 1.0);
    assert!(pressed);
}

#[test]
fn test_no_output_without_report_match() {
    let accel = accel_collection(5, 1);
    let button = digital_button_collection(7, 0x01);
    let root = application_collection(vec![accel.collection.clone(), button.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    // no configured report ID matches anything in the subtree
    assert!(tree.process_input(1000, 9).is_none());

    // a partial match only activates the matching branch
    let event = tree.process_input(1000, 7).unwrap();
    assert_eq!(event.children().len(), 1);
    assert_eq!(event.children()[0].kind(), EventKind::Button);
}

#[test]
fn test_tree_shape_determinism() {
    let accel = accel_collection(5, 2);
    let button = digital_button_collection(5, 0x01);
    let root = application_collection(vec![accel.collection.clone(), button.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    let first = tree.process_input(42, 5).unwrap();
    let second = tree.process_input(42, 5).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_button_hysteresis() {
    let button = analog_button_collection(3, 0x02);
    let root = application_collection(vec![button.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    let pressed_at = |tree: &mut ProcessorTree, pressure: f64| {
        button.input.set_scaled_physical(pressure);
        let event = tree.process_input(0, 3).unwrap();
        let EventPayload::Button { pressed, .. } = event.children()[0].payload() else {
            panic!("expected button event");
        };
        *pressed
    };

    // crossing the press threshold transitions exactly once
    assert!(!pressed_at(&mut tree, 0.3));
    assert!(pressed_at(&mut tree, 0.6));
    // oscillating inside the dead-band never toggles
    assert!(pressed_at(&mut tree, 0.45));
    assert!(pressed_at(&mut tree, 0.49));
    assert!(pressed_at(&mut tree, 0.41));
    // dropping below the release threshold releases
    assert!(!pressed_at(&mut tree, 0.39));
    // and stays released inside the dead-band
    assert!(!pressed_at(&mut tree, 0.45));
}

#[test]
fn test_button_multi_bit_property() {
    let digital = digital_button_collection(3, 0x01);
    let analog = analog_button_collection(4, 0x02);
    let root =
        application_collection(vec![digital.collection.clone(), analog.collection.clone()]);
    let tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    assert_eq!(
        tree.get(1).unwrap().property(PROPERTY_MULTI_BIT),
        Some(&json!(false))
    );
    assert_eq!(
        tree.get(2).unwrap().property(PROPERTY_MULTI_BIT),
        Some(&json!(true))
    );
}

#[test]
fn test_threshold_constraint_rejected() {
    let button = analog_button_collection(3, 0x01);
    let root = application_collection(vec![button.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    // a release threshold above the press threshold is rejected and the
    // prior value retained
    tree.set_property(1, PROPERTY_RELEASE_THRESHOLD, json!(0.9));
    assert!(tree.get(1).unwrap().property(PROPERTY_RELEASE_THRESHOLD).is_none());

    // valid updates apply
    tree.set_property(1, PROPERTY_PRESS_THRESHOLD, json!(0.8));
    tree.set_property(1, PROPERTY_RELEASE_THRESHOLD, json!(0.7));
    assert_eq!(
        tree.get(1).unwrap().property(PROPERTY_PRESS_THRESHOLD),
        Some(&json!(0.8))
    );
    assert_eq!(
        tree.get(1).unwrap().property(PROPERTY_RELEASE_THRESHOLD),
        Some(&json!(0.7))
    );

    // out-of-range values are rejected
    tree.set_property(1, PROPERTY_PRESS_THRESHOLD, json!(1.5));
    assert_eq!(
        tree.get(1).unwrap().property(PROPERTY_PRESS_THRESHOLD),
        Some(&json!(0.8))
    );
}

#[test]
fn test_accel_unit_conversion() {
    let accel = accel_collection(5, 1);
    accel.x[0].set_scaled_exponent(1.0);
    accel.y[0].set_scaled_exponent(1.0);
    accel.z[0].set_scaled_exponent(1.0);
    let root = application_collection(vec![accel.collection.clone()]);

    // without the acceleration unit tag, values pass through unscaled
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();
    let event = tree.process_input(0, 5).unwrap();
    let EventPayload::Accelerometer { x, .. } = event.children()[0].children()[0].payload() else {
        panic!("expected accelerometer sample");
    };
    assert_eq!(*x, 1.0);

    // tagged values are converted to G's and divide back out within tolerance
    let x = FakeElement::new(
        ElementType::InputMisc,
        PAGE_SENSOR,
        USAGE_SENSOR_DATA_ACCEL_X,
    )
    .with_report_id(5)
    .with_unit(UNIT_ACCELERATION)
    .build();
    x.set_scaled_exponent(1.0);
    let y = FakeElement::new(
        ElementType::InputMisc,
        PAGE_SENSOR,
        USAGE_SENSOR_DATA_ACCEL_Y,
    )
    .with_report_id(5)
    .build();
    let z = FakeElement::new(
        ElementType::InputMisc,
        PAGE_SENSOR,
        USAGE_SENSOR_DATA_ACCEL_Z,
    )
    .with_report_id(5)
    .build();
    let ts = FakeElement::new(
        ElementType::InputMisc,
        PAGE_VENDOR_SENSOR,
        USAGE_VENDOR_TIMESYNC_TIMESTAMP,
    )
    .with_report_id(5)
    .build();
    let interval = FakeElement::new(
        ElementType::Feature,
        PAGE_SENSOR,
        USAGE_SENSOR_PROP_REPORT_INTERVAL,
    )
    .build();
    let collection = FakeElement::collection(
        CollectionType::Physical,
        PAGE_SENSOR,
        USAGE_SENSOR_ACCELEROMETER_3D,
        vec![x.clone(), y, z, ts, interval],
    );
    let root = application_collection(vec![collection]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();
    let event = tree.process_input(0, 5).unwrap();
    let EventPayload::Accelerometer { x: converted, .. } =
        event.children()[0].children()[0].payload()
    else {
        panic!("expected accelerometer sample");
    };
    assert!((converted - 9.81).abs() < 1e-9);
    assert!((converted / 9.81 - 1.0).abs() < 1e-9);
}

#[test]
fn test_multi_sample_batching() {
    let accel = accel_collection(5, 3);
    for (i, x) in accel.x.iter().enumerate() {
        x.set_scaled_exponent(i as f64);
    }
    let root = application_collection(vec![accel.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    let event = tree.process_input(0, 5).unwrap();
    let samples = event.children()[0].children();
    assert_eq!(samples.len(), 3);
    for (i, sample) in samples.iter().enumerate() {
        let EventPayload::Accelerometer { x, .. } = sample.payload() else {
            panic!("expected accelerometer sample");
        };
        assert_eq!(*x, i as f64);
    }
}

#[test]
fn test_sensor_interval_write_through() {
    let accel = accel_collection(5, 1);
    let root = application_collection(vec![accel.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    tree.set_property(1, super::processor::PROPERTY_REPORT_INTERVAL, json!(20000));
    assert_eq!(accel.report_interval.staged(), 20000u32.to_le_bytes());
}

#[test]
fn test_thumbstick_ordinal() {
    let x = FakeElement::new(ElementType::InputMisc, PAGE_GENERIC_DESKTOP, USAGE_GD_X)
        .with_report_id(2)
        .build();
    let y = FakeElement::new(ElementType::InputMisc, PAGE_GENERIC_DESKTOP, USAGE_GD_Y)
        .with_report_id(2)
        .build();
    x.set_scaled_physical(0.25);
    y.set_scaled_physical(-0.5);
    let ordinal = FakeElement::collection(
        CollectionType::Logical,
        PAGE_ORDINAL,
        2,
        vec![x.clone(), y.clone()],
    );
    let stick = FakeElement::collection(
        CollectionType::Physical,
        PAGE_GENERIC_DESKTOP,
        USAGE_GD_THUMBSTICK,
        vec![ordinal],
    );
    let root = application_collection(vec![stick]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    let event = tree.process_input(0, 2).unwrap();
    let stick_event = &event.children()[0];
    assert_eq!(
        *stick_event.payload(),
        EventPayload::MultiAxisPointer { x: 0.25, y: -0.5 }
    );
    // the ordinal rides along as a zero-length vendor-defined marker
    let marker = stick_event
        .find_child(EventKind::VendorDefined, PAGE_ORDINAL, 2)
        .unwrap();
    let EventPayload::VendorDefined { data, .. } = marker.payload() else {
        panic!("expected vendor-defined marker");
    };
    assert!(data.is_empty());
}

#[test]
fn test_proximity_range_fallback() {
    let touch = FakeElement::new(
        ElementType::InputButton,
        PAGE_SENSOR,
        USAGE_SENSOR_DATA_TOUCH_STATE,
    )
    .with_report_id(6)
    .build();
    touch.set_value(1);

    // without the analog range element the processor still builds, with its
    // usage falling back to the touch identity
    let touch_only = FakeElement::collection(
        CollectionType::Physical,
        PAGE_SENSOR,
        USAGE_SENSOR_HUMAN_PROXIMITY,
        vec![touch.clone()],
    );
    let root = application_collection(vec![touch_only]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();
    assert_eq!(tree.get(1).unwrap().usage(), USAGE_SENSOR_HUMAN_TOUCH);
    let event = tree.process_input(0, 6).unwrap();
    assert_eq!(
        *event.children()[0].payload(),
        EventPayload::Proximity {
            touched: true,
            level: 0
        }
    );

    // with the range element present the level is reported
    let range = FakeElement::new(
        ElementType::InputMisc,
        PAGE_SENSOR,
        USAGE_SENSOR_DATA_PROXIMITY_RANGE,
    )
    .with_report_id(6)
    .build();
    range.set_value(42);
    let full = FakeElement::collection(
        CollectionType::Physical,
        PAGE_SENSOR,
        USAGE_SENSOR_HUMAN_PROXIMITY,
        vec![touch.clone(), range],
    );
    let root = application_collection(vec![full]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();
    assert_eq!(tree.get(1).unwrap().usage(), USAGE_SENSOR_HUMAN_PROXIMITY);
    let event = tree.process_input(0, 6).unwrap();
    assert_eq!(
        *event.children()[0].payload(),
        EventPayload::Proximity {
            touched: true,
            level: 42
        }
    );
}

#[test]
fn test_led_constellation_builds_without_events() {
    let led = led_collection(9);
    let root = application_collection(vec![led.collection.clone()]);
    let mut tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    assert_eq!(tree.len(), 2);
    assert!(tree.capabilities().contains(&SUPPORTS_LED_CONSTELLATION));
    let elements = tree.led_elements().unwrap();
    assert_eq!(elements.mode_on.cookie(), led.mode_on.cookie());
    assert_eq!(elements.timestamp.cookie(), led.ts.cookie());

    // the constellation never produces input events, even for its report ID
    assert!(tree.process_input(0, 9).is_none());
}

#[test]
fn test_build_requires_application_collection() {
    let accel = accel_collection(5, 1);
    // a physical collection cannot be the root
    let root: ElementRef = accel.collection.clone();
    assert!(ProcessorTree::build(&root, &BuildSettings::default()).is_none());
}

#[test]
fn test_capability_flags() {
    let accel = accel_collection(5, 1);
    let button = digital_button_collection(5, 0x01);
    let root = application_collection(vec![accel.collection.clone(), button.collection.clone()]);
    let tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();

    assert_eq!(
        tree.capabilities(),
        &[SUPPORTS_ACCEL_EVENTS, SUPPORTS_BUTTON_EVENTS]
    );
}

#[test]
fn test_unrecognized_collections_skipped() {
    // a collection no variant recognizes contributes nothing
    let mystery = FakeElement::collection(CollectionType::Physical, 0xFF17, 0x01, vec![]);
    let accel = accel_collection(5, 1);
    let root = application_collection(vec![mystery, accel.collection.clone()]);
    let tree = ProcessorTree::build(&root, &BuildSettings::default()).unwrap();
    assert_eq!(tree.len(), 2);
}
