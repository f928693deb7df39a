//! Synthetic elements for building descriptor fixtures in tests.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use super::element::{
    CollectionType, Element, ElementError, ElementRef, ElementType, OutputPoster, ScaleKind,
};

static NEXT_COOKIE: AtomicU32 = AtomicU32::new(1);

/// An in-memory [Element] whose values can be changed between reports
#[derive(Debug)]
pub struct FakeElement {
    page: u16,
    usage: u16,
    element_type: ElementType,
    collection_type: Option<CollectionType>,
    report_id: u8,
    report_size: u32,
    unit: u32,
    logical: (i64, i64),
    physical: (f64, f64),
    cookie: u32,
    value: Mutex<i64>,
    scaled_exponent: Mutex<f64>,
    scaled_physical: Mutex<f64>,
    data: Mutex<Vec<u8>>,
    staged: Mutex<Vec<u8>>,
    children: Mutex<Vec<ElementRef>>,
}

impl FakeElement {
    pub fn new(element_type: ElementType, page: u16, usage: u16) -> Self {
        Self {
            page,
            usage,
            element_type,
            collection_type: None,
            report_id: 0,
            report_size: 8,
            unit: 0,
            logical: (0, 255),
            physical: (0.0, 255.0),
            cookie: NEXT_COOKIE.fetch_add(1, Ordering::Relaxed),
            value: Mutex::new(0),
            scaled_exponent: Mutex::new(0.0),
            scaled_physical: Mutex::new(0.0),
            data: Mutex::new(Vec::new()),
            staged: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        }
    }

    /// A collection element with the given kind and children
    pub fn collection(
        kind: CollectionType,
        page: u16,
        usage: u16,
        children: Vec<ElementRef>,
    ) -> Arc<Self> {
        let element = Self::new(ElementType::Collection, page, usage)
            .with_collection_type(kind)
            .build();
        *element.children.lock().unwrap() = children;
        element
    }

    pub fn with_collection_type(mut self, kind: CollectionType) -> Self {
        self.collection_type = Some(kind);
        self
    }

    pub fn with_report_id(mut self, report_id: u8) -> Self {
        self.report_id = report_id;
        self
    }

    pub fn with_report_size(mut self, bits: u32) -> Self {
        self.report_size = bits;
        self
    }

    pub fn with_unit(mut self, unit: u32) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_logical_range(mut self, min: i64, max: i64) -> Self {
        self.logical = (min, max);
        self
    }

    pub fn with_physical_range(mut self, min: f64, max: f64) -> Self {
        self.physical = (min, max);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_value(&self, value: i64) {
        *self.value.lock().unwrap() = value;
    }

    pub fn set_scaled_exponent(&self, value: f64) {
        *self.scaled_exponent.lock().unwrap() = value;
    }

    pub fn set_scaled_physical(&self, value: f64) {
        *self.scaled_physical.lock().unwrap() = value;
    }

    pub fn set_data(&self, data: Vec<u8>) {
        *self.data.lock().unwrap() = data;
    }

    /// Bytes staged by the most recent [Element::set_data_bits] call
    pub fn staged(&self) -> Vec<u8> {
        self.staged.lock().unwrap().clone()
    }
}

impl Element for FakeElement {
    fn usage_page(&self) -> u16 {
        self.page
    }

    fn usage(&self) -> u16 {
        self.usage
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn collection_type(&self) -> Option<CollectionType> {
        self.collection_type
    }

    fn report_id(&self) -> u8 {
        self.report_id
    }

    fn report_size(&self) -> u32 {
        self.report_size
    }

    fn unit(&self) -> u32 {
        self.unit
    }

    fn logical_min(&self) -> i64 {
        self.logical.0
    }

    fn logical_max(&self) -> i64 {
        self.logical.1
    }

    fn physical_min(&self) -> f64 {
        self.physical.0
    }

    fn physical_max(&self) -> f64 {
        self.physical.1
    }

    fn scaled_value(&self, scale: ScaleKind) -> f64 {
        match scale {
            ScaleKind::Exponent => *self.scaled_exponent.lock().unwrap(),
            ScaleKind::Physical => *self.scaled_physical.lock().unwrap(),
        }
    }

    fn value(&self) -> i64 {
        *self.value.lock().unwrap()
    }

    fn data_value(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    fn set_data_bits(&self, data: &[u8]) -> Result<(), ElementError> {
        *self.staged.lock().unwrap() = data.to_vec();
        Ok(())
    }

    fn cookie(&self) -> u32 {
        self.cookie
    }

    fn children(&self) -> Vec<ElementRef> {
        self.children.lock().unwrap().clone()
    }
}

/// An [OutputPoster] that records every posted cookie set
#[derive(Debug, Default)]
pub struct FakePoster {
    posts: Mutex<Vec<Vec<u32>>>,
}

impl FakePoster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn posts(&self) -> Vec<Vec<u32>> {
        self.posts.lock().unwrap().clone()
    }
}

impl OutputPoster for FakePoster {
    fn post_element_values(&self, cookies: &[u32]) -> Result<(), ElementError> {
        self.posts.lock().unwrap().push(cookies.to_vec());
        Ok(())
    }
}
