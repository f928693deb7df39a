use std::{fmt::Debug, sync::Arc};

use thiserror::Error;

/// Possible errors when reading or writing an element
#[derive(Debug, Error)]
pub enum ElementError {
    #[error("value does not fit the element's report field")]
    ValueSize,
    #[error("element is not writable")]
    NotWritable,
    #[error("device is no longer available")]
    Offline,
    #[error("transport error: {0}")]
    Transport(String),
}

/// How a raw element value is scaled when read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    /// Calibrated scientific units using the element's unit exponent
    Exponent,
    /// The element's declared physical range
    Physical,
}

/// The role of an element within a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    InputMisc,
    InputButton,
    Output,
    Feature,
    Collection,
}

/// The kind of a collection element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    Application,
    Physical,
    Logical,
    UsageModifier,
}

/// Typed access to one field of a device report, backed by the transport
/// layer's descriptor parser. Value reads reflect the most recently received
/// report; writes stage data bits until they are posted as an outbound report.
pub trait Element: Send + Sync + Debug {
    fn usage_page(&self) -> u16;
    fn usage(&self) -> u16;
    fn element_type(&self) -> ElementType;
    /// Collection kind, for collection elements only
    fn collection_type(&self) -> Option<CollectionType> {
        None
    }
    fn report_id(&self) -> u8;
    /// Width of the element's report field in bits
    fn report_size(&self) -> u32;
    /// HID unit code declared by the element, 0 when unitless
    fn unit(&self) -> u32 {
        0
    }
    fn logical_min(&self) -> i64;
    fn logical_max(&self) -> i64;
    fn physical_min(&self) -> f64;
    fn physical_max(&self) -> f64;
    /// Current value scaled according to the given [ScaleKind]
    fn scaled_value(&self, scale: ScaleKind) -> f64;
    /// Current raw logical value
    fn value(&self) -> i64;
    /// Raw bytes backing the element in the most recent report
    fn data_value(&self) -> Vec<u8>;
    /// Stage raw bytes to be written with the next outbound report
    fn set_data_bits(&self, data: &[u8]) -> Result<(), ElementError>;
    /// Positional cookie assigned by the descriptor parser
    fn cookie(&self) -> u32;
    /// Child elements, for collection elements only
    fn children(&self) -> Vec<ElementRef> {
        Vec::new()
    }
}

/// Shared handle to an element of the descriptor's element tree
pub type ElementRef = Arc<dyn Element>;

/// Posts staged element values to the device as outbound reports
pub trait OutputPoster: Send + Sync {
    /// Flush the staged data bits of the given elements to the device as a
    /// single outbound report.
    fn post_element_values(&self, cookies: &[u32]) -> Result<(), ElementError>;
}

/// Find the first element with the given type, usage page, and usage. Usage 0
/// matches any usage.
pub fn find_element(
    elements: &[ElementRef],
    element_type: ElementType,
    page: u16,
    usage: u16,
) -> Option<ElementRef> {
    elements
        .iter()
        .find(|element| {
            element.element_type() == element_type
                && element.usage_page() == page
                && (usage == 0 || element.usage() == usage)
        })
        .cloned()
}
