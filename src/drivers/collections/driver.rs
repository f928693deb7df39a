use thiserror::Error;

use serde_json::Value;

use crate::hid::element::ElementRef;
use crate::hid::{InputReport, ReportType};
use crate::input::event::EventNode;

use super::processor::{BuildSettings, LedElements, ProcessorTree};

/// One entry of a processor property batch: (cookie, key, value)
#[derive(Debug, Clone)]
pub struct ProcessorPropertyRequest {
    pub processor: u32,
    pub key: String,
    pub value: Value,
}

/// Possible errors applying a processor property batch
#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("unknown processor cookie: {0}")]
    UnknownProcessor(u32),
    #[error("malformed property request for key {0:?}")]
    MalformedRequest(String),
}

/// Driver decoding input reports for one device into event trees, using the
/// element processors discovered in the device's report descriptor.
#[derive(Debug)]
pub struct Driver {
    device_id: String,
    tree: ProcessorTree,
}

impl Driver {
    /// Build the driver for a device's application collection. Fails when
    /// the descriptor contains no recognized sensor or control collections;
    /// a tree with only a root would never produce output.
    pub fn new(
        device_id: String,
        root: &ElementRef,
        settings: &BuildSettings,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        log::debug!("Creating element processor driver for {device_id}");
        let Some(tree) = ProcessorTree::build(root, settings) else {
            return Err("Failed to create an element processor tree from the descriptor".into());
        };
        if tree.len() < 2 {
            return Err("Descriptor contains no recognized sensor or control collections".into());
        }
        log::debug!(
            "Created {} element processors for {device_id}: {:?}",
            tree.len(),
            tree.capabilities()
        );
        Ok(Self { device_id, tree })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Decode one report into an event tree. Only input reports are
    /// considered; reports that match nothing in the tree produce no output.
    pub fn handle_report(&mut self, report: &InputReport) -> Option<EventNode> {
        if report.report_type != ReportType::Input {
            return None;
        }
        self.tree.process_input(report.timestamp, report.report_id)
    }

    /// Apply a batch of processor property requests. The whole batch is
    /// validated before any request is applied, so a malformed entry can
    /// never leave a multi-property transaction half applied.
    pub fn set_processor_properties(
        &mut self,
        requests: &[ProcessorPropertyRequest],
    ) -> Result<(), PropertyError> {
        for request in requests {
            if request.value.is_null() || request.key.is_empty() {
                return Err(PropertyError::MalformedRequest(request.key.clone()));
            }
            if !self.tree.contains(request.processor) {
                return Err(PropertyError::UnknownProcessor(request.processor));
            }
        }
        for request in requests {
            self.tree
                .set_property(request.processor, &request.key, request.value.clone());
        }
        Ok(())
    }

    /// Read a property previously set on a processor
    pub fn processor_property(&self, cookie: u32, key: &str) -> Option<Value> {
        self.tree.get(cookie)?.property(key).cloned()
    }

    /// Capability flags discovered while building the tree
    pub fn capabilities(&self) -> &[&'static str] {
        self.tree.capabilities()
    }

    /// The LED constellation element set, when the descriptor has one
    pub fn led_elements(&self) -> Option<&LedElements> {
        self.tree.led_elements()
    }
}
