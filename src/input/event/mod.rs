//! Hierarchical, timestamped events produced by the element processors. Each
//! input report that decodes successfully yields one tree of [EventNode]s
//! mirroring the descriptor's collection topology.

/// Payload of an [EventNode]. The variant is the event's type; it is fixed at
/// creation and only individual fields may change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Pure grouping node mirroring a descriptor collection
    Collection { usage_page: u16, usage: u16 },
    /// One accelerometer sample in G's
    Accelerometer { x: f64, y: f64, z: f64 },
    /// One gyroscope sample in degrees per second
    Gyro { x: f64, y: f64, z: f64 },
    /// A button with analog pressure and post-hysteresis state
    Button {
        button: u16,
        pressure: f64,
        pressed: bool,
    },
    /// A proximity sensor reading
    Proximity { touched: bool, level: u32 },
    /// A multi-axis pointer position in the device's physical range
    MultiAxisPointer { x: f64, y: f64 },
    /// An opaque, usage-tagged data blob
    VendorDefined {
        usage_page: u16,
        usage: u16,
        version: u32,
        data: Vec<u8>,
    },
}

/// Discriminant of an [EventPayload], used for matching without binding the
/// payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Collection,
    Accelerometer,
    Gyro,
    Button,
    Proximity,
    MultiAxisPointer,
    VendorDefined,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Collection { .. } => EventKind::Collection,
            EventPayload::Accelerometer { .. } => EventKind::Accelerometer,
            EventPayload::Gyro { .. } => EventKind::Gyro,
            EventPayload::Button { .. } => EventKind::Button,
            EventPayload::Proximity { .. } => EventKind::Proximity,
            EventPayload::MultiAxisPointer { .. } => EventKind::MultiAxisPointer,
            EventPayload::VendorDefined { .. } => EventKind::VendorDefined,
        }
    }
}

/// One node of an event tree. Children are exclusively owned; dropping a node
/// drops its whole subtree. Child order is insertion order and is meaningful
/// to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct EventNode {
    timestamp: u64,
    options: u32,
    payload: EventPayload,
    children: Vec<EventNode>,
}

impl EventNode {
    /// Returns a new leaf event with the given payload
    pub fn new(timestamp: u64, payload: EventPayload) -> Self {
        Self {
            timestamp,
            options: 0,
            payload,
            children: Vec::new(),
        }
    }

    /// Returns a new grouping event with no intrinsic payload beyond its
    /// usage identity.
    pub fn collection(timestamp: u64, usage_page: u16, usage: u16) -> Self {
        Self::new(timestamp, EventPayload::Collection { usage_page, usage })
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn options(&self) -> u32 {
        self.options
    }

    pub fn set_options(&mut self, options: u32) {
        self.options = options;
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Update the post-hysteresis state of a button event. Does nothing for
    /// other event types.
    pub fn set_button_state(&mut self, state: bool) {
        if let EventPayload::Button { pressed, .. } = &mut self.payload {
            *pressed = state;
        }
    }

    /// Transfer ownership of `child` into this node's child list, preserving
    /// call order as iteration order.
    pub fn append_child(&mut self, child: EventNode) {
        self.children.push(child);
    }

    pub fn children(&self) -> &[EventNode] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns the first direct child of the given kind. For vendor-defined
    /// and collection children the usage page and usage must also match;
    /// passing 0 matches any value.
    pub fn find_child(&self, kind: EventKind, page: u16, usage: u16) -> Option<&EventNode> {
        self.children.iter().find(|child| {
            if child.kind() != kind {
                return false;
            }
            match child.payload() {
                EventPayload::VendorDefined {
                    usage_page: child_page,
                    usage: child_usage,
                    ..
                }
                | EventPayload::Collection {
                    usage_page: child_page,
                    usage: child_usage,
                } => (page == 0 || page == *child_page) && (usage == 0 || usage == *child_usage),
                _ => true,
            }
        })
    }
}
