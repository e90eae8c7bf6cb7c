//! Device controls (brightness, gain, exposure, ...) and their value cache.
//!
//! All writes go through [`ControlRegistry::set`], which re-reads the value
//! the driver settled on, so the cache never silently diverges from the
//! device.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::traits::VideoDevice;

/// Value type of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// On/off switch, values 0 and 1.
    Boolean,
    /// Integer within `minimum..=maximum` in steps.
    Integer,
    /// Index into a driver-defined menu.
    Menu,
    /// Buttons, strings and compound controls; not cached.
    Other,
}

/// A control as described by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Control id.
    pub id: u32,
    /// Driver supplied name.
    pub name: String,
    /// Value type.
    pub kind: ControlKind,
    /// Smallest value.
    pub minimum: i64,
    /// Largest value.
    pub maximum: i64,
    /// Increment from `minimum`; 0 is treated as 1.
    pub step: u64,
    /// Value after reset.
    pub default: i64,
    /// Whether the driver marks the control as disabled.
    pub disabled: bool,
}

impl ControlDescriptor {
    /// Check `value` against kind, range and step.
    pub fn validate(&self, value: i64) -> Result<()> {
        let in_range = match self.kind {
            ControlKind::Boolean => value == 0 || value == 1,
            ControlKind::Integer => {
                let step = i128::from(self.step.max(1));
                value >= self.minimum
                    && value <= self.maximum
                    && (i128::from(value) - i128::from(self.minimum)) % step == 0
            }
            ControlKind::Menu | ControlKind::Other => {
                value >= self.minimum && value <= self.maximum
            }
        };
        if in_range {
            Ok(())
        } else {
            Err(CaptureError::ControlOutOfRange {
                id: self.id,
                value,
                minimum: self.minimum,
                maximum: self.maximum,
                step: self.step,
            })
        }
    }
}

/// A cached control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// Static description.
    pub descriptor: ControlDescriptor,
    current: Option<i64>,
}

impl Control {
    /// Cached current value, if known.
    #[must_use]
    pub const fn cached(&self) -> Option<i64> {
        self.current
    }
}

/// Controls discovered on the device, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ControlRegistry {
    controls: BTreeMap<u32, Control>,
}

impl ControlRegistry {
    /// Enumerate the device's controls and read their current values.
    ///
    /// Best effort: a device without controls, or one that fails to list
    /// them, yields an empty registry.
    pub fn probe<D: VideoDevice>(device: &mut D) -> Self {
        let descriptors = match device.query_controls() {
            Ok(descriptors) => descriptors,
            Err(err) => {
                warn!(error = %err, "control enumeration failed; continuing without controls");
                return Self::default();
            }
        };

        let mut controls = BTreeMap::new();
        for descriptor in descriptors {
            if descriptor.disabled || descriptor.kind == ControlKind::Other {
                debug!(id = descriptor.id, name = %descriptor.name, "skipping control");
                continue;
            }
            let current = match device.control(descriptor.id) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!(id = descriptor.id, error = %err, "control not readable");
                    None
                }
            };
            debug!(id = descriptor.id, name = %descriptor.name, ?current, "found control");
            controls.insert(descriptor.id, Control { descriptor, current });
        }
        Self { controls }
    }

    /// Number of cached controls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// Whether no controls were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Controls ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Control> {
        self.controls.values()
    }

    /// Look a control up by id.
    #[must_use]
    pub fn find(&self, id: u32) -> Option<&Control> {
        self.controls.get(&id)
    }

    /// Look a control up by its driver name, ignoring case.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Control> {
        self.controls
            .values()
            .find(|control| control.descriptor.name.eq_ignore_ascii_case(name))
    }

    /// Current value of a control, read from the device on a cache miss.
    pub fn get<D: VideoDevice>(&mut self, device: &mut D, id: u32) -> Result<i64> {
        let control = self
            .controls
            .get_mut(&id)
            .ok_or(CaptureError::UnknownControl(id))?;
        if let Some(value) = control.current {
            return Ok(value);
        }
        let value = device
            .control(id)
            .map_err(|err| CaptureError::device("VIDIOC_G_CTRL", err))?;
        control.current = Some(value);
        Ok(value)
    }

    /// Write a control and return the value the device settled on.
    pub fn set<D: VideoDevice>(&mut self, device: &mut D, id: u32, value: i64) -> Result<i64> {
        let control = self
            .controls
            .get_mut(&id)
            .ok_or(CaptureError::UnknownControl(id))?;
        control.descriptor.validate(value)?;

        control.current = None;
        device
            .set_control(id, value)
            .map_err(|err| CaptureError::device("VIDIOC_S_CTRL", err))?;

        // Drivers may clamp or round; trust the read-back.
        match device.control(id) {
            Ok(actual) => {
                control.current = Some(actual);
                debug!(id, requested = value, actual, "control set");
                Ok(actual)
            }
            Err(err) => {
                debug!(id, error = %err, "control read-back failed; cache left empty");
                Ok(value)
            }
        }
    }

    /// Drop the cached value of one control.
    pub fn invalidate(&mut self, id: u32) {
        if let Some(control) = self.controls.get_mut(&id) {
            control.current = None;
        }
    }

    /// Drop every cached value, e.g. after a format change.
    pub fn invalidate_all(&mut self) {
        for control in self.controls.values_mut() {
            control.current = None;
        }
    }
}
