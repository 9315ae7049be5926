/// Input device catalog
///
/// Lists the capture devices of the default host so the operator can pick
/// one by index. Indices are positions in the host's input device
/// enumeration and are what `CaptureConfig::device_index` expects.

use crate::audio_source::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;
use std::fmt;

/// One capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub default_sample_rate: Option<u32>,
    pub max_input_channels: u16,
    pub is_default: bool,
}

impl fmt::Display for InputDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index: {}, name: '{}', ", self.index, self.name)?;

        match self.default_sample_rate {
            Some(rate) => write!(f, "default sample rate: {} Hz, ", rate)?,
            None => write!(f, "default sample rate: unknown, ")?,
        }

        write!(f, "max input channels: {}", self.max_input_channels)?;

        if self.is_default {
            write!(f, " (default)")?;
        }

        Ok(())
    }
}

/// Enumerate input devices of the default host
pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>, DeviceError> {
    list_host_input_devices(&cpal::default_host())
}

/// Enumerate input devices of `host`, in host order
pub fn list_host_input_devices(host: &cpal::Host) -> Result<Vec<InputDeviceInfo>, DeviceError> {
    let default_name = host
        .default_input_device()
        .and_then(|device| device.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?;

    let infos = devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());

            let default_sample_rate = device
                .default_input_config()
                .ok()
                .map(|config| config.sample_rate().0);

            let max_input_channels = device
                .supported_input_configs()
                .map(|ranges| ranges.map(|range| range.channels()).max().unwrap_or(0))
                .unwrap_or(0);

            let is_default = default_name.as_deref() == Some(name.as_str());

            InputDeviceInfo {
                index,
                name,
                default_sample_rate,
                max_input_channels,
                is_default,
            }
        })
        .collect();

    Ok(infos)
}

/// Look up an input device by catalog index
pub fn find_input_device(host: &cpal::Host, index: usize) -> Result<cpal::Device, DeviceError> {
    host.input_devices()
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?
        .nth(index)
        .ok_or(DeviceError::DeviceNotFound(index))
}
