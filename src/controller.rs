//! Lighting device abstraction.

use bytes::Bytes;
use hidapi::{HidApi, HidDevice};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layout::{LedColor, LedPosition};
use crate::Brightness;

/// Keyboard with individually addressable key lights.
pub trait LightingDevice {
    /// Human readable device name.
    fn name(&self) -> &str;

    /// Physical position of every LED.
    fn led_positions(&self) -> Vec<LedPosition>;

    /// Show a new set of LED colors.
    fn set_colors(&mut self, colors: &[LedColor]) -> Result<()>;
}

/// HID RGB keyboard controller.
pub(crate) trait HidController {
    /// Keyboard model name.
    fn name(&self) -> &'static str;

    /// HID vendor ID.
    fn vendor_id(&self) -> u16;

    /// HID product ID.
    fn product_id(&self) -> u16;

    /// HID usage page of the lighting interface, if the device exposes several.
    fn usage_page(&self) -> Option<u16> {
        None
    }

    /// LED positions of the built-in layout.
    fn led_positions(&self) -> Vec<LedPosition>;

    /// Convert LED colors to controller-specific bytes.
    fn frame_bytes(&self, colors: &[LedColor], brightness: Brightness) -> Result<Vec<Bytes>>;

    /// Feature report asking the firmware for its capabilities.
    fn capability_query(&self) -> Option<Bytes> {
        None
    }

    /// Check the firmware's answer to the capability query.
    ///
    /// The response starts after the report ID.
    fn check_capabilities(&self, _response: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Report handing LED control back to the firmware.
    fn release_bytes(&self) -> Option<Bytes> {
        None
    }
}

/// Keyboard driven through a HID feature interface.
pub struct HidKeyboard {
    controller: Box<dyn HidController>,
    device: HidDevice,
    brightness: Brightness,
}

impl HidKeyboard {
    pub(crate) fn open(controller: Box<dyn HidController>, brightness: Brightness) -> Result<Self> {
        let api = HidApi::new()?;

        let info = api
            .device_list()
            .find(|info| {
                info.vendor_id() == controller.vendor_id()
                    && info.product_id() == controller.product_id()
                    && controller.usage_page().map_or(true, |page| info.usage_page() == page)
            })
            .ok_or(Error::DeviceNotFound {
                vendor_id: controller.vendor_id(),
                product_id: controller.product_id(),
            })?;

        debug!("Opening HID interface {:?}", info.path());
        let device = info.open_device(&api)?;

        if let Some(query) = controller.capability_query() {
            device.send_feature_report(&query)?;

            let mut response = vec![0; query.len()];
            let len = device.get_feature_report(&mut response)?;
            controller.check_capabilities(response.get(1..len).unwrap_or_default())?;
        }

        info!(
            "Connected to {} ({})",
            controller.name(),
            info.product_string().unwrap_or("unknown product")
        );

        Ok(Self { controller, device, brightness })
    }
}

impl LightingDevice for HidKeyboard {
    fn name(&self) -> &str {
        self.controller.name()
    }

    fn led_positions(&self) -> Vec<LedPosition> {
        self.controller.led_positions()
    }

    fn set_colors(&mut self, colors: &[LedColor]) -> Result<()> {
        for packet in self.controller.frame_bytes(colors, self.brightness)? {
            self.device.send_feature_report(&packet)?;
        }

        Ok(())
    }
}

impl Drop for HidKeyboard {
    fn drop(&mut self) {
        if let Some(release) = self.controller.release_bytes() {
            match self.device.send_feature_report(&release) {
                Ok(()) => debug!("Released LED control of {}", self.controller.name()),
                Err(err) => warn!("Unable to release LED control: {}", err),
            }
        }
    }
}
