//! MonsGeek M1 V5 HE per-key LED streaming.
//!
//! Frames are written straight into the keyboard's LED frame buffer in pages
//! of 18 LEDs, followed by a commit that displays the new frame.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::controller::HidController;
use crate::error::{Error, Result};
use crate::layout::{LedColor, LedPosition};
use crate::{Brightness, Rgb};

const COLS: usize = 16;
const ROWS: usize = 6;
const MATRIX_LEN: usize = COLS * ROWS;

const LEDS_PER_PAGE: usize = 18;
const PAGE_COUNT: usize = (MATRIX_LEN + LEDS_PER_PAGE - 1) / LEDS_PER_PAGE;

/// HID report length including the report ID.
const REPORT_SIZE: usize = 65;

const CMD_LED_STREAM: u8 = 0xfc;
const COMMIT_PAGE: u8 = 0xff;
const RELEASE_PAGE: u8 = 0xfe;

/// Capability query of the patched firmware.
const CMD_PATCH_INFO: u8 = 0xfb;

/// Patch capability bit for LED streaming.
const CAP_LED_STREAM: u16 = 1 << 1;

/// Estimated WS2812 current draw per channel at full value.
const MA_PER_CHANNEL: f32 = 20.0;

/// Current budget for the whole LED matrix.
const POWER_BUDGET_MA: f32 = 400.0;

/// LED matrix in column-major order, index = col * ROWS + row.
///
/// Values are HID usage codes, 0 marks positions without an LED.
#[rustfmt::skip]
const LED_MATRIX: [u8; MATRIX_LEN] = [
    // Esc, `, Tab, CapsLock, LShift, LCtrl.
     41,  53,  43,  57, 225, 224,
     58,  30,  20,   4,   0, 227,
     59,  31,  26,  22,  29, 226,
     60,  32,   8,   7,  27,   0,
     61,  33,  21,   9,   6,   0,
     62,  34,  23,  10,  25,   0,
     63,  35,  28,  11,   5,  44,
     64,  36,  24,  13,  17,   0,
     65,  37,  12,  14,  16,   0,
     66,  38,  18,  15,  54, 230,
     67,  39,  19,  51,  55,   0,
     68,  45,  47,  52,  56, 228,
     69,  46,  48,   0, 229,  80,
    // Delete, Backspace, Backslash, Enter, Up, Down.
     76,  42,  49,  40,  82,  81,
      0,  74,  75,  78,  77,  79,
    // Volume up and down.
    233, 234,   0,   0,   0,   0,
];

pub struct MonsgeekM1V5He;

impl HidController for MonsgeekM1V5He {
    fn name(&self) -> &'static str {
        "MonsGeek M1 V5 HE"
    }

    fn vendor_id(&self) -> u16 {
        0x3151
    }

    fn product_id(&self) -> u16 {
        0x5030
    }

    fn usage_page(&self) -> Option<u16> {
        Some(0xffff)
    }

    fn led_positions(&self) -> Vec<LedPosition> {
        LED_MATRIX
            .iter()
            .enumerate()
            .filter(|(_, &hid)| hid != 0)
            .map(|(index, &hid)| LedPosition {
                id: hid as u16,
                x: (index / ROWS) as f32,
                y: (index % ROWS) as f32,
            })
            .collect()
    }

    fn frame_bytes(&self, colors: &[LedColor], brightness: Brightness) -> Result<Vec<Bytes>> {
        let mut leds = [Rgb::default(); MATRIX_LEN];
        for led in colors {
            if let Some(index) = matrix_index(led.id) {
                leds[index] = led.color.scale(brightness);
            }
        }

        apply_power_budget(&mut leds, POWER_BUDGET_MA);

        let mut packets = Vec::with_capacity(PAGE_COUNT + 1);

        for (page, chunk) in leds.chunks(LEDS_PER_PAGE).enumerate() {
            let mut buf = report(page as u8);

            for color in chunk {
                buf.put_u8(color.r);
                buf.put_u8(color.g);
                buf.put_u8(color.b);
            }

            packets.push(pad(buf));
        }

        // Display the staged pages.
        packets.push(pad(report(COMMIT_PAGE)));

        Ok(packets)
    }

    fn capability_query(&self) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(REPORT_SIZE);
        buf.put_u8(0x00);
        buf.put_u8(CMD_PATCH_INFO);
        Some(pad(buf))
    }

    fn check_capabilities(&self, response: &[u8]) -> Result<()> {
        let patch = PatchInfo::parse(response).ok_or_else(|| {
            Error::Unsupported(format!(
                "{} is running stock firmware, LED streaming needs the patched firmware",
                self.name()
            ))
        })?;

        debug!(
            name = %patch.name,
            version = patch.version,
            capabilities = patch.capabilities,
            "Firmware patch"
        );

        if !patch.has_led_stream() {
            return Err(Error::Unsupported(format!(
                "firmware patch {} v{} does not support LED streaming",
                patch.name, patch.version
            )));
        }

        Ok(())
    }

    fn release_bytes(&self) -> Option<Bytes> {
        Some(pad(report(RELEASE_PAGE)))
    }
}

/// Patched firmware description.
///
/// Layout: command echo, capability bits (u16 LE), version, NUL terminated name.
#[derive(PartialEq, Eq, Debug)]
struct PatchInfo {
    name: String,
    version: u8,
    capabilities: u16,
}

impl PatchInfo {
    /// Parse a patch info response, `None` for stock firmware.
    fn parse(response: &[u8]) -> Option<Self> {
        if response.first() != Some(&CMD_PATCH_INFO) || response.len() < 4 {
            return None;
        }

        let capabilities = u16::from_le_bytes([response[1], response[2]]);
        let version = response[3];
        if capabilities == 0 && version == 0 {
            return None;
        }

        let name = &response[4..];
        let end = name.iter().position(|&byte| byte == 0).unwrap_or(name.len());
        let name = String::from_utf8_lossy(&name[..end]).into_owned();

        Some(Self { name, version, capabilities })
    }

    fn has_led_stream(&self) -> bool {
        self.capabilities & CAP_LED_STREAM != 0
    }
}

/// Matrix index of an LED.
fn matrix_index(id: u16) -> Option<usize> {
    if id == 0 || id > u8::max_value() as u16 {
        return None;
    }
    LED_MATRIX.iter().position(|&hid| hid as u16 == id)
}

/// Start a new LED stream report for a page.
fn report(page: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(REPORT_SIZE);

    // Report ID.
    buf.put_u8(0x00);

    buf.put_u8(CMD_LED_STREAM);
    buf.put_u8(page);

    buf
}

/// Pad a report to the fixed HID report size.
fn pad(mut buf: BytesMut) -> Bytes {
    let padding = REPORT_SIZE.saturating_sub(buf.len());
    buf.put_bytes(0, padding);
    buf.freeze()
}

/// Scale all LEDs down uniformly if their estimated current exceeds the budget.
///
/// Returns `true` if the colors were scaled.
fn apply_power_budget(leds: &mut [Rgb], budget_ma: f32) -> bool {
    let ma_per_unit = MA_PER_CHANNEL / 255.;
    let total_ma: f32 =
        leds.iter().map(|led| (led.r as f32 + led.g as f32 + led.b as f32) * ma_per_unit).sum();

    if total_ma <= budget_ma {
        return false;
    }

    let scale = budget_ma / total_ma;
    for led in leds.iter_mut() {
        led.r = (led.r as f32 * scale) as u8;
        led.g = (led.g as f32 * scale) as u8;
        led.b = (led.b as f32 * scale) as u8;
    }

    true
}
