//! Play videos on per-key RGB keyboards.
//!
//! Every video frame is sampled at the physical position of each key and the
//! resulting colors are streamed to the keyboard in real time.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::builder::EnumValueParser;
use clap::{
    crate_description, crate_name, crate_version, value_parser, Arg, ArgAction, ArgMatches,
    Command, ValueEnum,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::controller::{HidController, HidKeyboard, LightingDevice};
use crate::error::Result;
use crate::layout::KeyMap;
use crate::monsgeek_m1_v5::MonsgeekM1V5He;
use crate::preview::TerminalPreview;
use crate::sampler::Fit;
use crate::video::{DecoderOptions, VideoDecoder};

mod controller;
mod error;
mod layout;
mod monsgeek_m1_v5;
mod player;
mod preview;
mod sampler;
mod video;

/// Colors swept across the keyboard by `keytest`.
const TESTCOLORS: [Rgb; 6] = [
    Rgb { r: 0xff, g: 0x00, b: 0x00 },
    Rgb { r: 0x00, g: 0xff, b: 0x00 },
    Rgb { r: 0x00, g: 0x00, b: 0xff },
    Rgb { r: 0xff, g: 0x00, b: 0xff },
    Rgb { r: 0xff, g: 0xff, b: 0x00 },
    Rgb { r: 0xff, g: 0xff, b: 0xff },
];

/// Number of steps for one `keytest` sweep.
const SWEEP_STEPS: u32 = 40;

/// Video played when no path is given.
const DEFAULT_VIDEO: &str = "bad_apple.mpg";

/// Default decoder downscale width.
const DEFAULT_SAMPLE_WIDTH: u32 = 160;

/// Supported lighting devices.
#[derive(ValueEnum, Default, PartialEq, Eq, Debug, Copy, Clone)]
enum Device {
    #[default]
    #[value(name = "m1-v5-he")]
    M1V5He,
    Preview,
}

impl Device {
    /// Get HID controller for a device.
    fn controller(&self) -> Option<Box<dyn HidController>> {
        match self {
            Self::M1V5He => Some(Box::new(MonsgeekM1V5He)),
            Self::Preview => None,
        }
    }

    /// Connect to the device.
    fn open(&self, config: &Config) -> Result<Box<dyn LightingDevice>> {
        match self.controller() {
            Some(controller) => Ok(Box::new(HidKeyboard::open(controller, config.brightness)?)),
            None => Ok(Box::new(TerminalPreview::new(self.layout(config)?, config.brightness))),
        }
    }

    /// LED positions from the layout file or the built-in layout.
    fn layout(&self, config: &Config) -> Result<Vec<layout::LedPosition>> {
        match &config.layout {
            Some(path) => layout::load_layout(path),
            None => Ok(self.builtin_layout()),
        }
    }

    /// LED positions without connecting to the device.
    fn builtin_layout(&self) -> Vec<layout::LedPosition> {
        match self.controller() {
            Some(controller) => controller.led_positions(),
            // The preview mirrors the default keyboard.
            None => MonsgeekM1V5He.led_positions(),
        }
    }
}

/// RGB color.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct Rgb {
    r: u8,
    g: u8,
    b: u8,
}

impl Rgb {
    /// Dim the color to a maximum brightness.
    fn scale(self, brightness: Brightness) -> Self {
        let max = u8::max_value() as u16;
        let scale = |channel: u8| (channel as u16 * brightness.0 as u16 / max) as u8;
        Self { r: scale(self.r), g: scale(self.g), b: scale(self.b) }
    }
}

impl Display for Rgb {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// LED brightness.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct Brightness(u8);

impl Brightness {
    const fn max_value() -> Self {
        Self(u8::max_value())
    }
}

impl Display for Brightness {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Playback config.
#[derive(Debug, Clone)]
struct Config {
    video: PathBuf,
    device: Device,
    layout: Option<PathBuf>,
    fit: Fit,
    brightness: Brightness,
    sample_width: u32,
    looping: bool,
    verbose: bool,
}

impl Config {
    fn from_cli(matches: &ArgMatches) -> Self {
        let mut config = Config::default();

        if let Some(video) = matches.get_one::<PathBuf>("video") {
            config.video = video.clone();
        }

        if let Some(device) = matches.get_one::<Device>("device") {
            config.device = *device;
        }

        if let Some(fit) = matches.get_one::<Fit>("fit") {
            config.fit = *fit;
        }

        config.layout = matches.get_one::<PathBuf>("layout").cloned();
        config.looping = matches.get_flag("loop");
        config.verbose = matches.get_flag("verbose");

        if let Some(brightness) = matches.get_one::<u8>("brightness") {
            config.brightness = Brightness(*brightness);
        }

        if let Some(sample_width) = matches.get_one::<u32>("sample-width") {
            config.sample_width = *sample_width;
        }

        config
    }

    fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            sample_width: Some(self.sample_width).filter(|&width| width > 0),
            looping: self.looping,
        }
    }

    /// LED positions from the layout file or the device.
    fn led_positions(&self, device: &dyn LightingDevice) -> Result<Vec<layout::LedPosition>> {
        match &self.layout {
            Some(path) => {
                info!("Using LED layout from {}", path.display());
                layout::load_layout(path)
            },
            None => Ok(device.led_positions()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video: PathBuf::from(DEFAULT_VIDEO),
            brightness: Brightness::max_value(),
            sample_width: DEFAULT_SAMPLE_WIDTH,
            device: Default::default(),
            layout: Default::default(),
            fit: Default::default(),
            looping: Default::default(),
            verbose: Default::default(),
        }
    }
}

fn main() {
    let cli = cli();
    let config = Config::from_cli(&cli);

    init_tracing(config.verbose);

    let result = match cli.subcommand_name() {
        Some("keytest") => keytest(&config),
        Some("leds") => leds(&config),
        _ => keyplay(&config),
    };

    if let Err(err) = result {
        eprintln!("\x1b[31mError:\x1b[0m {err}");
        process::exit(1);
    }
}

/// Install the log subscriber.
fn init_tracing(verbose: bool) {
    let default = if verbose { "keyplay=debug" } else { "keyplay=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

/// Play the configured video on the keyboard.
fn keyplay(config: &Config) -> Result<()> {
    let mut decoder = VideoDecoder::open(&config.video, config.decoder_options())?;

    let mut device = config.device.open(config)?;
    let mut keymap = KeyMap::new(&config.led_positions(device.as_ref())?)?;

    info!(
        "Playing {} on {} ({} keys)",
        config.video.display(),
        device.name(),
        keymap.keys().len()
    );

    let running = setup_interrupt_handler();
    let stats = player::play(&mut decoder, device.as_mut(), &mut keymap, config.fit, &running)?;

    info!("Played {} frames ({} late)", stats.frames, stats.late_frames);

    Ok(())
}

/// Sweep test colors across the keyboard from left to right.
fn keytest(config: &Config) -> Result<()> {
    let mut device = config.device.open(config)?;
    let mut keymap = KeyMap::new(&config.led_positions(device.as_ref())?)?;
    let bounds = keymap.bounds();
    let keys = keymap.keys().to_vec();

    let running = setup_interrupt_handler();

    println!("Testing {} keys on {}...\n", keys.len(), device.name());

    'colors: for color in TESTCOLORS.iter() {
        println!("Sweeping color {}", color);

        for step in 0..=SWEEP_STEPS {
            if !running.load(Ordering::SeqCst) {
                break 'colors;
            }

            let progress = step as f32 / SWEEP_STEPS as f32;
            for key in &keys {
                let (u, _) = bounds.normalize(key.x, key.y);
                let key_color = if u <= progress { *color } else { Rgb::default() };
                keymap.set_color(key.slot, key_color);
            }

            device.set_colors(keymap.colors())?;
            thread::sleep(std::time::Duration::from_millis(25));
        }
    }

    keymap.clear();
    device.set_colors(keymap.colors())
}

/// Print the LED positions of the selected device.
fn leds(config: &Config) -> Result<()> {
    let keymap = KeyMap::new(&config.device.layout(config)?)?;
    print!("{}", led_table(&keymap));
    Ok(())
}

/// Table of every key with its position and color slot.
fn led_table(keymap: &KeyMap) -> String {
    let mut table = format!("{:>5} {:>8} {:>8} {:>5}\n", "LED", "X", "Y", "SLOT");
    for key in keymap.keys() {
        table.push_str(&format!("{:>5} {:>8.2} {:>8.2} {:>5}\n", key.id, key.x, key.y, key.slot));
    }
    table
}

/// Stop playback on Ctrl+C or when `q` is entered.
fn setup_interrupt_handler() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));

    let handler_flag = running.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst)) {
        warn!("Unable to install Ctrl+C handler: {}", err);
    }

    let stdin_flag = running.clone();
    thread::spawn(move || {
        while let Some(line) = stdin_nextline() {
            if line.eq_ignore_ascii_case("q") {
                debug!("Quit requested");
                stdin_flag.store(false, Ordering::SeqCst);
                break;
            }
        }
    });

    running
}

/// Get clap CLI parameters.
fn cli() -> ArgMatches {
    command().get_matches()
}

fn command() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .after_help("Enter `q` or press Ctrl+C to stop playback.")
        .subcommand(Command::new("keytest").about("Sweep test colors across all keys"))
        .subcommand(Command::new("leds").about("List LED positions"))
        .arg(
            Arg::new("video")
                .help("Video file to play")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("device")
                .help("Lighting device")
                .long("device")
                .short('d')
                .global(true)
                .ignore_case(true)
                .value_parser(EnumValueParser::<Device>::new()),
        )
        .arg(
            Arg::new("layout")
                .help("TOML file overriding the device's LED positions")
                .long("layout")
                .short('l')
                .global(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("fit")
                .help("Placement of the video on the keyboard")
                .long("fit")
                .short('f')
                .ignore_case(true)
                .value_parser(EnumValueParser::<Fit>::new()),
        )
        .arg(
            Arg::new("brightness")
                .help("Maximum brightness [possible values: 0..=255]")
                .long("brightness")
                .short('b')
                .global(true)
                .value_parser(value_parser!(u8)),
        )
        .arg(
            Arg::new("sample-width")
                .help("Downscale video to this width before sampling, 0 to disable")
                .long("sample-width")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("loop")
                .help("Restart the video when it ends")
                .long("loop")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .help("Print debug logs")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue),
        )
}

/// Read next line from STDIN.
///
/// Returns `None` once STDIN is closed.
#[inline]
fn stdin_nextline() -> Option<String> {
    let mut input = String::new();

    match io::stdin().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let matches = command().try_get_matches_from(args).unwrap();
        Config::from_cli(&matches)
    }

    #[test]
    fn testcolors_are_distinct() {
        for (i, color) in TESTCOLORS.iter().enumerate() {
            assert!(TESTCOLORS[i + 1..].iter().all(|other| other != color));
        }
    }

    #[test]
    fn defaults() {
        let config = parse(&["keyplay"]);
        assert_eq!(config.video, PathBuf::from(DEFAULT_VIDEO));
        assert_eq!(config.device, Device::M1V5He);
        assert_eq!(config.fit, Fit::Stretch);
        assert_eq!(config.brightness, Brightness::max_value());
        assert_eq!(config.decoder_options().sample_width, Some(DEFAULT_SAMPLE_WIDTH));
        assert!(!config.looping);
        assert!(config.layout.is_none());
    }

    #[test]
    fn playback_options() {
        let config = parse(&[
            "keyplay",
            "clip.mp4",
            "--device",
            "preview",
            "--fit",
            "contain",
            "-b",
            "128",
            "--sample-width",
            "0",
            "--loop",
        ]);
        assert_eq!(config.video, PathBuf::from("clip.mp4"));
        assert_eq!(config.device, Device::Preview);
        assert_eq!(config.fit, Fit::Contain);
        assert_eq!(config.brightness, Brightness(128));
        assert_eq!(config.decoder_options().sample_width, None);
        assert!(config.decoder_options().looping);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(command().try_get_matches_from(&["keyplay", "-b", "300"]).is_err());
        assert!(command().try_get_matches_from(&["keyplay", "--brightness", "dim"]).is_err());
        assert!(command().try_get_matches_from(&["keyplay", "--sample-width", "abc"]).is_err());
        assert!(command().try_get_matches_from(&["keyplay", "--sample-width", "-1"]).is_err());
    }

    #[test]
    fn brightness_applies_to_subcommands() {
        let config = parse(&["keyplay", "keytest", "-b", "7"]);
        assert_eq!(config.brightness, Brightness(7));
    }

    #[test]
    fn subcommands_accept_global_options() {
        let matches =
            command().try_get_matches_from(&["keyplay", "leds", "-d", "m1-v5-he"]).unwrap();
        assert_eq!(matches.subcommand_name(), Some("leds"));
        assert_eq!(Config::from_cli(&matches).device, Device::M1V5He);
    }

    #[test]
    fn preview_mirrors_builtin_layout() {
        assert_eq!(Device::Preview.builtin_layout(), Device::M1V5He.builtin_layout());
    }

    #[test]
    fn led_table_lists_keys() {
        let positions = vec![
            layout::LedPosition { id: 41, x: 0., y: 0. },
            layout::LedPosition { id: 41, x: 0.5, y: 0. },
            layout::LedPosition { id: 44, x: 6., y: 5. },
        ];
        let keymap = KeyMap::new(&positions).unwrap();

        let table = led_table(&keymap);
        let rows = table.lines().collect::<Vec<_>>();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], "   41     0.00     0.00     0");
        assert_eq!(rows[2], "   41     0.50     0.00     0");
        assert_eq!(rows[3], "   44     6.00     5.00     1");
    }

    #[test]
    fn rgb_scale() {
        let color = Rgb { r: 0xff, g: 0x80, b: 0x01 };
        assert_eq!(color.scale(Brightness::max_value()), color);
        assert_eq!(color.scale(Brightness(0)), Rgb::default());
        assert_eq!(color.to_string(), "0xff8001");
    }
}
