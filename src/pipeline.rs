//! Image processing pipeline.
//!
//! An acquired image is decoded once into a single RGB buffer. Every stage
//! borrows that buffer: error-frame detection, EXIF time and orientation
//! handling, then the variant × format matrix. Nothing is written here; the
//! result goes to the [`Publisher`](crate::publisher::Publisher).
//!
//! All work is CPU-bound and synchronous. Async callers should run it on a
//! blocking thread.

use crate::acquisition::{AcquiredImage, ImageSource};
use crate::config::{ErrorFrameConfig, PipelineConfig};
use crate::error::IngestError;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use exif::{In, Tag, Value};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::{debug, warn};

/// Vendor "no signal" screen colours. Plain black and white are left to the
/// uniformity check so night and snow scenes are not matched by colour alone.
const SIGNATURE_COLOURS: &[(&str, [u8; 3])] = &[("no-signal blue", [0, 0, 255]), ("grey", [128, 128, 128])];
const SIGNATURE_DISTANCE: u32 = 40;
const BLOCK_SIZE: u32 = 8;

/// A rendition size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Variant {
    Original,
    Height(u32),
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Original => f.write_str("original"),
            Variant::Height(h) => write!(f, "{h}"),
        }
    }
}

impl From<Variant> for String {
    fn from(variant: Variant) -> Self {
        variant.to_string()
    }
}

impl TryFrom<String> for Variant {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "original" {
            return Ok(Variant::Original);
        }
        s.parse::<u32>()
            .map(Variant::Height)
            .map_err(|_| format!("unknown variant: {s}"))
    }
}

/// Encoded output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossy, always written
    Jpeg,
    /// Lossless, written when enabled
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(format!("unknown format: {other}")),
        }
    }
}

/// One encoded file of a generation.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub variant: Variant,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl Rendition {
    pub fn file_name(&self) -> String {
        file_name(self.variant, self.format)
    }
}

pub fn file_name(variant: Variant, format: OutputFormat) -> String {
    format!("{}.{}", variant, format.extension())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOrigin {
    Exif,
    Acquisition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTime {
    pub at: DateTime<Utc>,
    pub origin: TimeOrigin,
    pub drift_flagged: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub captured_at: DateTime<Utc>,
    pub time_origin: TimeOrigin,
    pub clock_drift_flagged: bool,
    pub source: ImageSource,
    pub width: u32,
    pub height: u32,
    pub renditions: Vec<Rendition>,
}

#[derive(Debug, Clone)]
pub struct ProcessingPipeline {
    config: PipelineConfig,
}

impl ProcessingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn process(
        &self,
        acquired: &AcquiredImage,
        timezone_offset_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<ProcessedImage, IngestError> {
        let decoded = decode(&acquired.bytes)?;
        let mut img = DynamicImage::ImageRgb8(decoded.into_rgb8());

        if let DynamicImage::ImageRgb8(rgb) = &img {
            detect_error_frame(rgb, &self.config.error_frame)?;
        }

        let exif = read_exif(&acquired.bytes);
        let capture = resolve_capture_time(
            exif.datetime,
            acquired.captured_at,
            timezone_offset_minutes,
            now,
            &self.config,
        )?;
        if capture.drift_flagged {
            warn!(
                source = %acquired.source,
                acquired_at = %acquired.captured_at,
                "EXIF time too far from acquisition time, using acquisition time"
            );
        }

        if let Some(orientation) = exif.orientation {
            img = apply_orientation(img, orientation);
        }

        let renditions = self.render(&img)?;
        debug!(
            width = img.width(),
            height = img.height(),
            renditions = renditions.len(),
            captured_at = %capture.at,
            "Processed image"
        );

        Ok(ProcessedImage {
            captured_at: capture.at,
            time_origin: capture.origin,
            clock_drift_flagged: capture.drift_flagged,
            source: acquired.source,
            width: img.width(),
            height: img.height(),
            renditions,
        })
    }

    /// Variants to produce for a source of the given height, largest first.
    pub fn variants_for(&self, source_height: u32) -> Vec<Variant> {
        let mut heights: Vec<u32> = self
            .config
            .variant_heights
            .iter()
            .copied()
            .filter(|h| *h > 0 && *h < source_height)
            .collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();

        std::iter::once(Variant::Original)
            .chain(heights.into_iter().map(Variant::Height))
            .collect()
    }

    pub fn formats(&self) -> Vec<OutputFormat> {
        if self.config.webp_enabled {
            vec![OutputFormat::Jpeg, OutputFormat::Webp]
        } else {
            vec![OutputFormat::Jpeg]
        }
    }

    fn render(&self, img: &DynamicImage) -> Result<Vec<Rendition>, IngestError> {
        let formats = self.formats();
        let mut renditions = Vec::new();

        for variant in self.variants_for(img.height()) {
            let scaled;
            let source = match variant {
                Variant::Original => img,
                Variant::Height(height) => {
                    let width = scaled_width(img.width(), img.height(), height);
                    scaled = img.resize_exact(width, height, FilterType::Lanczos3);
                    &scaled
                }
            };

            for format in &formats {
                renditions.push(Rendition {
                    variant,
                    format: *format,
                    width: source.width(),
                    height: source.height(),
                    bytes: encode(source, *format, self.config.jpeg_quality)?,
                });
            }
        }

        Ok(renditions)
    }
}

fn scaled_width(width: u32, height: u32, target_height: u32) -> u32 {
    let scaled = (width as f64 * target_height as f64 / height as f64).round() as u32;
    scaled.max(1)
}

pub fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, IngestError> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Jpeg => img.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?,
        OutputFormat::Webp => img.write_with_encoder(WebPEncoder::new_lossless(&mut out))?,
    }
    Ok(out)
}

/// Decode an in-memory image. Every decoder failure, including a truncated
/// stream the decoder reports as an I/O error, is a bad image.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, IngestError> {
    image::load_from_memory(bytes).map_err(|e| IngestError::InvalidImage(e.to_string()))
}

/// Reject frames a camera produces when it has nothing useful to show.
pub fn detect_error_frame(img: &RgbImage, config: &ErrorFrameConfig) -> Result<(), IngestError> {
    let (width, height) = img.dimensions();
    if width < config.min_width || height < config.min_height {
        return Err(IngestError::ErrorFrame(format!(
            "image too small: {width}x{height}"
        )));
    }

    let thumb = image::imageops::thumbnail(img, 64, 64);

    let total = (thumb.width() * thumb.height()) as f64;
    for (name, colour) in SIGNATURE_COLOURS {
        let matching = thumb
            .pixels()
            .filter(|p| colour_distance(p.0, *colour) <= SIGNATURE_DISTANCE)
            .count() as f64;
        if matching / total >= config.signature_fraction {
            return Err(IngestError::ErrorFrame(format!("{name} overlay")));
        }
    }

    let stddev = luma_stddev(&thumb);
    if stddev < config.uniform_stddev {
        return Err(IngestError::ErrorFrame(format!(
            "uniform frame (luma stddev {stddev:.2})"
        )));
    }

    let (boundary, interior) = block_gradient_energy(img);
    if boundary >= 4.0 && boundary >= config.pixelation_ratio * interior.max(1.0) {
        return Err(IngestError::ErrorFrame(format!(
            "pixelated frame (block edges {boundary:.1}, interior {interior:.1})"
        )));
    }

    Ok(())
}

fn colour_distance(a: [u8; 3], b: [u8; 3]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as i32 - *y as i32).unsigned_abs())
        .sum()
}

fn luma(p: [u8; 3]) -> f64 {
    0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64
}

fn luma_stddev(img: &RgbImage) -> f64 {
    let values: Vec<f64> = img.pixels().map(|p| luma(p.0)).collect();
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Mean absolute luma step across 8 px block boundaries and inside blocks.
/// Rows and columns are sampled every other line.
fn block_gradient_energy(img: &RgbImage) -> (f64, f64) {
    let (width, height) = img.dimensions();
    let (mut boundary_sum, mut boundary_n) = (0.0, 0u64);
    let (mut interior_sum, mut interior_n) = (0.0, 0u64);

    let mut tally = |pos: u32, diff: f64| {
        if pos % BLOCK_SIZE == 0 {
            boundary_sum += diff;
            boundary_n += 1;
        } else {
            interior_sum += diff;
            interior_n += 1;
        }
    };

    for y in (0..height).step_by(2) {
        for x in 1..width {
            let diff = (luma(img.get_pixel(x, y).0) - luma(img.get_pixel(x - 1, y).0)).abs();
            tally(x, diff);
        }
    }
    for x in (0..width).step_by(2) {
        for y in 1..height {
            let diff = (luma(img.get_pixel(x, y).0) - luma(img.get_pixel(x, y - 1).0)).abs();
            tally(y, diff);
        }
    }

    let mean = |sum: f64, n: u64| if n == 0 { 0.0 } else { sum / n as f64 };
    (mean(boundary_sum, boundary_n), mean(interior_sum, interior_n))
}

/// EXIF fields the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExifInfo {
    /// Local date-time and its offset in minutes, when the camera recorded one.
    pub datetime: Option<(NaiveDateTime, Option<i32>)>,
    pub orientation: Option<u32>,
}

pub fn read_exif(bytes: &[u8]) -> ExifInfo {
    let Ok(exif) = exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) else {
        return ExifInfo::default();
    };

    let orientation = exif
        .get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0));

    let datetime = parse_exif_datetime(&exif, Tag::DateTimeOriginal, Tag::OffsetTimeOriginal)
        .or_else(|| parse_exif_datetime(&exif, Tag::DateTime, Tag::OffsetTime));

    ExifInfo {
        datetime,
        orientation,
    }
}

fn ascii_field(exif: &exif::Exif, tag: Tag) -> Option<&[u8]> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Ascii(values) => values.first().map(|v| v.as_slice()),
        _ => None,
    }
}

fn parse_exif_datetime(exif: &exif::Exif, tag: Tag, offset_tag: Tag) -> Option<(NaiveDateTime, Option<i32>)> {
    let mut dt = exif::DateTime::from_ascii(ascii_field(exif, tag)?).ok()?;
    if let Some(offset) = ascii_field(exif, offset_tag) {
        // A malformed offset leaves the time offset-less.
        let _ = dt.parse_offset(offset);
    }

    let date = NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)?;
    let time = NaiveTime::from_hms_opt(dt.hour as u32, dt.minute as u32, dt.second as u32)?;
    Some((NaiveDateTime::new(date, time), dt.offset.map(i32::from)))
}

/// Pick the capture time for a generation.
///
/// EXIF wins when it is plausible. A future EXIF time is an error; one far
/// from the acquisition time is flagged and replaced.
pub fn resolve_capture_time(
    exif_time: Option<(NaiveDateTime, Option<i32>)>,
    acquired_at: DateTime<Utc>,
    timezone_offset_minutes: i32,
    now: DateTime<Utc>,
    config: &PipelineConfig,
) -> Result<CaptureTime, IngestError> {
    let tolerance = ChronoDuration::seconds(config.clock_future_tolerance_seconds as i64);
    let max_drift = ChronoDuration::seconds(config.max_clock_drift_seconds as i64);

    if acquired_at > now + tolerance {
        return Err(IngestError::ClockDrift(format!(
            "acquisition time {acquired_at} is in the future"
        )));
    }

    let Some((local, offset)) = exif_time else {
        return Ok(CaptureTime {
            at: acquired_at,
            origin: TimeOrigin::Acquisition,
            drift_flagged: false,
        });
    };

    let offset_minutes = offset.unwrap_or(timezone_offset_minutes);
    let exif_utc = Utc.from_utc_datetime(&(local - ChronoDuration::minutes(offset_minutes as i64)));

    if exif_utc > now + tolerance {
        return Err(IngestError::ClockDrift(format!(
            "EXIF time {exif_utc} is in the future"
        )));
    }

    if (exif_utc - acquired_at).abs() > max_drift {
        return Ok(CaptureTime {
            at: acquired_at,
            origin: TimeOrigin::Acquisition,
            drift_flagged: true,
        });
    }

    Ok(CaptureTime {
        at: exif_utc,
        origin: TimeOrigin::Exif,
        drift_flagged: false,
    })
}

/// Apply an EXIF orientation tag (2-8) to the buffer.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}
