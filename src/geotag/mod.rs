//! EXIF geotags
//!
//! The capture side embeds the position fix and capture timestamp into each
//! published JPEG; the recognition side extracts them again for match
//! enrichment. Coordinates travel as degrees/minutes/seconds rational triples
//! with hemisphere reference tags, distances as decimal-fraction rationals.

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use exif::experimental::Writer;
use exif::{Exif, Field, In, Rational, Reader, Tag, Value};
use img_parts::jpeg::Jpeg;
use img_parts::ImageEXIF;

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Embedded tags extracted from one captured image.
#[derive(Debug, Clone, Default)]
pub struct CaptureMetadata {
    /// Original capture timestamp, when the tag is present and parseable.
    pub capture_time: Option<NaiveDateTime>,
    /// Signed decimal degrees; 0.0 when the tag is absent.
    pub latitude: f64,
    /// Signed decimal degrees; 0.0 when the tag is absent.
    pub longitude: f64,
    /// Meters; 0.0 when absent or when the rational has a zero denominator.
    pub altitude_m: f64,
}

/// Encode an absolute coordinate as deg/min/sec rationals, seconds in
/// thousandths.
fn dms_rationals(value: f64) -> [Rational; 3] {
    let value = value.abs();
    let degrees = value.trunc();
    let minutes_full = (value - degrees) * 60.0;
    let minutes = minutes_full.trunc();
    let seconds = (minutes_full - minutes) * 60.0;
    [
        Rational::from((degrees as u32, 1)),
        Rational::from((minutes as u32, 1)),
        Rational::from(((seconds * 1000.0).round() as u32, 1000)),
    ]
}

/// Decode a deg/min/sec rational triple back to unsigned decimal degrees.
fn dms_to_degrees(values: &[Rational]) -> Option<f64> {
    if values.len() != 3 || values.iter().any(|r| r.denom == 0) {
        return None;
    }
    Some(values[0].to_f64() + values[1].to_f64() / 60.0 + values[2].to_f64() / 3600.0)
}

/// Distances (altitude, speed) travel in tenths.
fn tenths(value: f64) -> Rational {
    Rational::from(((value * 10.0).round() as u32, 10))
}

fn ascii(text: &str) -> Value {
    Value::Ascii(vec![text.as_bytes().to_vec()])
}

/// Build the EXIF body for one capture: timestamp plus GPS tags.
fn exif_body(fix: &crate::position::Fix, captured_at: DateTime<Local>) -> Result<Vec<u8>> {
    let mut fields = vec![
        Field {
            tag: Tag::DateTimeOriginal,
            ifd_num: In::PRIMARY,
            value: ascii(&captured_at.format(EXIF_DATETIME_FORMAT).to_string()),
        },
        Field {
            tag: Tag::GPSLatitude,
            ifd_num: In::PRIMARY,
            value: Value::Rational(dms_rationals(fix.latitude).to_vec()),
        },
        Field {
            tag: Tag::GPSLatitudeRef,
            ifd_num: In::PRIMARY,
            value: ascii(if fix.latitude < 0.0 { "S" } else { "N" }),
        },
        Field {
            tag: Tag::GPSLongitude,
            ifd_num: In::PRIMARY,
            value: Value::Rational(dms_rationals(fix.longitude).to_vec()),
        },
        Field {
            tag: Tag::GPSLongitudeRef,
            ifd_num: In::PRIMARY,
            value: ascii(if fix.longitude < 0.0 { "W" } else { "E" }),
        },
    ];

    if let Some(altitude) = fix.altitude {
        fields.push(Field {
            tag: Tag::GPSAltitude,
            ifd_num: In::PRIMARY,
            value: Value::Rational(vec![tenths(altitude)]),
        });
        // 0 = above sea level.
        fields.push(Field {
            tag: Tag::GPSAltitudeRef,
            ifd_num: In::PRIMARY,
            value: Value::Byte(vec![0]),
        });
    }
    if let Some(speed) = fix.speed {
        fields.push(Field {
            tag: Tag::GPSSpeed,
            ifd_num: In::PRIMARY,
            value: Value::Rational(vec![tenths(speed * 3.6)]),
        });
        fields.push(Field {
            tag: Tag::GPSSpeedRef,
            ifd_num: In::PRIMARY,
            value: ascii("K"),
        });
    }

    let mut writer = Writer::new();
    for field in &fields {
        writer.push_field(field);
    }
    let mut body = Cursor::new(Vec::new());
    writer.write(&mut body, false).context("encoding EXIF body")?;
    Ok(body.into_inner())
}

/// Splice geotags into an encoded JPEG, replacing any existing EXIF segment.
pub fn tag_jpeg(
    jpeg_bytes: Vec<u8>,
    fix: &crate::position::Fix,
    captured_at: DateTime<Local>,
) -> Result<Vec<u8>> {
    let body = exif_body(fix, captured_at)?;
    let mut jpeg = Jpeg::from_bytes(jpeg_bytes.into()).context("parsing JPEG for tagging")?;
    jpeg.set_exif(Some(body.into()));
    let mut out = Vec::new();
    jpeg.encoder()
        .write_to(&mut out)
        .context("writing tagged JPEG")?;
    Ok(out)
}

/// Read the embedded tags back from a published image. Missing individual
/// tags degrade to their zero values; only an unreadable container errors.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let exif = Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .with_context(|| format!("reading EXIF from {}", path.display()))?;

    let capture_time = exif
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .and_then(ascii_text)
        .and_then(|text| NaiveDateTime::parse_from_str(&text, EXIF_DATETIME_FORMAT).ok());

    let latitude = coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, b'S');
    let longitude = coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, b'W');

    let altitude_m = exif
        .get_field(Tag::GPSAltitude, In::PRIMARY)
        .and_then(|field| match &field.value {
            Value::Rational(values) => values.first().copied(),
            _ => None,
        })
        .filter(|rational| rational.denom > 0)
        .map(|rational| rational.to_f64())
        .unwrap_or(0.0);

    Ok(CaptureMetadata {
        capture_time,
        latitude,
        longitude,
        altitude_m,
    })
}

fn ascii_text(field: &Field) -> Option<String> {
    match &field.value {
        Value::Ascii(values) => values
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

/// Signed decimal degrees for one coordinate axis; 0.0 when absent.
fn coordinate(exif: &Exif, tag: Tag, ref_tag: Tag, negative_ref: u8) -> f64 {
    let Some(field) = exif.get_field(tag, In::PRIMARY) else {
        return 0.0;
    };
    let Value::Rational(values) = &field.value else {
        return 0.0;
    };
    let Some(degrees) = dms_to_degrees(values) else {
        return 0.0;
    };
    let negative = exif
        .get_field(ref_tag, In::PRIMARY)
        .and_then(ascii_text)
        .map(|text| text.as_bytes().first() == Some(&negative_ref))
        .unwrap_or(false);
    if negative {
        -degrees
    } else {
        degrees
    }
}
