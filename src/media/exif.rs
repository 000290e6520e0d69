use std::io::Cursor;

use chrono::NaiveDateTime;
use exif::{In, Reader, Tag, Value as ExifValue};

/// Camera, exposure and location tags pulled from an image's EXIF block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureMetadata {
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub captured_at: Option<NaiveDateTime>,
    pub exposure_time: Option<String>,
    pub f_number: Option<f64>,
    pub iso: Option<i64>,
    pub focal_length: Option<f64>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub orientation: Option<i64>,
}

impl CaptureMetadata {
    pub fn is_empty(&self) -> bool {
        *self == CaptureMetadata::default()
    }
}

/// Best-effort EXIF parse of an encoded image.
///
/// `Ok(None)` means the file carries no EXIF block (or none of the tags we
/// keep). An `Err` means a block was present but unreadable; callers treat
/// that as "no metadata" too, but it is worth a warning.
pub fn extract_capture(bytes: &[u8]) -> Result<Option<CaptureMetadata>, exif::Error> {
    let exif = match Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut summary = CaptureMetadata::default();
    let mut lat: Option<[f64; 3]> = None;
    let mut lat_ref: Option<String> = None;
    let mut lon: Option<[f64; 3]> = None;
    let mut lon_ref: Option<String> = None;

    for field in exif.fields().filter(|f| f.ifd_num == In::PRIMARY) {
        match field.tag {
            Tag::Make => summary.camera_make = exif_string(&field.value),
            Tag::Model => summary.camera_model = exif_string(&field.value),
            Tag::DateTimeOriginal => summary.captured_at = parse_exif_datetime(&field.value),
            Tag::DateTime if summary.captured_at.is_none() => {
                summary.captured_at = parse_exif_datetime(&field.value)
            }
            Tag::ExposureTime => summary.exposure_time = exposure_string(&field.value),
            Tag::FNumber => summary.f_number = rational_value(&field.value),
            Tag::PhotographicSensitivity => summary.iso = int_value(&field.value),
            Tag::FocalLength => summary.focal_length = rational_value(&field.value),
            Tag::Orientation => summary.orientation = int_value(&field.value),
            Tag::GPSLatitude => lat = dms(&field.value),
            Tag::GPSLatitudeRef => lat_ref = exif_string(&field.value),
            Tag::GPSLongitude => lon = dms(&field.value),
            Tag::GPSLongitudeRef => lon_ref = exif_string(&field.value),
            _ => {}
        }
    }

    summary.gps_latitude = gps_coordinate(lat, lat_ref.as_deref());
    summary.gps_longitude = gps_coordinate(lon, lon_ref.as_deref());

    if summary.is_empty() {
        return Ok(None);
    }
    Ok(Some(summary))
}

fn exif_string(value: &ExifValue) -> Option<String> {
    match value {
        ExifValue::Ascii(values) => values
            .first()
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .map(|s| s.trim_matches('\u{0}').trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn parse_exif_datetime(value: &ExifValue) -> Option<NaiveDateTime> {
    let raw = exif_string(value)?;
    NaiveDateTime::parse_from_str(&raw, "%Y:%m:%d %H:%M:%S").ok()
}

fn rational_value(value: &ExifValue) -> Option<f64> {
    match value {
        ExifValue::Rational(values) => values.first().filter(|r| r.denom != 0).map(|r| r.to_f64()),
        ExifValue::SRational(values) => values.first().filter(|r| r.denom != 0).map(|r| r.to_f64()),
        _ => None,
    }
}

/// Shutter speeds are kept the way photographers read them: "1/125", "2.5".
fn exposure_string(value: &ExifValue) -> Option<String> {
    let ExifValue::Rational(values) = value else {
        return None;
    };
    let r = values.first()?;
    if r.num == 0 || r.denom == 0 {
        return None;
    }
    if r.num < r.denom && r.denom % r.num == 0 {
        Some(format!("1/{}", r.denom / r.num))
    } else {
        Some(format!("{}", r.to_f64()))
    }
}

fn int_value(value: &ExifValue) -> Option<i64> {
    match value {
        ExifValue::Byte(values) => values.first().map(|v| *v as i64),
        ExifValue::Short(values) => values.first().map(|v| *v as i64),
        ExifValue::Long(values) => values.first().map(|v| *v as i64),
        ExifValue::SShort(values) => values.first().map(|v| *v as i64),
        ExifValue::SLong(values) => values.first().map(|v| *v as i64),
        _ => None,
    }
}

fn dms(value: &ExifValue) -> Option<[f64; 3]> {
    match value {
        ExifValue::Rational(values) if values.len() >= 3 && values.iter().all(|r| r.denom != 0) => {
            Some([values[0].to_f64(), values[1].to_f64(), values[2].to_f64()])
        }
        _ => None,
    }
}

fn gps_coordinate(values: Option<[f64; 3]>, reference: Option<&str>) -> Option<f64> {
    let [degrees, minutes, seconds] = values?;
    let sign = match reference.map(|r| r.trim().to_ascii_uppercase()) {
        Some(r) if r == "S" || r == "W" => -1.0,
        _ => 1.0,
    };
    Some(sign * (degrees + minutes / 60.0 + seconds / 3600.0))
}
