//! Report rows and the output table.
//!
//! The upstream schema varies by disaster type (a flood report carries a
//! water depth, a haze report a visibility, and so on). Rows flatten every
//! report onto one fixed column set so the published CSV keeps a stable
//! header across runs; columns that do not apply to a record stay empty.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::petabencana::{DisasterType, RawReport};

/// Filename of the published resource, also used for the local CSV.
pub const RESOURCE_FILENAME: &str = "cesa_disaster_reports_idn.csv";

/// Type-specific measurements pulled out of `report_data`. Absent fields
/// stay `None` and render as the empty string.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportDetails {
    Flood { depth_cm: Option<f64> },
    Earthquake { structure_failure: Option<f64> },
    Fire { distance_m: Option<f64> },
    Haze { visibility: Option<f64> },
    Wind { impact: Option<f64> },
    Volcano { signs: Option<String> },
}

impl ReportDetails {
    /// Explicit per-type mapping of the raw `report_data` object. Field
    /// names are the upstream's, camelCase where it uses camelCase.
    pub fn from_value(disaster: DisasterType, data: Option<&Value>) -> Self {
        match disaster {
            DisasterType::Flood => ReportDetails::Flood {
                depth_cm: number_field(data, "flood_depth"),
            },
            DisasterType::Earthquake => ReportDetails::Earthquake {
                structure_failure: number_field(data, "structureFailure"),
            },
            DisasterType::Fire => ReportDetails::Fire {
                distance_m: number_field(data, "fireDistance"),
            },
            DisasterType::Haze => ReportDetails::Haze {
                visibility: number_field(data, "visibility"),
            },
            DisasterType::Wind => ReportDetails::Wind {
                impact: number_field(data, "impact"),
            },
            DisasterType::Volcano => ReportDetails::Volcano {
                signs: string_field(data, "volcanicSigns"),
            },
        }
    }
}

fn number_field(data: Option<&Value>, key: &str) -> Option<f64> {
    data?.get(key).and_then(Value::as_f64)
}

fn string_field(data: Option<&Value>, key: &str) -> Option<String> {
    match data?.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn format_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Best-effort pkey for drop warnings, read straight off the raw JSON.
fn feature_pkey(feature: &Value) -> String {
    feature
        .get("properties")
        .and_then(|props| props.get("pkey"))
        .map(value_to_string)
        .unwrap_or_else(|| "<unknown>".to_string())
}

/// Normalize an upstream timestamp to UTC second precision
/// (`%Y-%m-%dT%H:%M:%SZ`), whatever offset or precision it arrived with.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

/// One flattened output row. Field order here is the published column
/// order and must not change across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportRow {
    pub pkey: String,
    pub disaster_type: String,
    pub created_at: String,
    pub source: String,
    pub status: String,
    pub url: String,
    pub image_url: String,
    pub is_training: String,
    pub title: String,
    pub text: String,
    pub report_type: String,
    pub flood_depth: String,
    pub structure_failure: String,
    pub fire_distance: String,
    pub visibility: String,
    pub wind_impact: String,
    pub volcanic_signs: String,
    pub city: String,
    pub region_code: String,
    pub instance_region_code: String,
    pub longitude: String,
    pub latitude: String,
}

impl ReportRow {
    /// Published header, in column order.
    pub const COLUMNS: [&'static str; 22] = [
        "pkey",
        "disaster_type",
        "created_at",
        "source",
        "status",
        "url",
        "image_url",
        "is_training",
        "title",
        "text",
        "report_type",
        "flood_depth",
        "structure_failure",
        "fire_distance",
        "visibility",
        "wind_impact",
        "volcanic_signs",
        "city",
        "region_code",
        "instance_region_code",
        "longitude",
        "latitude",
    ];

    /// Map one raw report. `None` means the record names no recognizable
    /// disaster type and cannot be placed in the fixed schema.
    pub fn from_report(report: &RawReport) -> Option<ReportRow> {
        let props = report.properties.as_ref()?;
        let disaster = DisasterType::from_name(props.disaster_type.as_deref()?)?;
        let details = ReportDetails::from_value(disaster, props.report_data.as_ref());

        let created_at = match props.created_at.as_deref() {
            Some(raw) => match normalize_timestamp(raw) {
                Some(ts) => ts,
                None => {
                    warn!(raw, "unparseable created_at, leaving blank");
                    String::new()
                }
            },
            None => String::new(),
        };

        let mut row = ReportRow {
            pkey: props.pkey.as_ref().map(value_to_string).unwrap_or_default(),
            disaster_type: disaster.to_string(),
            created_at,
            source: props.source.clone().unwrap_or_default(),
            status: props.status.clone().unwrap_or_default(),
            url: props.url.clone().unwrap_or_default(),
            image_url: props.image_url.clone().unwrap_or_default(),
            is_training: props.is_training.map(|b| b.to_string()).unwrap_or_default(),
            title: props.title.clone().unwrap_or_default(),
            text: props.text.clone().unwrap_or_default(),
            report_type: props
                .report_data
                .as_ref()
                .and_then(|d| d.get("report_type"))
                .map(value_to_string)
                .unwrap_or_default(),
            ..ReportRow::default()
        };

        match details {
            ReportDetails::Flood { depth_cm } => row.flood_depth = format_number(depth_cm),
            ReportDetails::Earthquake { structure_failure } => {
                row.structure_failure = format_number(structure_failure)
            }
            ReportDetails::Fire { distance_m } => row.fire_distance = format_number(distance_m),
            ReportDetails::Haze { visibility } => row.visibility = format_number(visibility),
            ReportDetails::Wind { impact } => row.wind_impact = format_number(impact),
            ReportDetails::Volcano { signs } => row.volcanic_signs = signs.unwrap_or_default(),
        }

        if let Some(tags) = &props.tags {
            row.city = tags.city.clone().unwrap_or_default();
            row.region_code = tags.region_code.clone().unwrap_or_default();
            row.instance_region_code = tags.instance_region_code.clone().unwrap_or_default();
        }

        if let Some(geometry) = &report.geometry {
            if geometry.coordinates.len() >= 2 {
                row.longitude = geometry.coordinates[0].to_string();
                row.latitude = geometry.coordinates[1].to_string();
            }
        }

        Some(row)
    }

    /// Cells in column order, matching [`Self::COLUMNS`].
    pub fn record(&self) -> [&str; 22] {
        [
            self.pkey.as_str(),
            self.disaster_type.as_str(),
            self.created_at.as_str(),
            self.source.as_str(),
            self.status.as_str(),
            self.url.as_str(),
            self.image_url.as_str(),
            self.is_training.as_str(),
            self.title.as_str(),
            self.text.as_str(),
            self.report_type.as_str(),
            self.flood_depth.as_str(),
            self.structure_failure.as_str(),
            self.fire_distance.as_str(),
            self.visibility.as_str(),
            self.wind_impact.as_str(),
            self.volcanic_signs.as_str(),
            self.city.as_str(),
            self.region_code.as_str(),
            self.instance_region_code.as_str(),
            self.longitude.as_str(),
            self.latitude.as_str(),
        ]
    }
}

/// The accumulated output table, rows in fetch order.
#[derive(Debug, Default)]
pub struct ReportTable {
    rows: Vec<ReportRow>,
    dropped: usize,
}

impl ReportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and append one raw feature. A record that does not decode
    /// or names no recognizable disaster type is dropped with a warning;
    /// the rest of its page is unaffected.
    pub fn push_report(&mut self, feature: &Value) {
        let report: RawReport = match serde_json::from_value(feature.clone()) {
            Ok(report) => report,
            Err(err) => {
                self.dropped += 1;
                warn!(pkey = %feature_pkey(feature), error = %err, "dropping report that does not decode");
                return;
            }
        };

        match ReportRow::from_report(&report) {
            Some(row) => self.rows.push(row),
            None => {
                self.dropped += 1;
                warn!(pkey = %feature_pkey(feature), "dropping report with no recognizable disaster type");
            }
        }
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Count of records dropped during mapping.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Write the table as `dir/cesa_disaster_reports_idn.csv` (header plus
    /// rows) and return the path.
    pub fn write_csv(&self, dir: &Path) -> Result<PathBuf, csv::Error> {
        let path = dir.join(RESOURCE_FILENAME);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(ReportRow::COLUMNS)?;
        for row in &self.rows {
            writer.write_record(row.record())?;
        }
        writer.flush().map_err(csv::Error::from)?;
        Ok(path)
    }
}
