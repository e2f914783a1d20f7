//! PetaBencana.id API client.
//!
//! CESA exposes crowdsourced disaster reports as GeoJSON, partitioned by
//! disaster type and limited to a trailing time window. Responses are
//! paginated with an opaque continuation cursor; each page echoes the
//! cursor for the next one until the stream is exhausted.
//!
//! Features are carried as raw JSON values here. Decoding happens per
//! record in the table layer, so one malformed record costs one row, not
//! the page it arrived on.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Config;
use crate::window::TimeWindow;

const OUTPUT_FORMAT: &str = "geojson";
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;
/// Hard cap on pages per disaster type; guards against a cursor loop.
const MAX_PAGES: u32 = 500;

/// The disaster categories the upstream API partitions reports by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisasterType {
    Flood,
    Earthquake,
    Fire,
    Haze,
    Wind,
    Volcano,
}

impl DisasterType {
    /// Every category, in the order a run queries them.
    pub const ALL: [DisasterType; 6] = [
        DisasterType::Flood,
        DisasterType::Earthquake,
        DisasterType::Fire,
        DisasterType::Haze,
        DisasterType::Wind,
        DisasterType::Volcano,
    ];

    /// The `disaster` query-parameter value.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisasterType::Flood => "flood",
            DisasterType::Earthquake => "earthquake",
            DisasterType::Fire => "fire",
            DisasterType::Haze => "haze",
            DisasterType::Wind => "wind",
            DisasterType::Volcano => "volcano",
        }
    }

    /// Parse an upstream `disaster_type` value. Unknown strings mean the
    /// record cannot be placed in the fixed schema.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "flood" => Some(DisasterType::Flood),
            "earthquake" => Some(DisasterType::Earthquake),
            "fire" => Some(DisasterType::Fire),
            "haze" => Some(DisasterType::Haze),
            "wind" => Some(DisasterType::Wind),
            "volcano" => Some(DisasterType::Volcano),
            _ => None,
        }
    }
}

impl fmt::Display for DisasterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetch-stage failure that survived the retry layer. Fatal for the run.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Non-retryable HTTP status (4xx other than 429).
    #[error("upstream API returned {status} for {disaster}: {body}")]
    Status {
        disaster: DisasterType,
        status: StatusCode,
        body: String,
    },
    /// Transport-level failure on the final attempt.
    #[error("upstream request for {disaster} failed after {attempts} attempts")]
    Transport {
        disaster: DisasterType,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    /// Retries exhausted on 429/5xx without ever seeing a success.
    #[error("upstream retries exhausted for {disaster} after {attempts} attempts (last status {last_status:?})")]
    Exhausted {
        disaster: DisasterType,
        attempts: u32,
        last_status: Option<StatusCode>,
    },
    /// Body was not the expected GeoJSON envelope.
    #[error("could not decode upstream response for {disaster}")]
    Decode {
        disaster: DisasterType,
        #[source]
        source: reqwest::Error,
    },
}

/// One GeoJSON feature, decoded per record by the table layer. Everything
/// is optional here; mapping to a row decides what is fatal per record.
#[derive(Debug, Clone, Deserialize)]
pub struct RawReport {
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Option<ReportProperties>,
}

/// Point geometry; coordinates arrive as `[longitude, latitude]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Geometry {
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportProperties {
    /// Usually a string, but older records carry a bare number.
    #[serde(default)]
    pub pkey: Option<Value>,
    #[serde(default)]
    pub disaster_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_training: Option<bool>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Shape varies by disaster type, so it stays raw JSON here.
    #[serde(default)]
    pub report_data: Option<Value>,
    #[serde(default)]
    pub tags: Option<ReportTags>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportTags {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub instance_region_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    result: FeatureCollection,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Value>,
}

/// One page of raw report features plus the continuation cursor, if any.
#[derive(Debug, Clone, Default)]
pub struct ReportPage {
    pub reports: Vec<Value>,
    pub next: Option<String>,
}

/// Narrow interface to the upstream transport; lets the page walk and the
/// pipeline run against scripted pages in tests.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch_page(
        &self,
        disaster: DisasterType,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<ReportPage, UpstreamError>;
}

/// Walk the cursor pagination for one disaster type and return every
/// feature in fetch order. A missing or empty `next` cursor ends the
/// walk; an empty first page is the upstream's explicit no-data answer,
/// which the caller treats as non-fatal.
pub async fn fetch_reports<S: ReportSource + ?Sized>(
    source: &S,
    disaster: DisasterType,
    window: &TimeWindow,
) -> Result<Vec<Value>, UpstreamError> {
    let mut reports = Vec::new();
    let mut cursor: Option<String> = None;

    for page_no in 0..MAX_PAGES {
        let page = source.fetch_page(disaster, window, cursor.as_deref()).await?;
        debug!(disaster = %disaster, page = page_no, count = page.reports.len(), "fetched page");
        reports.extend(page.reports);
        match page.next {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(reports),
        }
    }

    warn!(disaster = %disaster, cap = MAX_PAGES, "page cap reached before end of data, truncating");
    Ok(reports)
}

/// reqwest implementation of [`ReportSource`] with bounded retries.
pub struct PetabencanaClient {
    client: Client,
    base_url: String,
    extra_params: Vec<(String, String)>,
}

impl PetabencanaClient {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(config.user_agent.as_str())
            .build()
            .unwrap_or_else(|_| Client::new());

        // The upstream endpoint is addressed with a trailing slash.
        Self {
            client,
            base_url: format!("{}/", config.base_url.trim_end_matches('/')),
            extra_params: config.extra_params.clone(),
        }
    }

    /// GET one page, retrying transport failures and 429/5xx with
    /// exponential backoff. Other non-success statuses fail immediately.
    async fn execute_with_retry(
        &self,
        disaster: DisasterType,
        params: &[(String, String)],
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_transport: Option<reqwest::Error> = None;
        let mut last_status: Option<StatusCode> = None;

        for attempt in 1..=MAX_RETRIES {
            match self.client.get(&self.base_url).query(params).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        warn!(disaster = %disaster, %status, attempt, "retryable upstream status");
                        last_status = Some(status);
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(UpstreamError::Status { disaster, status, body });
                    }
                }
                Err(err) => {
                    warn!(disaster = %disaster, attempt, error = %err, "upstream request failed");
                    last_transport = Some(err);
                }
            }

            if attempt < MAX_RETRIES {
                debug!(disaster = %disaster, backoff_ms = backoff, "backing off before retry");
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        match last_transport {
            Some(source) => Err(UpstreamError::Transport {
                disaster,
                attempts: MAX_RETRIES,
                source,
            }),
            None => Err(UpstreamError::Exhausted {
                disaster,
                attempts: MAX_RETRIES,
                last_status,
            }),
        }
    }
}

#[async_trait]
impl ReportSource for PetabencanaClient {
    async fn fetch_page(
        &self,
        disaster: DisasterType,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<ReportPage, UpstreamError> {
        let mut params: Vec<(String, String)> = vec![
            ("timeperiod".to_string(), window.timeperiod_seconds().to_string()),
            ("geoformat".to_string(), OUTPUT_FORMAT.to_string()),
            ("disaster".to_string(), disaster.as_str().to_string()),
        ];
        for (key, value) in &self.extra_params {
            params.push((key.clone(), value.clone()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor".to_string(), cursor.to_string()));
        }

        let response = self.execute_with_retry(disaster, &params).await?;
        let envelope: PageEnvelope = response
            .json()
            .await
            .map_err(|source| UpstreamError::Decode { disaster, source })?;

        Ok(ReportPage {
            reports: envelope.result.features,
            next: envelope.next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSource {
        pages: Mutex<VecDeque<ReportPage>>,
        cursors_seen: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<ReportPage>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                cursors_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReportSource for ScriptedSource {
        async fn fetch_page(
            &self,
            _disaster: DisasterType,
            _window: &TimeWindow,
            cursor: Option<&str>,
        ) -> Result<ReportPage, UpstreamError> {
            self.cursors_seen
                .lock()
                .unwrap()
                .push(cursor.map(str::to_string));
            Ok(self.pages.lock().unwrap().pop_front().unwrap())
        }
    }

    struct EndlessSource;

    #[async_trait]
    impl ReportSource for EndlessSource {
        async fn fetch_page(
            &self,
            _disaster: DisasterType,
            _window: &TimeWindow,
            _cursor: Option<&str>,
        ) -> Result<ReportPage, UpstreamError> {
            Ok(ReportPage {
                reports: vec![report("looping")],
                next: Some("again".to_string()),
            })
        }
    }

    fn window() -> TimeWindow {
        let now = Utc.with_ymd_and_hms(2024, 7, 30, 12, 0, 0).unwrap();
        TimeWindow::trailing(now, 7)
    }

    fn report(pkey: &str) -> Value {
        json!({
            "geometry": { "type": "Point", "coordinates": [106.82, -6.17] },
            "properties": { "pkey": pkey, "disaster_type": "flood" }
        })
    }

    fn page(pkeys: &[&str], next: Option<&str>) -> ReportPage {
        ReportPage {
            reports: pkeys.iter().map(|p| report(p)).collect(),
            next: next.map(str::to_string),
        }
    }

    fn config_with_base(base_url: &str) -> Config {
        Config {
            user_agent: "test-agent".to_string(),
            hdx_api_key: "key".to_string(),
            hdx_site: "dev".to_string(),
            hdx_base_url: "https://dev.data-humdata-org.ahconu.org".to_string(),
            base_url: base_url.to_string(),
            extra_params: Vec::new(),
            lookback_days: 7,
            temp_dir: std::env::temp_dir(),
            log_file: None,
        }
    }

    #[tokio::test]
    async fn concatenates_pages_in_cursor_order() {
        let source = ScriptedSource::new(vec![
            page(&["1", "2"], Some("c1")),
            page(&["3"], Some("c2")),
            page(&["4"], None),
        ]);

        let reports = fetch_reports(&source, DisasterType::Flood, &window())
            .await
            .unwrap();

        let pkeys: Vec<&str> = reports
            .iter()
            .map(|r| r["properties"]["pkey"].as_str().unwrap())
            .collect();
        assert_eq!(pkeys, ["1", "2", "3", "4"]);

        let cursors = source.cursors_seen.lock().unwrap().clone();
        assert_eq!(
            cursors,
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn single_page_without_cursor_stops() {
        let source = ScriptedSource::new(vec![page(&["1"], None)]);
        let reports = fetch_reports(&source, DisasterType::Fire, &window())
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(source.cursors_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_cursor_string_ends_the_walk() {
        let source = ScriptedSource::new(vec![page(&["1"], Some(""))]);
        let reports = fetch_reports(&source, DisasterType::Haze, &window())
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn empty_first_page_yields_no_reports() {
        let source = ScriptedSource::new(vec![page(&[], None)]);
        let reports = fetch_reports(&source, DisasterType::Volcano, &window())
            .await
            .unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn cursor_loop_stops_at_the_page_cap() {
        let reports = fetch_reports(&EndlessSource, DisasterType::Wind, &window())
            .await
            .unwrap();
        assert_eq!(reports.len(), MAX_PAGES as usize);
    }

    #[test]
    fn request_url_keeps_the_trailing_slash() {
        let bare = PetabencanaClient::new(&config_with_base("https://api.petabencana.id/reports"));
        assert_eq!(bare.base_url, "https://api.petabencana.id/reports/");

        let slashed =
            PetabencanaClient::new(&config_with_base("https://api.petabencana.id/reports/"));
        assert_eq!(slashed.base_url, "https://api.petabencana.id/reports/");
    }

    #[test]
    fn disaster_names_round_trip() {
        for disaster in DisasterType::ALL {
            assert_eq!(DisasterType::from_name(disaster.as_str()), Some(disaster));
        }
        assert_eq!(DisasterType::from_name("meteor"), None);
        assert_eq!(DisasterType::from_name(""), None);
    }

    #[test]
    fn envelope_decodes_fixture_shape() {
        let body = json!({
            "statusCode": 200,
            "result": {
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geometry": { "type": "Point", "coordinates": [119.8707, -0.8396] },
                    "properties": {
                        "pkey": "357181",
                        "created_at": "2024-07-09T11:18:53.883Z",
                        "source": "grasp",
                        "status": "confirmed",
                        "url": "c79faff4-4d82-4e2a-8b5f-d1e35b9c0d0e",
                        "image_url": null,
                        "disaster_type": "earthquake",
                        "is_training": false,
                        "report_data": { "report_type": "structure", "structureFailure": 1 },
                        "tags": { "instance_region_code": "ID-SR", "district_id": null },
                        "title": null,
                        "text": "gempa"
                    }
                }]
            },
            "next": "eyJwa2V5IjozNTcxODF9"
        });

        let envelope: PageEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.result.features.len(), 1);
        assert_eq!(envelope.next.as_deref(), Some("eyJwa2V5IjozNTcxODF9"));

        let report: RawReport =
            serde_json::from_value(envelope.result.features[0].clone()).unwrap();
        let props = report.properties.unwrap();
        assert_eq!(props.disaster_type.as_deref(), Some("earthquake"));
        assert_eq!(props.source.as_deref(), Some("grasp"));
        assert!(props.title.is_none());
        let tags = props.tags.unwrap();
        assert_eq!(tags.instance_region_code.as_deref(), Some("ID-SR"));
    }

    #[test]
    fn mistyped_record_does_not_fail_the_page_decode() {
        let body = json!({
            "statusCode": 200,
            "result": {
                "type": "FeatureCollection",
                "features": [
                    { "properties": { "pkey": "1", "disaster_type": "flood" } },
                    { "properties": { "pkey": "2", "disaster_type": "flood", "is_training": "false" } }
                ]
            }
        });

        let envelope: PageEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.result.features.len(), 2);

        // The mistyped record fails only its own per-record decode.
        assert!(
            serde_json::from_value::<RawReport>(envelope.result.features[0].clone()).is_ok()
        );
        assert!(
            serde_json::from_value::<RawReport>(envelope.result.features[1].clone()).is_err()
        );
    }

    #[test]
    fn envelope_tolerates_missing_result() {
        let envelope: PageEnvelope =
            serde_json::from_value(serde_json::json!({ "statusCode": 200 })).unwrap();
        assert!(envelope.result.features.is_empty());
        assert!(envelope.next.is_none());
    }
}
