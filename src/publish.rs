//! Dataset publisher.
//!
//! Ensures the HDX dataset exists and carries the latest table. Absent:
//! create the dataset, then attach the CSV as its resource. Present:
//! refresh the metadata and overwrite the resource in place, keeping the
//! resource id stable for downstream links. Nothing is ever deleted.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::hdx::{CatalogApi, DatasetMeta, GroupRef, PublishError, ResourceMeta, TagRef};
use crate::report::RESOURCE_FILENAME;
use crate::window::TimeWindow;

const COUNTRY_NAME: &str = "Indonesia";
const COUNTRY_ISO3: &str = "IDN";
const ORGANIZATION_ID: &str = "a624903e-ff7c-4694-91c1-ef1ec0e0c692";
const MAINTAINER_ID: &str = "b682f6f7-cd7e-4bd4-8aa7-f74138dc6313";
const LICENSE_ID: &str = "cc-by";
const METHODOLOGY: &str = "Direct Observational Data/Anecdotal Data";
const DATASET_SOURCE: &str = "The Climate Emergency Software Alliance";
const UPDATE_FREQUENCY_DAYS: i32 = 1;
const FIXED_TAGS: [&str; 5] = [
    "flooding-storm surge",
    "earthquake-tsunami",
    "climate hazards",
    "natural disasters",
    "affected population",
];
const NOTES: &str = "[PetaBencana.id](https://docs.petabencana.id/v/master-1) by the \
[Climate Emergency Software Alliance (CESA)](https://cesa.global/) is a free and transparent \
platform for emergency response and disaster management in megacities in South and Southeast \
Asia. The platform harnesses the heightened use of social media during emergency events to \
gather, sort, and display confirmed hazard information in real-time.\n\
The platform adopts a “people are the best sensors” paradigm, where confirmed reports are \
collected directly from the users at street level in a manner that removes expensive and \
time-consuming data processing. This framework creates accurate, real-time data which is \
immediately made available for users and first responders.\n\
PetaBencana.id gathers, sorts, and visualizes data using specially developed CogniCity Open \
Source Software, to transform the noise of social and digital media into critical information \
for residents, communities, and government agencies.\n";

/// What a publish run did to the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAction {
    Created,
    Updated,
}

/// Deterministic dataset slug, derived from fixed text only. Window
/// contents never influence it, so repeated runs target the same dataset.
pub fn dataset_slug() -> String {
    slugify(&format!("CESA Disaster Reports for {COUNTRY_ISO3}"))
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Dataset metadata for this run; only the date range varies.
pub fn dataset_metadata(window: &TimeWindow) -> DatasetMeta {
    DatasetMeta {
        name: dataset_slug(),
        title: format!("{COUNTRY_NAME}: CESA Disaster Reports"),
        notes: NOTES.to_string(),
        dataset_date: window.dataset_date(),
        dataset_source: DATASET_SOURCE.to_string(),
        license_id: LICENSE_ID.to_string(),
        methodology: METHODOLOGY.to_string(),
        caveats: "None".to_string(),
        data_update_frequency: UPDATE_FREQUENCY_DAYS,
        maintainer: MAINTAINER_ID.to_string(),
        owner_org: ORGANIZATION_ID.to_string(),
        subnational: true,
        private: false,
        groups: vec![GroupRef {
            name: COUNTRY_ISO3.to_lowercase(),
        }],
        tags: FIXED_TAGS
            .iter()
            .map(|t| TagRef { name: t.to_string() })
            .collect(),
    }
}

fn resource_metadata(run_time: DateTime<Utc>) -> ResourceMeta {
    ResourceMeta {
        name: RESOURCE_FILENAME.to_string(),
        description: format!("All current disaster reports for {COUNTRY_NAME}"),
        format: "CSV".to_string(),
        last_modified: run_time.format("%Y-%m-%dT%H:%M:%S").to_string(),
    }
}

/// Create or update the dataset, then attach the table file. The dataset
/// write always lands before the resource write, so a failure can leave a
/// bare dataset but never a resource without its dataset.
pub async fn publish_table<C: CatalogApi + ?Sized>(
    catalog: &C,
    window: &TimeWindow,
    csv_path: &Path,
) -> Result<PublishAction, PublishError> {
    let meta = dataset_metadata(window);
    let resource = resource_metadata(window.end);

    match catalog.dataset_show(&meta.name).await? {
        None => {
            info!(name = %meta.name, "dataset absent, creating");
            let dataset = catalog.dataset_create(&meta).await?;
            catalog
                .resource_create(&dataset.id, &resource, csv_path)
                .await?;
            Ok(PublishAction::Created)
        }
        Some(existing) => {
            info!(name = %meta.name, id = %existing.id, "dataset present, updating in place");
            let dataset = catalog.dataset_update(&meta).await?;
            match existing.resources.iter().find(|r| r.name == resource.name) {
                Some(current) => {
                    catalog
                        .resource_update(&current.id, &resource, csv_path)
                        .await?
                }
                None => {
                    warn!(name = %meta.name, "dataset had no table resource, attaching one");
                    catalog
                        .resource_create(&dataset.id, &resource, csv_path)
                        .await?
                }
            }
            Ok(PublishAction::Updated)
        }
    }
}
