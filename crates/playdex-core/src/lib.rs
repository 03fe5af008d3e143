//! Core domain model for the Play Store dataset: raw rows, normalized drafts,
//! persisted rows and reporting shapes.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "playdex-core";

/// Largest value the `BIGINT` columns can hold. Parsed integers at or above it are dropped to `None`.
pub const BIGINT_MAX: i64 = i64::MAX;

/// One row of the raw CSV export, keyed by its header names.
///
/// Every column is optional text: an empty cell reads as `None`. Equality and
/// hashing cover every column, which is what exact-duplicate removal relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    #[serde(rename = "App Name")]
    pub app_name: Option<String>,
    #[serde(rename = "App Id")]
    pub app_id: Option<String>,
    #[serde(rename = "Category")]
    pub category: Option<String>,
    #[serde(rename = "Rating")]
    pub rating: Option<String>,
    #[serde(rename = "Rating Count")]
    pub rating_count: Option<String>,
    #[serde(rename = "Installs")]
    pub installs: Option<String>,
    #[serde(rename = "Minimum Installs")]
    pub min_installs: Option<String>,
    #[serde(rename = "Maximum Installs")]
    pub max_installs: Option<String>,
    #[serde(rename = "Free")]
    pub free: Option<String>,
    #[serde(rename = "Price")]
    pub price: Option<String>,
    #[serde(rename = "Currency")]
    pub currency: Option<String>,
    #[serde(rename = "Size")]
    pub size: Option<String>,
    #[serde(rename = "Minimum Android")]
    pub min_os_version: Option<String>,
    #[serde(rename = "Developer Id")]
    pub developer: Option<String>,
    #[serde(rename = "Released")]
    pub released: Option<String>,
    #[serde(rename = "Last Updated")]
    pub last_updated: Option<String>,
    #[serde(rename = "Content Rating")]
    pub content_rating: Option<String>,
    #[serde(rename = "Privacy Policy")]
    pub privacy_policy_url: Option<String>,
    #[serde(rename = "Ad Supported")]
    pub ad_supported: Option<String>,
    #[serde(rename = "In App Purchases")]
    pub has_in_app_purchases: Option<String>,
    #[serde(rename = "Editors Choice")]
    pub is_editors_choice: Option<String>,
    #[serde(rename = "Scraped Time")]
    pub scraped_at: Option<String>,
}

/// Normalized application that still refers to its dimensions by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDraft {
    pub app_id: String,
    pub name: Option<String>,
    pub category: Option<String>,
    pub developer: Option<String>,
    #[serde(flatten)]
    pub attributes: ApplicationAttributes,
}

/// Every application column that is neither the key nor a dimension reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationAttributes {
    pub rating: Option<f64>,
    pub rating_count: Option<i64>,
    pub installs: Option<i64>,
    pub min_installs: Option<i64>,
    pub max_installs: Option<i64>,
    #[serde(default)]
    pub free: bool,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub size: Option<String>,
    pub min_os_version: Option<String>,
    pub released: Option<NaiveDate>,
    pub last_updated: Option<NaiveDate>,
    pub content_rating: Option<String>,
    pub privacy_policy_url: Option<String>,
    #[serde(default)]
    pub ad_supported: bool,
    #[serde(default)]
    pub has_in_app_purchases: bool,
    #[serde(default)]
    pub is_editors_choice: bool,
    pub scraped_at: Option<String>,
}

/// Persisted application row, referencing its dimensions by surrogate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub app_id: String,
    pub name: Option<String>,
    pub category_id: i32,
    pub developer_id: i32,
    #[serde(flatten)]
    pub attributes: ApplicationAttributes,
}

impl Application {
    pub fn from_draft(draft: ApplicationDraft, category_id: i32, developer_id: i32) -> Self {
        Self {
            app_id: draft.app_id,
            name: draft.name,
            category_id,
            developer_id,
            attributes: draft.attributes,
        }
    }
}

/// Row of either lookup table: a surrogate id and a unique name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: i32,
    pub name: String,
}

pub type Category = Dimension;
pub type Developer = Dimension;

/// Which of the two lookup tables a dimension operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Category,
    Developer,
}

impl DimensionKind {
    pub fn table(self) -> &'static str {
        match self {
            DimensionKind::Category => "categories",
            DimensionKind::Developer => "developers",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DimensionKind::Category => "category",
            DimensionKind::Developer => "developer",
        }
    }
}

/// A named umbrella over several store categories, used as a reporting filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryGroups(pub Vec<CategoryGroup>);

impl CategoryGroups {
    pub fn members(&self, group: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|g| g.name.eq_ignore_ascii_case(group))
            .map(|g| g.members.as_slice())
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|g| g.name.as_str()).collect()
    }
}

impl Default for CategoryGroups {
    fn default() -> Self {
        let group = |name: &str, members: &[&str]| CategoryGroup {
            name: name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        };
        Self(vec![
            group(
                "Games",
                &[
                    "Adventure",
                    "Racing",
                    "Puzzle",
                    "Arcade",
                    "Board",
                    "Casual",
                    "Card",
                    "Strategy",
                    "Trivia",
                    "Word",
                    "Action",
                    "Simulation",
                    "Music",
                    "Role Playing",
                    "Casino",
                ],
            ),
            group(
                "Tools",
                &[
                    "Tools",
                    "Productivity",
                    "Communication",
                    "Libraries & Demo",
                    "Personalization",
                    "Auto & Vehicles",
                ],
            ),
            group("Education", &["Education", "Educational", "Books & Reference"]),
            group(
                "Entertainment",
                &[
                    "Photography",
                    "Video Players & Editors",
                    "Music & Audio",
                    "Comics",
                    "Entertainment",
                ],
            ),
            group("Social", &["Social", "Dating"]),
            group("Health & Wellness", &["Medical", "Health & Fitness"]),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceFilter {
    #[default]
    All,
    Free,
    Paid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateField {
    #[default]
    Released,
    LastUpdated,
}

impl DateField {
    pub fn column(self) -> &'static str {
        match self {
            DateField::Released => "released",
            DateField::LastUpdated => "last_updated",
        }
    }
}

/// Filter for the application search report. `categories` empty means every category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSearch {
    pub rating_min: f64,
    pub rating_max: f64,
    pub categories: Vec<String>,
    pub price: PriceFilter,
    pub content_rating: Option<String>,
    pub limit: i64,
}

impl Default for AppSearch {
    fn default() -> Self {
        Self {
            rating_min: 0.0,
            rating_max: 5.0,
            categories: Vec::new(),
            price: PriceFilter::All,
            content_rating: None,
            limit: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSearchRow {
    pub app_id: String,
    pub app_name: Option<String>,
    pub category_name: String,
    pub rating: Option<f64>,
    pub price: Option<f64>,
    pub content_rating: Option<String>,
    pub last_updated: Option<NaiveDate>,
    pub developer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearCount {
    pub year: i32,
    pub app_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRating {
    pub category: String,
    pub avg_rating: Option<f64>,
}

/// Whole-star bucket: `bucket` 4 counts ratings in `[4.0, 5.0)`, and 5 holds exact 5.0 ratings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingBucket {
    pub bucket: i32,
    pub app_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_groups_carry_umbrella_members() {
        let groups = CategoryGroups::default();
        assert_eq!(groups.names().len(), 6);
        assert_eq!(
            groups.members("social").unwrap(),
            &["Social".to_string(), "Dating".to_string()]
        );
        assert!(groups.members("Weather").is_none());
    }

    #[test]
    fn application_serializes_flat() {
        let app = Application {
            app_id: "com.a.b".into(),
            name: Some("A".into()),
            category_id: 1,
            developer_id: 2,
            attributes: ApplicationAttributes {
                price: Some(1.99),
                free: false,
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&app).unwrap();
        assert_eq!(value["app_id"], "com.a.b");
        assert_eq!(value["price"], 1.99);
        assert_eq!(value["category_id"], 1);
        let back: Application = serde_json::from_value(value).unwrap();
        assert_eq!(back, app);
    }
}
