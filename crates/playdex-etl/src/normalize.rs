//! Field-level cleaning of raw CSV cells. Every coercion is total: a value
//! that cannot be parsed becomes `None` (or `false` for flags) and is counted.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use playdex_core::{ApplicationAttributes, ApplicationDraft, RawRecord, BIGINT_MAX};
use tracing::debug;

const DATE_FORMATS: [&str; 5] = ["%b %d, %Y", "%B %d, %Y", "%Y-%m-%d", "%m/%d/%Y", "%d %b %Y"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// Per-column count of cells that were present but could not be kept as given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldIssues {
    pub unparseable: BTreeMap<&'static str, usize>,
    pub oversized: BTreeMap<&'static str, usize>,
}

impl FieldIssues {
    fn note_unparseable(&mut self, app_id: &str, column: &'static str) {
        debug!(app_id, column, "unparseable value set to null");
        *self.unparseable.entry(column).or_default() += 1;
    }

    fn note_oversized(&mut self, app_id: &str, column: &'static str) {
        debug!(app_id, column, "integer exceeds BIGINT range, set to null");
        *self.oversized.entry(column).or_default() += 1;
    }

    pub fn total(&self) -> usize {
        self.unparseable.values().sum::<usize>() + self.oversized.values().sum::<usize>()
    }
}

/// Upper-cases the first letter of every alphabetic run and lower-cases the rest.
///
/// Non-letters (digits, spaces, punctuation) end a run, so `"3d games"` becomes
/// `"3D Games"` and `"o'neil"` becomes `"O'Neil"`.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_word = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

fn present(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|v| !v.is_empty())
}

/// Trimmed, title-cased dimension name; blank means absent.
pub fn clean_name(raw: Option<&str>) -> Option<String> {
    present(raw).map(title_case)
}

/// Trimmed text with no case change; blank means absent.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    present(raw).map(str::to_string)
}

/// Strips a leading currency marker (`$`, `US$`, `€`) and comma thousands
/// separators, then parses a decimal. Anything else left over is rejected.
pub fn parse_price(raw: Option<&str>) -> Result<Option<f64>, ()> {
    let Some(value) = present(raw) else {
        return Ok(None);
    };
    let amount = value
        .trim_start_matches(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-')))
        .trim();
    if amount.is_empty()
        || !amount
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
    {
        return Err(());
    }
    match strip_thousands(amount)?.parse::<f64>() {
        Ok(price) if price.is_finite() => Ok(Some(price)),
        _ => Err(()),
    }
}

// Commas are only accepted as three-digit group separators in the integer part.
fn strip_thousands(amount: &str) -> Result<String, ()> {
    if !amount.contains(',') {
        return Ok(amount.to_string());
    }
    let (integer, fraction) = amount.split_once('.').unwrap_or((amount, ""));
    if fraction.contains(',') {
        return Err(());
    }
    let mut groups = integer.trim_start_matches('-').split(',');
    let lead = groups.next().unwrap_or_default();
    if lead.is_empty() || lead.len() > 3 || groups.any(|g| g.len() != 3) {
        return Err(());
    }
    Ok(amount.replace(',', ""))
}

pub fn parse_float(raw: Option<&str>) -> Result<Option<f64>, ()> {
    let Some(value) = present(raw) else {
        return Ok(None);
    };
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountError {
    Unparseable,
    Oversized,
}

/// Parses an integer count. Integral decimal text (`"10.0"`) is accepted and
/// fractions round to nearest; anything at or above `BIGINT_MAX` is rejected.
pub fn parse_count(raw: Option<&str>) -> Result<Option<i64>, CountError> {
    let Some(value) = present(raw) else {
        return Ok(None);
    };
    if let Ok(v) = value.parse::<i64>() {
        return if v >= BIGINT_MAX {
            Err(CountError::Oversized)
        } else {
            Ok(Some(v))
        };
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => {
            let rounded = v.round();
            // i64::MAX as f64 rounds up to 2^63, so `>=` also catches values just past the limit.
            if rounded >= BIGINT_MAX as f64 || rounded < i64::MIN as f64 {
                Err(CountError::Oversized)
            } else {
                Ok(Some(rounded as i64))
            }
        }
        _ => Err(CountError::Unparseable),
    }
}

pub fn parse_date(raw: Option<&str>) -> Result<Option<NaiveDate>, ()> {
    let Some(value) = present(raw) else {
        return Ok(None);
    };
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Ok(Some(date));
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Some(ts.date()));
        }
    }
    Err(())
}

pub fn parse_flag(raw: Option<&str>) -> Result<bool, ()> {
    let Some(value) = present(raw) else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "t" => Ok(true),
        "false" | "0" | "no" | "n" | "f" => Ok(false),
        _ => Err(()),
    }
}

/// Key present and not blank. The key itself is kept verbatim.
pub fn record_key(raw: &RawRecord) -> Option<&str> {
    raw.app_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
}

/// Cleans one raw row into a draft. Returns `None` only when the key is missing.
pub fn normalize_record(raw: &RawRecord, issues: &mut FieldIssues) -> Option<ApplicationDraft> {
    let app_id = record_key(raw)?.to_string();

    let mut float = |column: &'static str, value: &Option<String>| {
        parse_float(value.as_deref()).unwrap_or_else(|()| {
            issues.note_unparseable(&app_id, column);
            None
        })
    };
    let rating = float("Rating", &raw.rating);

    let mut count = |column: &'static str, value: &Option<String>| match parse_count(value.as_deref()) {
        Ok(v) => v,
        Err(CountError::Unparseable) => {
            issues.note_unparseable(&app_id, column);
            None
        }
        Err(CountError::Oversized) => {
            issues.note_oversized(&app_id, column);
            None
        }
    };
    let rating_count = count("Rating Count", &raw.rating_count);
    let installs = count("Installs", &raw.installs);
    let min_installs = count("Minimum Installs", &raw.min_installs);
    let max_installs = count("Maximum Installs", &raw.max_installs);

    let price = parse_price(raw.price.as_deref()).unwrap_or_else(|()| {
        issues.note_unparseable(&app_id, "Price");
        None
    });

    let mut date = |column: &'static str, value: &Option<String>| {
        parse_date(value.as_deref()).unwrap_or_else(|()| {
            issues.note_unparseable(&app_id, column);
            None
        })
    };
    let released = date("Released", &raw.released);
    let last_updated = date("Last Updated", &raw.last_updated);

    let mut flag = |column: &'static str, value: &Option<String>| {
        parse_flag(value.as_deref()).unwrap_or_else(|()| {
            issues.note_unparseable(&app_id, column);
            false
        })
    };
    let free = flag("Free", &raw.free);
    let ad_supported = flag("Ad Supported", &raw.ad_supported);
    let has_in_app_purchases = flag("In App Purchases", &raw.has_in_app_purchases);
    let is_editors_choice = flag("Editors Choice", &raw.is_editors_choice);

    Some(ApplicationDraft {
        app_id,
        name: raw.app_name.clone(),
        category: clean_name(raw.category.as_deref()),
        developer: clean_name(raw.developer.as_deref()),
        attributes: ApplicationAttributes {
            rating,
            rating_count,
            installs,
            min_installs,
            max_installs,
            free,
            price,
            currency: raw.currency.clone(),
            size: raw.size.clone(),
            min_os_version: raw.min_os_version.clone(),
            released,
            last_updated,
            content_rating: clean_text(raw.content_rating.as_deref()),
            privacy_policy_url: raw.privacy_policy_url.clone(),
            ad_supported,
            has_in_app_purchases,
            is_editors_choice,
            scraped_at: raw.scraped_at.clone(),
        },
    })
}
