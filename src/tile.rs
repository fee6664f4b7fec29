//! Value types shared by every stage of an acquisition run.
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifier of one remote scene, e.g. the catalog "system index"
/// `20240704T194909_20240704T195532_T08VPH`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileId(String);

impl TileId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("Tile id is empty".to_string()));
        }
        // The id names a file in the cache directory
        if trimmed.contains(['/', '\\']) || trimmed == "." || trimmed == ".." {
            return Err(Error::InvalidInput(format!(
                "Tile id is not usable as a file name: {id}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TileId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TileId> for String {
    fn from(id: TileId) -> Self {
        id.0
    }
}

/// Ordered selection of remote bands, each paired with the channel name it is
/// exported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandMapping {
    bands: Vec<(String, String)>,
}

impl BandMapping {
    pub fn new<I, R, C>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (R, C)>,
        R: Into<String>,
        C: Into<String>,
    {
        let bands: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(r, c)| (r.into(), c.into()))
            .collect();
        if bands.is_empty() {
            return Err(Error::InvalidInput("Band mapping is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for (remote, channel) in &bands {
            if remote.is_empty() || channel.is_empty() {
                return Err(Error::InvalidInput(
                    "Band mapping contains an empty name".to_string(),
                ));
            }
            if !seen.insert(remote.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Band {remote} is selected twice"
                )));
            }
        }
        Ok(Self { bands })
    }

    pub fn remote_bands(&self) -> Vec<&str> {
        self.bands.iter().map(|(r, _)| r.as_str()).collect()
    }

    pub fn channels(&self) -> Vec<&str> {
        self.bands.iter().map(|(_, c)| c.as_str()).collect()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bands.iter().map(|(r, c)| (r.as_str(), c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

impl Default for BandMapping {
    fn default() -> Self {
        Self {
            bands: [("B2", "blue"), ("B3", "green"), ("B4", "red"), ("B8", "nir")]
                .into_iter()
                .map(|(r, c)| (r.to_string(), c.to_string()))
                .collect(),
        }
    }
}

/// Half-open acquisition window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateRange {
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let start = parse_period_start(start)?;
        let end = parse_period_start(end)?;
        Self::new(start, end)
    }

    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidInput(format!(
                "Date range is empty: {start} is not before {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

/// First instant of the period named by `value`: a year, a month, a day, or
/// an exact RFC 3339 timestamp.
fn parse_period_start(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    let invalid = || Error::InvalidInput(format!("Unrecognised date: {value:?}"));

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.and_utc());
    }

    let parts: Vec<&str> = value.split('-').collect();
    let number = |s: &str| s.parse::<u32>().map_err(|_| invalid());
    let (year, month, day) = match parts.as_slice() {
        [y] if y.len() == 4 => (number(y)?, 1, 1),
        [y, m] if y.len() == 4 => (number(y)?, number(m)?, 1),
        [y, m, d] if y.len() == 4 => (number(y)?, number(m)?, number(d)?),
        _ => return Err(invalid()),
    };
    let date = NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(invalid)?;
    Ok(date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc())
}

/// Cloud cover threshold in percent; scenes must be strictly below it.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct CloudCover(f64);

impl CloudCover {
    pub fn new(percent: f64) -> Result<Self> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(Error::InvalidInput(format!(
                "Cloud cover must be within 0..=100, got {percent}"
            )));
        }
        Ok(Self(percent))
    }

    pub fn percent(&self) -> f64 {
        self.0
    }

    pub fn admits(&self, scene_cloud_cover: f64) -> bool {
        scene_cloud_cover < self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_id_rejects_path_like_values() {
        assert!(TileId::new("").is_err());
        assert!(TileId::new("   ").is_err());
        assert!(TileId::new("../etc").is_err());
        assert!(TileId::new("a/b").is_err());
        assert_eq!(TileId::new(" T08VPH ").unwrap().as_str(), "T08VPH");
    }

    #[test]
    fn test_tile_ids_order_lexicographically() {
        let mut ids = vec![
            TileId::new("20240704_T08VPH").unwrap(),
            TileId::new("20240701_T08VPH").unwrap(),
            TileId::new("20240702_T08VNH").unwrap(),
        ];
        ids.sort();
        let ids: Vec<_> = ids.iter().map(|i| i.as_str()).collect();
        assert_eq!(
            ids,
            vec!["20240701_T08VPH", "20240702_T08VNH", "20240704_T08VPH"]
        );
    }

    #[test]
    fn test_default_band_mapping() {
        let bands = BandMapping::default();
        assert_eq!(bands.remote_bands(), vec!["B2", "B3", "B4", "B8"]);
        assert_eq!(bands.channels(), vec!["blue", "green", "red", "nir"]);
        assert_eq!(bands.len(), 4);
        assert!(!bands.is_empty());
    }

    #[test]
    fn test_band_mapping_validation() {
        assert!(BandMapping::new(Vec::<(String, String)>::new()).is_err());
        assert!(BandMapping::new([("B2", "blue"), ("B2", "other")]).is_err());
        let bands = BandMapping::new([("B8", "nir"), ("B2", "blue")]).unwrap();
        // Order is preserved as given
        assert_eq!(bands.remote_bands(), vec!["B8", "B2"]);
    }

    #[test]
    fn test_partial_dates_expand_to_period_start() {
        let range = DateRange::parse("2024-07", "2024-09").unwrap();
        assert_eq!(range.start().to_rfc3339(), "2024-07-01T00:00:00+00:00");
        assert_eq!(range.end().to_rfc3339(), "2024-09-01T00:00:00+00:00");

        let range = DateRange::parse("2023", "2023-01-31").unwrap();
        assert_eq!(range.start().to_rfc3339(), "2023-01-01T00:00:00+00:00");
        assert_eq!(range.end().to_rfc3339(), "2023-01-31T00:00:00+00:00");
    }

    #[test]
    fn test_date_range_rejects_empty_and_garbage() {
        assert!(DateRange::parse("2024-09", "2024-07").is_err());
        assert!(DateRange::parse("2024-07", "2024-07").is_err());
        assert!(DateRange::parse("July", "2024-09").is_err());
        assert!(DateRange::parse("2024-13", "2025").is_err());
    }

    #[test]
    fn test_cloud_cover_is_strict() {
        let threshold = CloudCover::new(20.0).unwrap();
        assert!(threshold.admits(19.9));
        assert!(!threshold.admits(20.0));
        assert!(CloudCover::new(101.0).is_err());
        assert!(CloudCover::new(-1.0).is_err());
    }
}
