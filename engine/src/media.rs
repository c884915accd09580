use std::{collections::BTreeMap, path::PathBuf};

use serde_json::Value;

use crate::error::SessionError;

/// Season key -> ordered episode paths.
pub type Seasons = BTreeMap<String, Vec<PathBuf>>;

/// What a `/play` request asked for.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaSelection {
    SingleFile(PathBuf),
    SeriesMap {
        shows: BTreeMap<String, Seasons>,
        /// 1-based (season, episode) to start from.
        start: Option<(u32, u32)>,
    },
}

pub const SERIES_TYPE: &str = "TV Shows";

impl MediaSelection {
    /// `sorted_episodes` is `[]` for films and `{show: {"Season 01": [...]}}`
    /// for series. Anything other than a non-empty object means a single file.
    pub fn from_request(
        path: &str,
        media_type: Option<&str>,
        sorted_episodes: Option<&Value>,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> Result<Self, SessionError> {
        let series = match (media_type, sorted_episodes) {
            (Some(SERIES_TYPE), Some(Value::Object(map))) if !map.is_empty() => map,
            _ => return Ok(MediaSelection::SingleFile(PathBuf::from(path))),
        };

        let shows: BTreeMap<String, Seasons> = serde_json::from_value(Value::Object(series.clone()))
            .map_err(|e| SessionError::invalid("sorted_episodes", e.to_string()))?;

        let start = match (season, episode) {
            (Some(s), Some(e)) if s > 0 && e > 0 => Some((s, e)),
            (Some(_), Some(_)) => {
                return Err(SessionError::invalid("season/episode", "numbering starts at 1"));
            }
            _ => None,
        };

        Ok(MediaSelection::SeriesMap { shows, start })
    }

    /// Files to stream, in order.
    pub fn playlist(&self) -> Vec<PathBuf> {
        match self {
            MediaSelection::SingleFile(path) => vec![path.clone()],
            MediaSelection::SeriesMap { shows, start: None } => shows
                .values()
                .flat_map(|seasons| seasons.values())
                .flatten()
                .cloned()
                .collect(),
            MediaSelection::SeriesMap { shows, start: Some((season, episode)) } => {
                let key = season_key(*season);
                let skip = (*episode as usize).saturating_sub(1);
                shows
                    .values()
                    .filter_map(|seasons| seasons.get(&key))
                    .flat_map(|episodes| episodes.iter().skip(skip))
                    .cloned()
                    .collect()
            }
        }
    }
}

pub fn season_key(season: u32) -> String {
    format!("Season {season:02}")
}
