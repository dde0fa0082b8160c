use crate::core::registry::SatelliteRegistry;
use crate::types::{Direction, MinsarError, MinsarResult};
use regex::Regex;
use std::sync::OnceLock;

/// Project name split into its `<Region><Sat><Direction><Track>` parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectName {
    pub name: String,
    pub region: String,
    /// Satellite abbreviation as written in the name (`Sen`, `Tsx`, ...)
    pub satellite: String,
    pub direction: Direction,
    pub track: u32,
}

fn direction_track_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<head>.+)(?P<dir>AT|DT)(?P<track>\d+)$").unwrap())
}

impl ProjectName {
    /// Parse against the abbreviations of the built-in satellite registry
    pub fn parse(name: &str) -> MinsarResult<Self> {
        let registry = SatelliteRegistry::builtin()?;
        let abbreviations: Vec<&str> = registry.iter().map(|s| s.abbreviation).collect();
        Self::parse_with(name, &abbreviations)
    }

    /// Parse with an explicit abbreviation list. The longest abbreviation
    /// directly in front of the direction token wins (`PazTsx` over `Tsx`).
    pub fn parse_with(name: &str, abbreviations: &[&str]) -> MinsarResult<Self> {
        let name = name.trim();
        let caps = direction_track_regex().captures(name).ok_or_else(|| {
            MinsarError::InvalidFormat(format!(
                "project name '{}' does not end in AT<track> or DT<track>",
                name
            ))
        })?;

        let head = &caps["head"];
        let satellite = abbreviations
            .iter()
            .filter(|abbr| !abbr.is_empty() && head.len() > abbr.len() && head.ends_with(**abbr))
            .max_by_key(|abbr| abbr.len())
            .ok_or_else(|| {
                MinsarError::UnknownSatellite(format!(
                    "no satellite abbreviation in project name '{}'",
                    name
                ))
            })?;

        let direction = Direction::from_token(&caps["dir"]).ok_or_else(|| {
            MinsarError::InvalidFormat(format!("bad direction in '{}'", name))
        })?;
        let track = caps["track"].parse::<u32>().map_err(|e| {
            MinsarError::InvalidFormat(format!("bad track number in '{}': {}", name, e))
        })?;

        Ok(Self {
            name: name.to_string(),
            region: head[..head.len() - satellite.len()].to_string(),
            satellite: satellite.to_string(),
            direction,
            track,
        })
    }
}

impl std::fmt::Display for ProjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            self.region,
            self.satellite,
            self.direction.token(),
            self.track
        )
    }
}
