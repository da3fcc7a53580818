//! INI parsing: `Ini` → `ConfigFile`, plus the value parsers it uses.
//!
//! This is the single place where INI key names are mapped to struct fields.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use ini::{Ini, Properties};

use super::settings::{ConfigFile, GridKind, TaskSettings, MAX_GRID_LEVELS};
use super::ConfigFileError;
use crate::grid::BBox;

/// Prefix of task section names.
pub const TASK_SECTION_PREFIX: &str = "task.";

/// Prefix of dimension keys inside a task section.
pub const DIMENSION_KEY_PREFIX: &str = "dim.";

/// Parses an `Ini` into a `ConfigFile`, resolving relative ages against `now`.
///
/// Starts from `ConfigFile::default()` and overlays any values found.
pub(super) fn parse_ini(ini: &Ini, now: DateTime<Utc>) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [grid]
    if let Some(section) = ini.section(Some("grid")) {
        if let Some(v) = section.get("type") {
            config.grid.kind = v.parse().map_err(|_| {
                invalid("grid", "type", v, "must be 'web_mercator' or 'geodetic'")
            })?;
        }
        if let Some(v) = section.get("levels") {
            config.grid.levels = match v.trim().parse::<u8>() {
                Ok(n) if n > 0 && n <= MAX_GRID_LEVELS => n,
                _ => return Err(invalid("grid", "levels", v, "must be an integer in 1..=32")),
            };
        }
        if let Some(v) = section.get("meta_size") {
            config.grid.meta_size = parse_pair(v)
                .filter(|(x, y)| *x > 0 && *y > 0)
                .ok_or_else(|| invalid("grid", "meta_size", v, "expected format like '4,4'"))?;
        }
        if let Some(v) = section.get("meta_buffer") {
            config.grid.meta_buffer = v
                .trim()
                .parse()
                .map_err(|_| invalid("grid", "meta_buffer", v, "must be a non-negative integer"))?;
        }
    }

    // [cache]
    if let Some(section) = ini.section(Some("cache")) {
        if let Some(v) = non_empty(section.get("name")) {
            config.cache.name = v.to_string();
        }
        if let Some(v) = non_empty(section.get("directory")) {
            config.cache.directory = expand_tilde(v);
        }
        if let Some(v) = non_empty(section.get("extension")) {
            config.cache.extension = v.trim_start_matches('.').to_string();
        }
        if let Some(v) = non_empty(section.get("source")) {
            config.cache.source_url = Some(v.to_string());
        }
        if let Some(v) = section.get("timeout") {
            config.cache.timeout_secs = match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(invalid("cache", "timeout", v, "must be a positive integer (seconds)"))
                }
            };
        }
    }

    // [seed]
    if let Some(section) = ini.section(Some("seed")) {
        if let Some(v) = section.get("concurrency") {
            config.seed.concurrency = match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid("seed", "concurrency", v, "must be a positive integer")),
            };
        }
        if let Some(v) = section.get("skip_geoms_for_last_levels") {
            config.seed.skip_geoms_for_last_levels = v.trim().parse().map_err(|_| {
                invalid("seed", "skip_geoms_for_last_levels", v, "must be a non-negative integer")
            })?;
        }
        if let Some(v) = non_empty(section.get("progress_file")) {
            config.seed.progress_file = expand_tilde(v);
        }
        if let Some(v) = section.get("retry_attempts") {
            config.seed.retry_attempts = match v.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid("seed", "retry_attempts", v, "must be a positive integer")),
            };
        }
        if let Some(v) = section.get("step_interval_ms") {
            config.seed.step_interval_ms = v.trim().parse().map_err(|_| {
                invalid("seed", "step_interval_ms", v, "must be a non-negative integer (milliseconds)")
            })?;
        }
        if let Some(v) = section.get("lock_retry_delay") {
            config.seed.lock_retry_delay_secs = v.trim().parse().map_err(|_| {
                invalid("seed", "lock_retry_delay", v, "must be a non-negative integer (seconds)")
            })?;
        }
    }

    // [task.<name>]
    for (name, section) in ini.iter() {
        let Some(task_name) = name.and_then(|n| n.strip_prefix(TASK_SECTION_PREFIX)) else {
            continue;
        };
        config.tasks.push(parse_task(task_name, section, now)?);
    }

    Ok(config)
}

fn parse_task(
    name: &str,
    section: &Properties,
    now: DateTime<Utc>,
) -> Result<TaskSettings, ConfigFileError> {
    let section_name = format!("{}{}", TASK_SECTION_PREFIX, name);
    let mut task = TaskSettings {
        name: name.to_string(),
        ..TaskSettings::default()
    };

    let levels = section.get("levels").ok_or_else(|| ConfigFileError::MissingValue {
        section: section_name.clone(),
        key: "levels".to_string(),
    })?;
    task.levels = parse_levels(levels)
        .map_err(|reason| invalid(&section_name, "levels", levels, &reason))?;

    if let Some(v) = non_empty(section.get("bbox")) {
        task.bbox = Some(parse_bbox(v).map_err(|reason| invalid(&section_name, "bbox", v, &reason))?);
    }
    if let Some(v) = non_empty(section.get("refresh_before")) {
        task.refresh_before = Some(
            parse_timestamp(v, now)
                .map_err(|reason| invalid(&section_name, "refresh_before", v, &reason))?,
        );
    }
    if let Some(v) = non_empty(section.get("remove_before")) {
        task.remove_before = Some(
            parse_timestamp(v, now)
                .map_err(|reason| invalid(&section_name, "remove_before", v, &reason))?,
        );
    }
    if let Some(v) = non_empty(section.get("export_directory")) {
        task.export_directory = Some(expand_tilde(v));
    }
    for (key, value) in section.iter() {
        if let Some(dim) = key.strip_prefix(DIMENSION_KEY_PREFIX) {
            task.dimensions.insert(dim.to_string(), value.trim().to_string());
        }
    }

    Ok(task)
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_pair(value: &str) -> Option<(u32, u32)> {
    let (a, b) = value.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Parses a level list: `3`, `0,2,4`, `0-5` or a mix such as `0-2,5`.
///
/// The result is sorted and free of duplicates.
pub fn parse_levels(value: &str) -> Result<Vec<u8>, String> {
    let mut levels = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((from, to)) => {
                let from = parse_level(from)?;
                let to = parse_level(to)?;
                if from > to {
                    return Err(format!("range {} is reversed", part));
                }
                levels.extend(from..=to);
            }
            None => levels.push(parse_level(part)?),
        }
    }
    if levels.is_empty() {
        return Err("expected levels like '3', '0,2,4' or '0-5'".to_string());
    }
    levels.sort_unstable();
    levels.dedup();
    Ok(levels)
}

fn parse_level(value: &str) -> Result<u8, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a level (0-255)", value.trim()))
}

/// Parses `minx,miny,maxx,maxy`.
pub fn parse_bbox(value: &str) -> Result<BBox, String> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| "expected four numbers 'minx,miny,maxx,maxy'".to_string())?;
    if parts.len() != 4 {
        return Err("expected four numbers 'minx,miny,maxx,maxy'".to_string());
    }
    BBox::new(parts[0], parts[1], parts[2], parts[3]).map_err(|e| e.to_string())
}

/// Parses an RFC 3339 timestamp or an age relative to `now`
/// (`30s`, `15m`, `12h`, `7d`, `2w`).
pub fn parse_timestamp(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }

    let reason = || "expected RFC 3339 time or an age like '7d', '12h', '30m'".to_string();
    let unit = value.chars().last().ok_or_else(reason)?;
    let amount: i64 = value[..value.len() - unit.len_utf8()]
        .trim()
        .parse()
        .map_err(|_| reason())?;
    let age = match unit {
        's' => Duration::try_seconds(amount),
        'm' => Duration::try_minutes(amount),
        'h' => Duration::try_hours(amount),
        'd' => Duration::try_days(amount),
        'w' => Duration::try_weeks(amount),
        _ => None,
    }
    .filter(|d| *d >= Duration::zero())
    .ok_or_else(reason)?;
    now.checked_sub_signed(age).ok_or_else(reason)
}

/// Expands a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
