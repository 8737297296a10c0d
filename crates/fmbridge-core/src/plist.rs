//! AirTag plist export ingestion.
//!
//! Exports from Apple hardware arrive as plist files carrying already
//! decrypted locations, one file per device, dropped into a watched
//! directory. Each scan re-reads the whole directory; deduplication is
//! the forwarder's job, so re-reading a file only costs the parse.
//!
//! A broken file is skipped with a warning and never fails the scan.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use fmbridge_types::{BeaconId, LocationFix};

use crate::error::{Error, Result};

/// One export file as written by the device.
///
/// Field names follow the export format, not this crate's conventions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlistExport {
    /// Stable device identifier.
    identifier: String,
    /// Optional human-readable device name.
    name: Option<String>,
    #[serde(default)]
    locations: Vec<PlistLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlistLocation {
    timestamp: plist::Date,
    latitude: f64,
    longitude: f64,
    horizontal_accuracy: Option<f64>,
}

/// The parsed contents of one export file.
#[derive(Debug)]
pub struct PlistRecord {
    /// The file the record came from.
    pub path: PathBuf,
    /// Derived beacon identity for the exporting device.
    pub beacon: BeaconId,
    /// Device name from the export, if present.
    pub name: Option<String>,
    /// Usable fixes, sorted by timestamp ascending.
    pub fixes: Vec<LocationFix>,
}

/// The result of one directory scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Successfully parsed export files.
    pub records: Vec<PlistRecord>,
    /// Files that could not be parsed this scan.
    pub skipped: Vec<PathBuf>,
}

/// Reads plist exports from a configured directory.
#[derive(Debug, Clone)]
pub struct PlistSource {
    dir: PathBuf,
}

impl PlistSource {
    /// Create a source over the given export directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The watched directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory and parse every `.plist` file in it.
    ///
    /// A missing directory yields an empty outcome; exports are optional
    /// and the directory may not have been created yet.
    pub fn scan(&self) -> ScanOutcome {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("plist directory {} does not exist yet", self.dir.display());
                return ScanOutcome::default();
            }
            Err(e) => {
                warn!("cannot read plist directory {}: {}", self.dir.display(), e);
                return ScanOutcome::default();
            }
        };

        let mut outcome = ScanOutcome::default();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("plist") {
                continue;
            }
            match parse_export(&path) {
                Ok(record) => outcome.records.push(record),
                Err(e) => {
                    warn!("{}", e);
                    outcome.skipped.push(path);
                }
            }
        }
        outcome
    }
}

fn parse_export(path: &Path) -> Result<PlistRecord> {
    let export: PlistExport = plist::from_file(path).map_err(|e| Error::Plist {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let beacon = BeaconId::from_label(&export.identifier);
    let mut fixes = Vec::with_capacity(export.locations.len());
    for location in export.locations {
        match location_fix(&beacon, &location) {
            Ok(fix) => fixes.push(fix),
            Err(e) => warn!("{}: dropping location entry: {}", path.display(), e),
        }
    }
    fixes.sort_by_key(|fix| fix.timestamp);

    Ok(PlistRecord {
        path: path.to_path_buf(),
        beacon,
        name: export.name,
        fixes,
    })
}

fn location_fix(beacon: &BeaconId, location: &PlistLocation) -> Result<LocationFix> {
    if !(-90.0..=90.0).contains(&location.latitude)
        || !(-180.0..=180.0).contains(&location.longitude)
    {
        return Err(Error::protocol(
            "plist_location",
            format!(
                "coordinates out of range: {}, {}",
                location.latitude, location.longitude
            ),
        ));
    }

    let system_time: SystemTime = location.timestamp.into();
    let timestamp = OffsetDateTime::from(system_time);

    // Exports carry meter accuracy as a float; the wire format for fixes
    // is a single byte, so anything wider saturates.
    let accuracy = location
        .horizontal_accuracy
        .map(|a| a.clamp(0.0, 255.0) as u8)
        .unwrap_or(0);

    Ok(LocationFix {
        beacon: beacon.clone(),
        timestamp,
        latitude: location.latitude,
        longitude: location.longitude,
        accuracy,
        status: 0,
    })
}
