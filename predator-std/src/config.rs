//! Region file persistence.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use predator::compliance::{format_region_line, parse_region_line, Region};

/// Read the region file. A missing file means no region has been chosen yet.
pub fn load_region(path: &Path) -> Result<Region> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let region = parse_region_line(&contents);
            if region == Region::Unknown {
                log::warn!(
                    "Region file {} holds no known code, transmissions disabled",
                    path.display()
                );
            } else {
                log::info!("Region {} loaded from {}", region.code(), path.display());
            }
            Ok(region)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::warn!(
                "No region file at {}, transmissions disabled until a region is set",
                path.display()
            );
            Ok(Region::Unknown)
        }
        Err(e) => Err(e).with_context(|| format!("reading region file {}", path.display())),
    }
}

pub fn save_region(path: &Path, region: Region) -> Result<()> {
    let mut line = heapless::String::<4>::new();
    format_region_line(region, &mut line);
    fs::write(path, line.as_bytes())
        .with_context(|| format!("writing region file {}", path.display()))?;
    log::info!("Region {} saved to {}", region.code(), path.display());
    Ok(())
}
