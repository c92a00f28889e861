//! Host instance id persisted across restarts.

use std::path::Path;

use anyhow::{Context, Result};
use corral_id::HostId;
use tracing::info;

const FILE_NAME: &str = "instance_id";

/// Returns the id stored under `data_dir`, creating it on first boot.
pub fn load_or_create(data_dir: &Path) -> Result<HostId> {
    let path = data_dir.join(FILE_NAME);
    match std::fs::read_to_string(&path) {
        Ok(raw) => HostId::parse(raw.trim())
            .with_context(|| format!("{} does not hold a valid id", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("creating {}", data_dir.display()))?;
            let id = HostId::generate();
            std::fs::write(&path, id.as_str())
                .with_context(|| format!("writing {}", path.display()))?;
            info!(host_id = %id, path = %path.display(), "Generated host instance id");
            Ok(id)
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
