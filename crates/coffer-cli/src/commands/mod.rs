pub mod history;
pub mod migrate;
pub mod status;

use coffer::StoreDescriptor;
use std::path::Path;

/// Descriptor for a store file named on the command line. The
/// configuration name is the file stem.
pub fn descriptor_for(path: &Path) -> StoreDescriptor {
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Default".to_string());
    StoreDescriptor::on_disk(path, name)
}
