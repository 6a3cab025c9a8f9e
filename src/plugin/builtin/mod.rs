pub mod files;
pub mod notes;

use std::sync::Arc;

use super::{InvalidPluginId, Plugin, PluginId, PluginIdentity};

pub use files::FilesPlugin;
pub use notes::NotesPlugin;

const AUTHOR: &str = "fluux";

fn identity(module: &str) -> Result<PluginIdentity, InvalidPluginId> {
    Ok(PluginIdentity {
        author: AUTHOR.to_string(),
        module: PluginId::new(module)?,
    })
}

/// Every plugin shipped with the host.
pub fn all() -> Result<Vec<Arc<dyn Plugin>>, InvalidPluginId> {
    Ok(vec![
        Arc::new(NotesPlugin::new()?),
        Arc::new(FilesPlugin::new()?),
    ])
}
