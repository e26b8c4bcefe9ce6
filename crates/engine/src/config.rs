use serde::Deserialize;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideConfig {
    /// Worker threads of the regeneration pool; 0 lets rayon decide.
    #[serde(default)]
    pub worker_threads: usize,
    /// Name of the hidden collection receiving new objects that have no natural place.
    #[serde(default = "default_hidden_collection_name")]
    pub hidden_collection_name: String,
}

fn default_hidden_collection_name() -> String {
    "OVERRIDE_HIDDEN".to_string()
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            hidden_collection_name: default_hidden_collection_name(),
        }
    }
}
