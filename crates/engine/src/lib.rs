pub mod batch;
pub mod config;
pub mod container;
pub mod create;
pub mod delete;
pub mod diff;
pub mod error;
pub mod group;
pub mod kinds;
pub mod reset;
pub mod resync;
pub mod snapshot;
pub mod status;
pub mod update;

pub use batch::{IdSnapshot, RegenerateReport};
pub use config::OverrideConfig;
pub use diff::{ApplyReport, CompareResult, OverrideDiffer, TreeDiffer};
pub use error::EngineError;
pub use group::{GroupTags, tag_linked_group, tag_local_group};
pub use kinds::{KindHandler, handler};

use liboverride_storage::Main;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Library-override engine over an entity database.
///
/// Owns the database for the duration of override work, the diff engine used to
/// record and apply operations, and the worker pool used for batch regeneration.
pub struct OverrideEngine {
    main: Main,
    config: OverrideConfig,
    differ: Box<dyn OverrideDiffer>,
    pool: ThreadPool,
}

impl OverrideEngine {
    pub fn new(main: Main) -> Result<Self, EngineError> {
        Self::with_config(main, OverrideConfig::default())
    }

    pub fn with_config(main: Main, config: OverrideConfig) -> Result<Self, EngineError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("override-worker-{i}"))
            .build()?;
        Ok(Self {
            main,
            config,
            differ: Box::new(TreeDiffer),
            pool,
        })
    }

    /// Replace the diff engine.
    pub fn with_differ(mut self, differ: impl OverrideDiffer + 'static) -> Self {
        self.differ = Box::new(differ);
        self
    }

    pub fn main(&self) -> &Main {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut Main {
        &mut self.main
    }

    pub fn into_main(self) -> Main {
        self.main
    }

    pub fn config(&self) -> &OverrideConfig {
        &self.config
    }

    pub fn differ(&self) -> &dyn OverrideDiffer {
        self.differ.as_ref()
    }
}
