use thiserror::Error;

mod keyset;
mod status;

pub use keyset::{
    API_LABEL_PREFIX, API_SHAPE_CATEGORY_PREFIX, KeySetFile, KeySetStore, LabelCategory,
    MESSAGE_LABEL, PAYLOAD_LABEL_PREFIX, UPDATE_LABEL, shape_keys,
};
pub use status::{DEFAULT_IGNORED_SCOPE, ResetOverlay, SEED_SCOPE, StatusStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] shapewatch_config::ConfigError),
}
