use std::sync::Arc;

use sealfs_core::SealfsResult;
use sealfs_crypto::{FormatParams, KeySet};

use crate::os::Clock;

/// Everything the object model needs from the unlocked filesystem.
///
/// Built once at mount time and shared by `Arc`.
#[derive(Clone)]
pub struct ModelParams {
    pub keys: KeySet,
    pub block_size: u32,
    pub iv_size: u32,
    pub max_padding: u32,
    pub store_time: bool,
    pub long_name_component: bool,
    pub clock: Arc<dyn Clock>,
}

impl ModelParams {
    pub fn from_format(format: &FormatParams, clock: Arc<dyn Clock>) -> SealfsResult<Self> {
        Ok(Self {
            keys: format.key_set()?,
            block_size: format.block_size,
            iv_size: format.iv_size,
            max_padding: format.max_padding,
            store_time: format.store_time(),
            long_name_component: format.long_name_component,
            clock,
        })
    }
}

impl std::fmt::Debug for ModelParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelParams")
            .field("keys", &"[REDACTED]")
            .field("block_size", &self.block_size)
            .field("iv_size", &self.iv_size)
            .field("max_padding", &self.max_padding)
            .field("store_time", &self.store_time)
            .field("long_name_component", &self.long_name_component)
            .finish_non_exhaustive()
    }
}
