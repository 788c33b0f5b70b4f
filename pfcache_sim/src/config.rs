use anyhow::Result;
use serde::Deserialize;

use crate::{
    addr::CacheGeometry,
    consumer::ConsumerConfig,
    memory::{BusConfig, DEFAULT_MEMORY_WORDS},
};

/// Everything a simulation run is parameterised by. Every field may be
/// omitted from the JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub geometry: CacheGeometry,
    pub bus: BusConfig,
    pub consumer: ConsumerConfig,
    /// size of the backing memory in words, grown to fit the image
    pub memory_words: usize,
    pub max_cycles: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            geometry: CacheGeometry::default(),
            bus: BusConfig::default(),
            consumer: ConsumerConfig::default(),
            memory_words: DEFAULT_MEMORY_WORDS,
            max_cycles: None,
        }
    }
}

impl SimConfig {
    pub fn deser(file: impl std::io::Read) -> Result<Self> {
        let config: Self = serde_json::from_reader(file)?;
        config.geometry.validate()?;
        Ok(config)
    }
}
