//! Built-in components.

pub mod buffers;
pub mod caches;
pub mod inputs;
pub mod outputs;
pub mod processors;
pub mod rate_limits;

use crate::registry::{Describe, Registration};

/// Registrations for every built-in component.
pub fn builtins() -> Vec<Registration> {
    vec![
        inputs::GenerateConfig::registration(),
        inputs::StdinConfig::registration(),
        buffers::MemoryBufferConfig::registration(),
        processors::NoopConfig::registration(),
        processors::MetadataConfig::registration(),
        processors::FilterConfig::registration(),
        processors::SplitConfig::registration(),
        processors::MergeConfig::registration(),
        processors::CacheConfig::registration(),
        processors::RateLimitConfig::registration(),
        processors::SleepConfig::registration(),
        outputs::DropConfig::registration(),
        outputs::StdoutConfig::registration(),
        caches::MemoryCacheConfig::registration(),
        rate_limits::LocalRateLimitConfig::registration(),
    ]
}

pub use buffers::MemoryBuffer;
pub use caches::MemoryCache;
pub use inputs::GenerateSource;
pub use outputs::DropSink;
pub use processors::{Filter, Merge, Noop, Sleep, Split};
pub use rate_limits::LocalRateLimit;
