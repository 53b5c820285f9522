use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::core::{Buffer, Sink, Source, TransformStage};
use crate::error::ConfigError;
use crate::registry::{ComponentConfig, ComponentKind, Registry, ResourceKind};
use crate::resilience::RetryPolicy;
use crate::resources::ResourceManager;

use super::stream::{Stream, StreamOptions, StreamParts};

/// Assembles a [`Stream`] from constructed adapters or from a [`StreamConfig`].
pub struct StreamBuilder {
    resources: Arc<ResourceManager>,
    parts: StreamParts,
    options: StreamOptions,
    names: HashSet<String>,
}

impl StreamBuilder {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self {
            resources,
            parts: StreamParts::default(),
            options: StreamOptions::default(),
            names: HashSet::new(),
        }
    }

    /// Stage names must be unique; repeats get a numeric suffix.
    fn unique_name(&mut self, kind: ComponentKind, name: String) -> String {
        let mut candidate = name.clone();
        let mut n = 1;
        while !self.names.insert(format!("{kind}.{candidate}")) {
            candidate = format!("{name}{n}");
            n += 1;
        }
        candidate
    }

    pub fn input(mut self, name: impl Into<String>, source: Box<dyn Source>) -> Self {
        let name = self.unique_name(ComponentKind::Input, name.into());
        self.parts.sources.push((name, source));
        self
    }

    pub fn buffer(mut self, name: impl Into<String>, buffer: Box<dyn Buffer>) -> Self {
        let name = self.unique_name(ComponentKind::Buffer, name.into());
        self.parts.buffer = Some((name, buffer));
        self
    }

    pub fn processor(mut self, name: impl Into<String>, stage: Arc<dyn TransformStage>) -> Self {
        let name = self.unique_name(ComponentKind::Processor, name.into());
        self.parts.stages.push((name, stage));
        self
    }

    pub fn output(mut self, name: impl Into<String>, sink: Box<dyn Sink>) -> Self {
        let name = self.unique_name(ComponentKind::Output, name.into());
        self.parts.sinks.push((name, sink));
        self
    }

    pub fn options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.options.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.options.threads = threads.max(1);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    pub fn read_backoff(mut self, backoff: Duration) -> Self {
        self.options.read_backoff = backoff;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = policy;
        self
    }

    pub fn build(self) -> Result<Stream, ConfigError> {
        if self.parts.sources.is_empty() {
            return Err(ConfigError::Invalid("at least one input is required".into()));
        }
        if self.parts.sinks.is_empty() {
            return Err(ConfigError::Invalid("at least one output is required".into()));
        }
        Ok(Stream::new(self.parts, self.options, self.resources))
    }

    /// Validate `config` in full, then construct resources and components.
    ///
    /// Every descriptor is checked before anything is built, so a bad field or
    /// unknown resource label never leaves half-constructed components behind.
    pub async fn from_config(config: &StreamConfig, registry: &Registry) -> Result<Stream, ConfigError> {
        config.check()?;

        let resources = Arc::new(ResourceManager::new());
        for descriptor in &config.rate_limit_resources {
            resources.register(ResourceKind::RateLimit, descriptor.display_name(), descriptor.clone())?;
        }
        for descriptor in &config.cache_resources {
            resources.register(ResourceKind::Cache, descriptor.display_name(), descriptor.clone())?;
        }

        validate_all(config, registry, &resources)?;

        match Self::construct(config, registry, resources.clone()) {
            Ok(stream) => Ok(stream),
            Err(e) => {
                resources.shutdown().await;
                Err(e)
            }
        }
    }

    fn construct(
        config: &StreamConfig,
        registry: &Registry,
        resources: Arc<ResourceManager>,
    ) -> Result<Stream, ConfigError> {
        resources.initialize(registry)?;

        let mut builder = StreamBuilder::new(resources.clone()).options(StreamOptions::from(config));
        for descriptor in &config.outputs {
            let sink = registry.build_sink(descriptor, &resources)?;
            builder = builder.output(descriptor.display_name(), sink);
        }
        for descriptor in &config.pipeline.processors {
            let stage = registry.build_stage(descriptor, &resources)?;
            builder = builder.processor(descriptor.display_name(), stage);
        }
        if let Some(descriptor) = &config.buffer {
            let buffer = registry.build_buffer(descriptor, &resources)?;
            builder = builder.buffer(descriptor.display_name(), buffer);
        }
        for descriptor in &config.inputs {
            let source = registry.build_source(descriptor, &resources)?;
            builder = builder.input(descriptor.display_name(), source);
        }

        tracing::info!(
            inputs = config.inputs.len(),
            processors = config.pipeline.processors.len(),
            outputs = config.outputs.len(),
            "stream constructed"
        );
        builder.build()
    }
}

fn validate_all(
    config: &StreamConfig,
    registry: &Registry,
    resources: &ResourceManager,
) -> Result<(), ConfigError> {
    let exists = |kind: ResourceKind, name: &str| resources.contains(kind, name);

    let sections: [(ComponentKind, Vec<&ComponentConfig>); 6] = [
        (ComponentKind::RateLimit, config.rate_limit_resources.iter().collect()),
        (ComponentKind::Cache, config.cache_resources.iter().collect()),
        (ComponentKind::Input, config.inputs.iter().collect()),
        (ComponentKind::Buffer, config.buffer.iter().collect()),
        (ComponentKind::Processor, config.pipeline.processors.iter().collect()),
        (ComponentKind::Output, config.outputs.iter().collect()),
    ];

    for (kind, descriptors) in sections {
        for descriptor in descriptors {
            registry.validate(kind, descriptor, &exists)?;
        }
    }
    Ok(())
}
