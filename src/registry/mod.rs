//! Component registry: maps (kind, type name) to a field schema and a constructor.
//!
//! Built-in components are registered explicitly; anything else that derives
//! `Component` is picked up through `inventory` when the registry is created
//! with [`Registry::with_builtins`].

mod spec;

pub use spec::{
    parse_default, ComponentKind, ComponentSpec, FieldSpec, FieldType, ResourceKind, Status,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Buffer, Cache, RateLimiter, Sink, Source, TransformStage};
use crate::error::ConfigError;
use crate::resources::ResourceManager;

pub type SourceCtor = fn(Value, &ResourceManager) -> anyhow::Result<Box<dyn Source>>;
pub type BufferCtor = fn(Value, &ResourceManager) -> anyhow::Result<Box<dyn Buffer>>;
pub type StageCtor = fn(Value, &ResourceManager) -> anyhow::Result<Box<dyn TransformStage>>;
pub type SinkCtor = fn(Value, &ResourceManager) -> anyhow::Result<Box<dyn Sink>>;
pub type CacheCtor = fn(Value, &ResourceManager) -> anyhow::Result<Box<dyn Cache>>;
pub type RateLimitCtor = fn(Value, &ResourceManager) -> anyhow::Result<Box<dyn RateLimiter>>;

/// Constructor for one component type, tagged by the capability it produces.
#[derive(Clone, Copy)]
pub enum Constructor {
    Input(SourceCtor),
    Buffer(BufferCtor),
    Processor(StageCtor),
    Output(SinkCtor),
    Cache(CacheCtor),
    RateLimit(RateLimitCtor),
}

impl Constructor {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Constructor::Input(_) => ComponentKind::Input,
            Constructor::Buffer(_) => ComponentKind::Buffer,
            Constructor::Processor(_) => ComponentKind::Processor,
            Constructor::Output(_) => ComponentKind::Output,
            Constructor::Cache(_) => ComponentKind::Cache,
            Constructor::RateLimit(_) => ComponentKind::RateLimit,
        }
    }
}

#[derive(Clone)]
pub struct Registration {
    pub spec: ComponentSpec,
    pub constructor: Constructor,
}

/// Implemented by `#[derive(Component)]`.
pub trait Describe {
    fn spec() -> ComponentSpec;
    fn registration() -> Registration;
}

/// Link-time registration entry submitted by the derive macro.
pub struct RegistrationFactory(pub fn() -> Registration);

inventory::collect!(RegistrationFactory);

/// A component reference in a stream config: `{ "type": ..., "label": ..., "config": {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl ComponentConfig {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            label: None,
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Name used in logs and errors: the label when set, else the type.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.type_name)
    }
}

#[derive(Default)]
pub struct Registry {
    entries: HashMap<ComponentKind, BTreeMap<String, Registration>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in component plus all `inventory` submissions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for registration in crate::components::builtins() {
            registry.insert(registration);
        }

        for factory in inventory::iter::<RegistrationFactory> {
            registry.absorb((factory.0)());
        }
        registry
    }

    /// Add an `inventory` submission. Built-ins are submitted too, so an identical
    /// re-submission is expected; a different component under a taken name is
    /// reported and skipped. Returns whether the registration was added.
    fn absorb(&mut self, registration: Registration) -> bool {
        let kind = registration.spec.kind;
        if let Some(existing) = self.spec(kind, &registration.spec.name) {
            if *existing != registration.spec {
                tracing::warn!(
                    kind = %kind,
                    name = %registration.spec.name,
                    kept = %existing.summary,
                    skipped = %registration.spec.summary,
                    "ignoring conflicting component registration"
                );
            }
            return false;
        }
        self.insert(registration);
        true
    }

    fn insert(&mut self, registration: Registration) {
        self.entries
            .entry(registration.spec.kind)
            .or_default()
            .insert(registration.spec.name.clone(), registration);
    }

    /// Add a component type. Names are unique within a kind.
    pub fn register(&mut self, registration: Registration) -> Result<(), ConfigError> {
        let kind = registration.spec.kind;
        let name = registration.spec.name.clone();

        if registration.constructor.kind() != kind {
            return Err(ConfigError::Invalid(format!(
                "{kind} '{name}' registered with a {} constructor",
                registration.constructor.kind()
            )));
        }
        if self.contains(kind, &name) {
            return Err(ConfigError::DuplicateComponent { kind, name });
        }

        tracing::debug!(%kind, component = %name, "registered component");
        self.insert(registration);
        Ok(())
    }

    pub fn contains(&self, kind: ComponentKind, name: &str) -> bool {
        self.entries
            .get(&kind)
            .is_some_and(|entries| entries.contains_key(name))
    }

    pub fn spec(&self, kind: ComponentKind, name: &str) -> Option<&ComponentSpec> {
        self.entries
            .get(&kind)
            .and_then(|entries| entries.get(name))
            .map(|r| &r.spec)
    }

    /// Specs of one kind, sorted by name.
    pub fn list(&self, kind: ComponentKind) -> Vec<&ComponentSpec> {
        self.entries
            .get(&kind)
            .map(|entries| entries.values().map(|r| &r.spec).collect())
            .unwrap_or_default()
    }

    fn lookup(&self, kind: ComponentKind, name: &str) -> Result<&Registration, ConfigError> {
        self.entries
            .get(&kind)
            .and_then(|entries| entries.get(name))
            .ok_or_else(|| ConfigError::UnknownComponent {
                kind,
                name: name.to_string(),
            })
    }

    /// Validate a descriptor without constructing it.
    ///
    /// `resource_exists` answers whether a referenced cache or rate limit is declared.
    pub fn validate(
        &self,
        kind: ComponentKind,
        descriptor: &ComponentConfig,
        resource_exists: &dyn Fn(ResourceKind, &str) -> bool,
    ) -> Result<Value, ConfigError> {
        let registration = self.lookup(kind, &descriptor.type_name)?;
        let component = format!("{kind} '{}'", descriptor.display_name());
        registration
            .spec
            .validate(&component, &descriptor.config, resource_exists)
    }

    fn prepare(
        &self,
        kind: ComponentKind,
        descriptor: &ComponentConfig,
        resources: &ResourceManager,
    ) -> Result<(Constructor, Value), ConfigError> {
        let registration = self.lookup(kind, &descriptor.type_name)?;
        let component = format!("{kind} '{}'", descriptor.display_name());
        let config = registration.spec.validate(&component, &descriptor.config, &|k, n| {
            resources.contains(k, n)
        })?;

        if registration.spec.status == Status::Deprecated {
            tracing::warn!(
                %kind,
                component = %descriptor.type_name,
                "component is deprecated and may be removed in a future release"
            );
        }

        Ok((registration.constructor, config))
    }

    fn construction_error(
        kind: ComponentKind,
        descriptor: &ComponentConfig,
    ) -> impl FnOnce(anyhow::Error) -> ConfigError + '_ {
        move |source| ConfigError::Construction {
            kind,
            name: descriptor.display_name().to_string(),
            source,
        }
    }

    fn mismatch(kind: ComponentKind, descriptor: &ComponentConfig) -> ConfigError {
        ConfigError::Invalid(format!(
            "{kind} '{}' has a constructor of the wrong kind",
            descriptor.type_name
        ))
    }

    pub fn build_source(
        &self,
        descriptor: &ComponentConfig,
        resources: &ResourceManager,
    ) -> Result<Box<dyn Source>, ConfigError> {
        let kind = ComponentKind::Input;
        match self.prepare(kind, descriptor, resources)? {
            (Constructor::Input(ctor), config) => {
                ctor(config, resources).map_err(Self::construction_error(kind, descriptor))
            }
            _ => Err(Self::mismatch(kind, descriptor)),
        }
    }

    pub fn build_buffer(
        &self,
        descriptor: &ComponentConfig,
        resources: &ResourceManager,
    ) -> Result<Box<dyn Buffer>, ConfigError> {
        let kind = ComponentKind::Buffer;
        match self.prepare(kind, descriptor, resources)? {
            (Constructor::Buffer(ctor), config) => {
                ctor(config, resources).map_err(Self::construction_error(kind, descriptor))
            }
            _ => Err(Self::mismatch(kind, descriptor)),
        }
    }

    /// Stages are shared across workers, so they come back behind an `Arc`.
    pub fn build_stage(
        &self,
        descriptor: &ComponentConfig,
        resources: &ResourceManager,
    ) -> Result<Arc<dyn TransformStage>, ConfigError> {
        let kind = ComponentKind::Processor;
        match self.prepare(kind, descriptor, resources)? {
            (Constructor::Processor(ctor), config) => ctor(config, resources)
                .map(Arc::from)
                .map_err(Self::construction_error(kind, descriptor)),
            _ => Err(Self::mismatch(kind, descriptor)),
        }
    }

    pub fn build_sink(
        &self,
        descriptor: &ComponentConfig,
        resources: &ResourceManager,
    ) -> Result<Box<dyn Sink>, ConfigError> {
        let kind = ComponentKind::Output;
        match self.prepare(kind, descriptor, resources)? {
            (Constructor::Output(ctor), config) => {
                ctor(config, resources).map_err(Self::construction_error(kind, descriptor))
            }
            _ => Err(Self::mismatch(kind, descriptor)),
        }
    }

    pub fn build_cache(
        &self,
        descriptor: &ComponentConfig,
        resources: &ResourceManager,
    ) -> Result<Arc<dyn Cache>, ConfigError> {
        let kind = ComponentKind::Cache;
        match self.prepare(kind, descriptor, resources)? {
            (Constructor::Cache(ctor), config) => ctor(config, resources)
                .map(Arc::from)
                .map_err(Self::construction_error(kind, descriptor)),
            _ => Err(Self::mismatch(kind, descriptor)),
        }
    }

    pub fn build_rate_limit(
        &self,
        descriptor: &ComponentConfig,
        resources: &ResourceManager,
    ) -> Result<Arc<dyn RateLimiter>, ConfigError> {
        let kind = ComponentKind::RateLimit;
        match self.prepare(kind, descriptor, resources)? {
            (Constructor::RateLimit(ctor), config) => ctor(config, resources)
                .map(Arc::from)
                .map_err(Self::construction_error(kind, descriptor)),
            _ => Err(Self::mismatch(kind, descriptor)),
        }
    }
}
