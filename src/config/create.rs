use serde_json::Value;

use super::StreamConfig;
use crate::error::ConfigError;
use crate::registry::{ComponentConfig, ComponentKind, Registry};

const SECTIONS: [ComponentKind; 3] = [
    ComponentKind::Input,
    ComponentKind::Processor,
    ComponentKind::Output,
];

/// Build a config from an `inputs/processors/outputs` expression such as
/// `generate/split,metadata/stdout`.
///
/// Each named component has its config populated with every field default;
/// `small` leaves out fields marked advanced. An empty expression produces the
/// default `stdin` to `stdout` config.
pub fn create_config(
    expression: &str,
    registry: &Registry,
    small: bool,
) -> Result<StreamConfig, ConfigError> {
    let mut sections: [Vec<String>; 3] = Default::default();

    for (i, section) in expression.split('/').enumerate() {
        for name in section.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let Some(kind) = SECTIONS.get(i) else {
                return Err(ConfigError::Expression(
                    "more component separators than expected".to_string(),
                ));
            };
            if !registry.contains(*kind, name) {
                return Err(ConfigError::Expression(format!(
                    "unrecognised {kind} type '{name}'"
                )));
            }
            sections[i].push(name.to_string());
        }
    }

    let mut config = StreamConfig::default();
    let [inputs, processors, outputs] = sections;
    if !inputs.is_empty() {
        config.inputs = inputs.into_iter().map(ComponentConfig::new).collect();
    }
    config.pipeline.processors = processors.into_iter().map(ComponentConfig::new).collect();
    if !outputs.is_empty() {
        config.outputs = outputs.into_iter().map(ComponentConfig::new).collect();
    }

    populate(&mut config.inputs, ComponentKind::Input, registry, small);
    populate(&mut config.pipeline.processors, ComponentKind::Processor, registry, small);
    populate(&mut config.outputs, ComponentKind::Output, registry, small);

    Ok(config)
}

fn populate(components: &mut [ComponentConfig], kind: ComponentKind, registry: &Registry, small: bool) {
    for component in components {
        if let Some(spec) = registry.spec(kind, &component.type_name) {
            component.config = spec.example_config(!small);
        }
    }
}

/// Render a generated config. `small` keeps only the component sections.
pub fn render(config: &StreamConfig, small: bool) -> Result<String, ConfigError> {
    let mut value = serde_json::to_value(config)?;
    if small {
        if let Value::Object(map) = &mut value {
            map.remove("delivery");
            map.remove("logger");
        }
    }
    Ok(serde_json::to_string_pretty(&value)?)
}
