//! Task definition registration
//!
//! A template maps to one definition family per controller. A new revision is
//! registered only when something the service runs would change.

use crate::remote::{DefinitionSpec, RemoteTaskService, TaskDefinition};
use crate::template::EffectiveTemplate;
use fleet_foundation::Result;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

fn invalid_family_chars() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").ok()).as_ref()
}

/// Deterministic family name for (controller, template)
pub fn family_name(controller: &str, template: &str) -> String {
    let raw = format!("{}-{}", controller, template);
    match invalid_family_chars() {
        Some(re) => re.replace_all(&raw, "_").into_owned(),
        None => raw,
    }
}

/// Registration outcome
#[derive(Debug, Clone)]
pub struct RegisteredDefinition {
    pub definition: TaskDefinition,
    /// Latest revision was reused as-is
    pub reused: bool,
}

/// Registers or reuses definitions for one controller
pub struct DefinitionRegistrar {
    service: Arc<dyn RemoteTaskService>,
    controller: String,
}

impl DefinitionRegistrar {
    pub fn new(service: Arc<dyn RemoteTaskService>, controller: impl Into<String>) -> Self {
        Self {
            service,
            controller: controller.into(),
        }
    }

    pub fn family_for(&self, template: &str) -> String {
        family_name(&self.controller, template)
    }

    /// Build the spec that would be registered for `template`
    pub fn spec_for(&self, template: &EffectiveTemplate) -> DefinitionSpec {
        DefinitionSpec {
            family: self.family_for(&template.name),
            container: template.container_spec(),
            volumes: template.volumes.clone(),
            task_role: template.task_role.clone(),
            execution_role: template.execution_role.clone(),
            network_mode: template.network_mode,
            launch_mode: template.launch_mode,
        }
    }

    /// Return the latest revision if it matches, otherwise register a new one
    pub async fn register_or_reuse(&self, template: &EffectiveTemplate) -> Result<RegisteredDefinition> {
        let spec = self.spec_for(template);
        let latest = self.service.latest_definition(&spec.family).await?;

        if let Some(current) = latest {
            if current.spec.same_registration(&spec) {
                info!(
                    "Reusing task definition {} for template {}",
                    current.id, template.name
                );
                return Ok(RegisteredDefinition {
                    definition: current,
                    reused: true,
                });
            }
            debug!(
                "Task definition {} differs from template {}, registering new revision",
                current.id, template.name
            );
        }

        let definition = self.service.register_definition(spec).await?;
        info!(
            "Registered task definition {} (revision {}) for template {}",
            definition.id, definition.revision, template.name
        );
        Ok(RegisteredDefinition {
            definition,
            reused: false,
        })
    }

    /// Deregister the latest revision of a template's family.
    ///
    /// Best-effort: failures are logged and swallowed.
    pub async fn deregister_family(&self, template: &str) {
        let family = self.family_for(template);
        match self.service.latest_definition(&family).await {
            Ok(Some(definition)) => {
                if let Err(e) = self.service.deregister_definition(&definition.id).await {
                    warn!("Failed to deregister task definition {}: {}", definition.id, e);
                } else {
                    info!("Deregistered task definition {}", definition.id);
                }
            }
            Ok(None) => debug!("No task definition registered for family {}", family),
            Err(e) => warn!("Failed to look up task definition family {}: {}", family, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryTaskService;
    use crate::template::{TaskTemplate, TemplateSet};

    fn effective(template: TaskTemplate) -> EffectiveTemplate {
        TemplateSet::from_templates([template]).effective("builder").unwrap()
    }

    #[test]
    fn test_family_name_is_sanitized() {
        assert_eq!(family_name("fleet", "builder"), "fleet-builder");
        assert_eq!(family_name("my fleet", "java 17/x"), "my_fleet-java_17_x");
    }

    #[tokio::test]
    async fn test_unchanged_template_reuses_revision() {
        let service = Arc::new(InMemoryTaskService::new());
        let registrar = DefinitionRegistrar::new(service.clone(), "fleet");
        let template = effective(TaskTemplate::new("builder").with_image("agent:1"));

        let first = registrar.register_or_reuse(&template).await.unwrap();
        let second = registrar.register_or_reuse(&template).await.unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.definition.revision, second.definition.revision);
        assert_eq!(service.stats().registrations, 1);
    }

    #[tokio::test]
    async fn test_changed_image_registers_new_revision() {
        let service = Arc::new(InMemoryTaskService::new());
        let registrar = DefinitionRegistrar::new(service.clone(), "fleet");

        let v1 = effective(TaskTemplate::new("builder").with_image("agent:1"));
        let v2 = effective(TaskTemplate::new("builder").with_image("agent:2"));

        let first = registrar.register_or_reuse(&v1).await.unwrap();
        let second = registrar.register_or_reuse(&v2).await.unwrap();

        assert_eq!(first.definition.revision, 1);
        assert_eq!(second.definition.revision, 2);
        assert!(!second.reused);
    }

    #[tokio::test]
    async fn test_deregister_family() {
        let service = Arc::new(InMemoryTaskService::new());
        let registrar = DefinitionRegistrar::new(service.clone(), "fleet");
        let template = effective(TaskTemplate::new("builder").with_image("agent:1"));
        registrar.register_or_reuse(&template).await.unwrap();

        registrar.deregister_family("builder").await;

        assert!(service.definitions("fleet-builder").is_empty());
        assert_eq!(service.stats().deregistrations, 1);
    }
}
