//! Task Template Module
//!
//! Immutable description of what an agent task runs.
//!
//! Features:
//! - Tri-state fields (inherit / explicit no value / value)
//! - Parent templates resolved when the effective template is built
//! - Per-controller template set (no process-wide registry)

use fleet_foundation::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

// ============================================================================
// Field (tri-state)
// ============================================================================

/// A template field that can inherit from the parent, be explicitly cleared,
/// or carry a value.
///
/// Serialized as: key absent = `Inherit`, `null` = `Unset`, value = `Set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    /// Not specified; falls back to the parent template
    Inherit,
    /// Explicit "no value"; overrides the parent
    Unset,
    /// Explicit value
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::Inherit
    }
}

impl<T> From<T> for Field<T> {
    fn from(value: T) -> Self {
        Self::Set(value)
    }
}

impl<T: Clone> Field<T> {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Self::Inherit)
    }

    /// Right-biased merge: anything explicit in `self` wins
    pub fn or_inherit(&self, parent: &Field<T>) -> Field<T> {
        match self {
            Self::Inherit => parent.clone(),
            other => other.clone(),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn cloned(&self) -> Option<T> {
        self.value().cloned()
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Set(v) => serializer.serialize_some(v),
            _ => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Self::Set(v),
            None => Self::Unset,
        })
    }
}

// ============================================================================
// Enums & specs
// ============================================================================

/// How the remote service places the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LaunchMode {
    /// Tasks land on hosts the controller's cluster owns
    HostManaged,
    /// The remote service manages placement itself
    Serverless,
}

impl Default for LaunchMode {
    fn default() -> Self {
        Self::HostManaged
    }
}

impl LaunchMode {
    /// Whether concurrent launches must be serialized per cluster
    pub fn needs_capacity_lock(&self) -> bool {
        matches!(self, Self::HostManaged)
    }
}

/// Network mode for the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    Bridge,
    Host,
    /// Task gets its own network interface
    Vpc,
    None,
}

impl Default for NetworkMode {
    fn default() -> Self {
        Self::Bridge
    }
}

/// Retention policy for an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetentionPolicy {
    /// Kept until idle longer than its max idle time
    Persistent,
    /// Terminated after one unit of work
    OneShot,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Persistent
    }
}

/// Fields a run-time override may replace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverridableField {
    Cpu,
    Memory,
    MemoryReservation,
    Command,
}

/// Volume mount
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeSpec {
    pub fn new(name: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_path: None,
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn with_host_path(mut self, path: impl Into<String>) -> Self {
        self.host_path = Some(path.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Log driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSpec {
    pub driver: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Container part of a task definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    pub cpu: u32,
    pub memory: Option<u32>,
    pub memory_reservation: Option<u32>,
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub log: Option<LogSpec>,
    pub privileged: bool,
}

// ============================================================================
// Task Template
// ============================================================================

/// Template as authored; may inherit from a parent template
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub name: String,

    /// Parent template resolved at effective-template build time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub labels: Field<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub image: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub cpu: Field<u32>,
    /// Hard memory limit (MiB)
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub memory: Field<u32>,
    /// Soft memory limit (MiB)
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub memory_reservation: Field<u32>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub network_mode: Field<NetworkMode>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub launch_mode: Field<LaunchMode>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub task_role: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub execution_role: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub entrypoint: Field<Vec<String>>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub environment: Field<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub volumes: Field<Vec<VolumeSpec>>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub ports: Field<Vec<PortMapping>>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub log: Field<LogSpec>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub privileged: Field<bool>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub overridable: Field<BTreeSet<OverridableField>>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub retention: Field<RetentionPolicy>,
    /// Online members per label kept alive for one-shot agents
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub min_retained: Field<u32>,
    #[serde(default, skip_serializing_if = "Field::is_inherit")]
    pub idle_minutes: Field<u32>,
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Field::Set(image.into());
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = Field::Set(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_resources(mut self, cpu: u32, memory: u32) -> Self {
        self.cpu = Field::Set(cpu);
        self.memory = Field::Set(memory);
        self
    }

    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = Field::Set(mode);
        self
    }

    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = Field::Set(mode);
        self
    }

    pub fn with_retention(mut self, policy: RetentionPolicy, min_retained: u32) -> Self {
        self.retention = Field::Set(policy);
        self.min_retained = Field::Set(min_retained);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut env = self.environment.cloned().unwrap_or_default();
        env.insert(key.into(), value.into());
        self.environment = Field::Set(env);
        self
    }

    pub fn with_volume(mut self, volume: VolumeSpec) -> Self {
        let mut volumes = self.volumes.cloned().unwrap_or_default();
        volumes.push(volume);
        self.volumes = Field::Set(volumes);
        self
    }

    /// Deep merge of `self` over `parent`, field by field.
    ///
    /// Explicit child values (including `Unset`) win; `Inherit` takes the
    /// parent's field. The result keeps the child's name and parent link.
    pub fn merge(&self, parent: Option<&TaskTemplate>) -> TaskTemplate {
        let Some(parent) = parent else {
            return self.clone();
        };

        TaskTemplate {
            name: self.name.clone(),
            parent: self.parent.clone(),
            labels: self.labels.or_inherit(&parent.labels),
            image: self.image.or_inherit(&parent.image),
            cpu: self.cpu.or_inherit(&parent.cpu),
            memory: self.memory.or_inherit(&parent.memory),
            memory_reservation: self.memory_reservation.or_inherit(&parent.memory_reservation),
            network_mode: self.network_mode.or_inherit(&parent.network_mode),
            launch_mode: self.launch_mode.or_inherit(&parent.launch_mode),
            task_role: self.task_role.or_inherit(&parent.task_role),
            execution_role: self.execution_role.or_inherit(&parent.execution_role),
            entrypoint: self.entrypoint.or_inherit(&parent.entrypoint),
            environment: self.environment.or_inherit(&parent.environment),
            volumes: self.volumes.or_inherit(&parent.volumes),
            ports: self.ports.or_inherit(&parent.ports),
            log: self.log.or_inherit(&parent.log),
            privileged: self.privileged.or_inherit(&parent.privileged),
            overridable: self.overridable.or_inherit(&parent.overridable),
            retention: self.retention.or_inherit(&parent.retention),
            min_retained: self.min_retained.or_inherit(&parent.min_retained),
            idle_minutes: self.idle_minutes.or_inherit(&parent.idle_minutes),
        }
    }

    /// Collapse tri-state fields into concrete launch values
    fn into_effective(self) -> Result<EffectiveTemplate> {
        let image = self
            .image
            .cloned()
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| Error::Validation(format!("Template {} has no image", self.name)))?;

        Ok(EffectiveTemplate {
            labels: self.labels.cloned().unwrap_or_default(),
            image,
            cpu: self.cpu.cloned().unwrap_or(0),
            memory: self.memory.cloned(),
            memory_reservation: self.memory_reservation.cloned(),
            network_mode: self.network_mode.cloned().unwrap_or_default(),
            launch_mode: self.launch_mode.cloned().unwrap_or_default(),
            task_role: self.task_role.cloned(),
            execution_role: self.execution_role.cloned(),
            entrypoint: self.entrypoint.cloned().unwrap_or_default(),
            environment: self.environment.cloned().unwrap_or_default(),
            volumes: self.volumes.cloned().unwrap_or_default(),
            ports: self.ports.cloned().unwrap_or_default(),
            log: self.log.cloned(),
            privileged: self.privileged.cloned().unwrap_or(false),
            overridable: self.overridable.cloned().unwrap_or_default(),
            retention: self.retention.cloned().unwrap_or_default(),
            min_retained: self.min_retained.cloned().unwrap_or(0),
            idle_minutes: self.idle_minutes.cloned(),
            name: self.name,
        })
    }
}

// ============================================================================
// Effective Template
// ============================================================================

/// Fully resolved template used for a launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveTemplate {
    pub name: String,
    pub labels: BTreeSet<String>,
    pub image: String,
    pub cpu: u32,
    pub memory: Option<u32>,
    pub memory_reservation: Option<u32>,
    pub network_mode: NetworkMode,
    pub launch_mode: LaunchMode,
    pub task_role: Option<String>,
    pub execution_role: Option<String>,
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub volumes: Vec<VolumeSpec>,
    pub ports: Vec<PortMapping>,
    pub log: Option<LogSpec>,
    pub privileged: bool,
    pub overridable: BTreeSet<OverridableField>,
    pub retention: RetentionPolicy,
    pub min_retained: u32,
    pub idle_minutes: Option<u32>,
}

impl EffectiveTemplate {
    /// Whether this template can serve work tagged with `label`
    pub fn serves(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn can_override(&self, field: OverridableField) -> bool {
        self.overridable.contains(&field)
    }

    pub fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: self.image.clone(),
            cpu: self.cpu,
            memory: self.memory,
            memory_reservation: self.memory_reservation,
            entrypoint: self.entrypoint.clone(),
            environment: self.environment.clone(),
            ports: self.ports.clone(),
            log: self.log.clone(),
            privileged: self.privileged,
        }
    }
}

// ============================================================================
// Template Set
// ============================================================================

/// Templates owned by one controller instance, keyed by name
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: BTreeMap<String, TaskTemplate>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: impl IntoIterator<Item = TaskTemplate>) -> Self {
        let mut set = Self::new();
        for template in templates {
            set.insert(template);
        }
        set
    }

    /// Insert or replace a template; returns the previous one
    pub fn insert(&mut self, template: TaskTemplate) -> Option<TaskTemplate> {
        self.templates.insert(template.name.clone(), template)
    }

    pub fn remove(&mut self, name: &str) -> Option<TaskTemplate> {
        self.templates.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TaskTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn to_vec(&self) -> Vec<TaskTemplate> {
        self.templates.values().cloned().collect()
    }

    /// Build the effective template for `name`, walking the parent chain
    pub fn effective(&self, name: &str) -> Result<EffectiveTemplate> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());

        while let Some(template_name) = current {
            if !seen.insert(template_name.clone()) {
                return Err(Error::Validation(format!(
                    "Template inheritance cycle at {}",
                    template_name
                )));
            }
            let template = self
                .templates
                .get(&template_name)
                .ok_or_else(|| Error::NotFound(format!("Template {}", template_name)))?;
            current = template.parent.clone();
            chain.push(template);
        }

        // root first, then merge each descendant over it
        let mut merged: Option<TaskTemplate> = None;
        for template in chain.into_iter().rev() {
            merged = Some(template.merge(merged.as_ref()));
        }

        merged
            .ok_or_else(|| Error::NotFound(format!("Template {}", name)))?
            .into_effective()
    }

    /// Effective templates able to serve `label`, in name order
    pub fn matching(&self, label: &str) -> Vec<EffectiveTemplate> {
        self.templates
            .keys()
            .filter_map(|name| match self.effective(name) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!("Skipping template {}: {}", name, e);
                    None
                }
            })
            .filter(|t| t.serves(label))
            .collect()
    }
}
