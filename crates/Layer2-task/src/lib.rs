//! # fleet-task
//!
//! Elastic agent lifecycle controller.
//! Provisions agents as remote container tasks, keeps them alive while they
//! are useful and retires them (and the hosts under them) when they are not.
//!
//! ## Features
//!
//! - Task templates with explicit parent inheritance
//! - Idempotent task definition registration
//! - Agent launch with bounded retry and deadlines
//! - Retention policies and sticky survivability tracking
//! - Demand-driven provisioning strategy
//! - **Scheduled warm pools**
//! - **Host fleet scale-in**

pub mod connection;
pub mod controller;
pub mod definition;
pub mod launcher;
pub mod node;
pub mod pool;
pub mod remote;
pub mod retention;
pub mod scale_in;
pub mod state;
pub mod strategy;
pub mod template;
pub mod terminate;

// Templates & definitions
pub use definition::{family_name, DefinitionRegistrar, RegisteredDefinition};
pub use template::{
    ContainerSpec, EffectiveTemplate, Field, LaunchMode, LogSpec, NetworkMode, OverridableField,
    PortMapping, RetentionPolicy, TaskTemplate, TemplateSet, VolumeSpec,
};

// Remote service
pub use remote::{
    hosts_with_status, list_hosts, DefinitionSpec, HostInstance, HostPage, HostStatus,
    InMemoryTaskService, PlacementFailure, RemoteTask, RemoteTaskService, RunTaskOutput,
    RunTaskRequest, TaskDefinition, TaskOverrides, TaskStatus,
};

// Nodes
pub use connection::{AgentConnections, ConnectionRegistry};
pub use node::{generate_name, AgentNode, NodeRegistry, NodeStore, RemoteTaskRef};
pub use state::NodeState;
pub use terminate::NodeTerminator;

// Lifecycle
pub use launcher::{AgentLauncher, LaunchPool, LaunchStatus, LaunchTicket};
pub use retention::RetentionController;

// Provisioning
pub use pool::{AgentPool, PoolMaintainer, PoolProvisioner, PoolTickReport};
pub use strategy::{
    DemandSnapshot, PlannedAgent, ProvisioningListener, ProvisioningSource, ProvisioningStrategy,
    StrategyOutcome,
};

// Hosts
pub use scale_in::{decide, until_billing_boundary, ClusterScaleIn, HostGroup, ScaleInDecision, ScaleInReport};

// Controller
pub use controller::{Controller, ControllerBuilder, ReconcileReport, TemplateProvisioner};
