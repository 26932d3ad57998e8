//! Domain layer: operations, steps, severities, templates, and the ports
//! the core consumes.

/// The operation aggregate and its state enumerations
pub mod operation;

/// Collaborator ports (snapshot store, alert sink)
pub mod repository;

/// Severity scale
pub mod status;

/// Steps and shared action markers
pub mod step;

/// Workflow templates
pub mod template;
