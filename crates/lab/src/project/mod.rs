//! Projects and their container definitions.

mod models;
mod repository;

pub use models::{ContainerDefinition, ContainerPort, Project, ProjectWithDefinitions};
pub use repository::ProjectRepository;
