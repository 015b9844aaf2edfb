//! Template registry: stores and retrieves workflow templates
//!
//! Templates are immutable once registered. To modify one, register a new
//! version; the registry tracks every version under the template's name.

use std::collections::HashMap;
use studioflow_types::{
    ensure_valid, validate_template, TemplateId, WorkflowError, WorkflowResult, WorkflowTemplate,
};

/// Registry of workflow templates
#[derive(Clone, Debug, Default)]
pub struct TemplateRegistry {
    /// All registered templates, keyed by id
    templates: HashMap<TemplateId, WorkflowTemplate>,
    /// Index by name → registration-ordered ids (for versioning)
    by_name: HashMap<String, Vec<TemplateId>>,
}

impl TemplateRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a template after boundary validation. Returns its id.
    pub fn register(&mut self, template: WorkflowTemplate) -> WorkflowResult<TemplateId> {
        ensure_valid(validate_template(&template))?;

        let id = template.id.clone();
        let name = template.name.clone();

        self.templates.insert(id.clone(), template);
        self.by_name.entry(name).or_default().push(id.clone());

        tracing::info!(template_id = %id, "Workflow template registered");
        Ok(id)
    }

    /// Get a template by id
    pub fn get(&self, id: &TemplateId) -> WorkflowResult<&WorkflowTemplate> {
        self.templates
            .get(id)
            .ok_or_else(|| WorkflowError::TemplateNotFound(id.clone()))
    }

    /// Get a template for dispatch: it must exist and be active
    pub fn get_active(&self, id: &TemplateId) -> WorkflowResult<&WorkflowTemplate> {
        let template = self.get(id)?;
        if !template.status.is_active() {
            return Err(WorkflowError::TemplateInactive(id.clone()));
        }
        Ok(template)
    }

    /// Get the latest registered version under a name
    pub fn latest_by_name(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.by_name
            .get(name)
            .and_then(|ids| ids.last())
            .and_then(|id| self.templates.get(id))
    }

    /// All versions registered under a name, oldest first
    pub fn versions_by_name(&self, name: &str) -> Vec<&WorkflowTemplate> {
        self.by_name
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| self.templates.get(id)).collect())
            .unwrap_or_default()
    }

    /// List all registered templates
    pub fn list(&self) -> Vec<&WorkflowTemplate> {
        self.templates.values().collect()
    }

    /// Number of registered templates
    pub fn count(&self) -> usize {
        self.templates.len()
    }

    /// Check whether a template exists
    pub fn contains(&self, id: &TemplateId) -> bool {
        self.templates.contains_key(id)
    }

    /// Remove a template, cleaning up the name index
    pub fn remove(&mut self, id: &TemplateId) -> WorkflowResult<WorkflowTemplate> {
        let template = self
            .templates
            .remove(id)
            .ok_or_else(|| WorkflowError::TemplateNotFound(id.clone()))?;

        if let Some(ids) = self.by_name.get_mut(&template.name) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_name.remove(&template.name);
            }
        }

        tracing::info!(template_id = %id, "Workflow template removed");
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studioflow_types::{StudioId, TemplateStatus, UserId, WorkflowStep};

    fn make_template(name: &str) -> WorkflowTemplate {
        let mut template = WorkflowTemplate::new(
            name,
            StudioId::new("studio-1"),
            UserId::new("author-1"),
        )
        .active();
        template
            .add_step(WorkflowStep::new("email", "send_email"))
            .unwrap();
        template
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = TemplateRegistry::new();
        let id = registry.register(make_template("Onboarding")).unwrap();

        assert_eq!(registry.get(&id).unwrap().name, "Onboarding");
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_register_invalid_rejected() {
        let mut registry = TemplateRegistry::new();
        // no steps
        let template = WorkflowTemplate::new(
            "Empty Flow",
            StudioId::new("studio-1"),
            UserId::new("author-1"),
        );
        assert!(matches!(
            registry.register(template),
            Err(WorkflowError::ValidationFailed(_))
        ));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_get_active_requires_active_status() {
        let mut registry = TemplateRegistry::new();
        let mut draft = make_template("Draft Flow");
        draft.status = TemplateStatus::Draft;
        let draft_id = registry.register(draft).unwrap();

        assert!(matches!(
            registry.get_active(&draft_id),
            Err(WorkflowError::TemplateInactive(_))
        ));

        let active_id = registry.register(make_template("Active Flow")).unwrap();
        assert!(registry.get_active(&active_id).is_ok());

        assert!(matches!(
            registry.get_active(&TemplateId::new("missing")),
            Err(WorkflowError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_versions_by_name() {
        let mut registry = TemplateRegistry::new();
        registry.register(make_template("Review Flow")).unwrap();
        let second = registry.register(make_template("Review Flow")).unwrap();

        assert_eq!(registry.versions_by_name("Review Flow").len(), 2);
        assert_eq!(registry.latest_by_name("Review Flow").unwrap().id, second);
        assert!(registry.latest_by_name("Nonexistent").is_none());
    }

    #[test]
    fn test_remove() {
        let mut registry = TemplateRegistry::new();
        let id = registry.register(make_template("Remove Me")).unwrap();

        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.name, "Remove Me");
        assert!(!registry.contains(&id));
        assert!(registry.latest_by_name("Remove Me").is_none());

        assert!(matches!(
            registry.remove(&id),
            Err(WorkflowError::TemplateNotFound(_))
        ));
    }
}
