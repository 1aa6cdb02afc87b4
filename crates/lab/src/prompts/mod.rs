//! Agent prompt composition.
//!
//! The agent container receives a system prompt assembled from prioritized,
//! conditionally included fragments: the project's own prompt plus the
//! platform's standing contracts. Composition is deterministic: fragments
//! render in ascending priority, ties in registration order.

use once_cell::sync::Lazy;

/// Inputs available to fragment predicates and renderers.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub session_id: String,
    pub project_name: String,
    pub project_prompt: Option<String>,
    pub title: Option<String>,
}

type Predicate = fn(&PromptContext) -> bool;
type Render = fn(&PromptContext) -> String;

/// One contract that may contribute to the prompt.
pub struct PromptFragment {
    pub priority: i32,
    pub include: Predicate,
    pub render: Render,
}

/// Compose the included fragments into one prompt.
pub fn compose(fragments: &[PromptFragment], ctx: &PromptContext) -> String {
    let mut included: Vec<(usize, &PromptFragment)> = fragments
        .iter()
        .enumerate()
        .filter(|(_, fragment)| (fragment.include)(ctx))
        .collect();
    included.sort_by_key(|(index, fragment)| (fragment.priority, *index));

    included
        .iter()
        .map(|(_, fragment)| (fragment.render)(ctx))
        .filter(|rendered| !rendered.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The platform's standing fragments.
pub static DEFAULT_FRAGMENTS: Lazy<Vec<PromptFragment>> = Lazy::new(|| {
    vec![
        PromptFragment {
            priority: 0,
            include: |_| true,
            render: |ctx| {
                format!(
                    "You are the coding agent for the \"{}\" workspace. \
                     Work inside /workspaces/{} and keep changes scoped to it.",
                    ctx.project_name, ctx.session_id
                )
            },
        },
        PromptFragment {
            priority: 10,
            include: |ctx| ctx.project_prompt.is_some(),
            render: |ctx| ctx.project_prompt.clone().unwrap_or_default(),
        },
        PromptFragment {
            priority: 20,
            include: |ctx| ctx.title.is_some(),
            render: |ctx| format!("Current task: {}", ctx.title.clone().unwrap_or_default()),
        },
    ]
});

/// Build the agent prompt for a session.
pub fn agent_prompt(ctx: &PromptContext) -> String {
    compose(&DEFAULT_FRAGMENTS, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext {
        PromptContext {
            session_id: "s1".to_string(),
            project_name: "demo".to_string(),
            project_prompt: Some("Prefer small commits.".to_string()),
            title: Some("fix login".to_string()),
        }
    }

    #[test]
    fn composes_in_priority_order() {
        let prompt = agent_prompt(&ctx());
        let base = prompt.find("coding agent").unwrap();
        let project = prompt.find("small commits").unwrap();
        let task = prompt.find("Current task").unwrap();
        assert!(base < project && project < task);
    }

    #[test]
    fn excluded_fragments_leave_no_trace() {
        let mut context = ctx();
        context.project_prompt = None;
        context.title = None;
        let prompt = agent_prompt(&context);
        assert!(!prompt.contains("Current task"));
        assert!(!prompt.contains("\n\n\n"));
    }

    #[test]
    fn ties_keep_registration_order() {
        let fragments = vec![
            PromptFragment {
                priority: 5,
                include: |_| true,
                render: |_| "first".to_string(),
            },
            PromptFragment {
                priority: 5,
                include: |_| true,
                render: |_| "second".to_string(),
            },
        ];
        assert_eq!(compose(&fragments, &ctx()), "first\n\nsecond");
    }
}
