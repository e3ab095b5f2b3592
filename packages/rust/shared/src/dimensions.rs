//! Built-in dimension catalog, in fixed topological order.
//!
//! Later dimensions read the digests of earlier ones, so the order here is
//! part of the contract: profile first, guidelines last.

use crate::types::Dimension;

fn dimension(
    id: &str,
    label: &str,
    guide: &str,
    skill_worthy: bool,
    dual_output: bool,
    knowledge_types: &[&str],
) -> Dimension {
    Dimension {
        id: id.into(),
        label: label.into(),
        guide: guide.into(),
        skill_worthy,
        dual_output,
        knowledge_types: knowledge_types.iter().map(|s| (*s).to_string()).collect(),
    }
}

/// The default dimension list used when a scan file does not supply one.
pub fn default_dimensions() -> Vec<Dimension> {
    vec![
        dimension(
            "project-profile",
            "Project profile",
            "Summarise the project's purpose, tech stack, module layout and build targets.",
            true,
            false,
            &["project-profile"],
        ),
        dimension(
            "code-standard",
            "Code standards",
            "Identify naming, formatting and file organisation conventions that the team follows consistently.",
            false,
            false,
            &["code-standard", "code-style"],
        ),
        dimension(
            "architecture",
            "Architecture",
            "Describe layering, module boundaries and dependency direction; submit concrete boundary rules.",
            true,
            true,
            &["architecture", "module-dependency", "boundary-constraint"],
        ),
        dimension(
            "code-pattern",
            "Code patterns",
            "Extract reusable implementation patterns (singletons, factories, delegates, builders) with representative code.",
            false,
            false,
            &["code-pattern", "code-relation", "inheritance"],
        ),
        dimension(
            "event-and-data-flow",
            "Events and data flow",
            "Trace how events, notifications and data move between components.",
            false,
            false,
            &["call-chain", "data-flow", "event-and-data-flow"],
        ),
        dimension(
            "best-practice",
            "Best practices",
            "Capture error handling, concurrency, memory management and logging practices.",
            false,
            false,
            &["best-practice", "solution"],
        ),
        dimension(
            "objc-deep-scan",
            "Objective-C deep scan",
            "Inspect categories, macros, method swizzling and other Objective-C specific idioms.",
            true,
            true,
            &["code-pattern", "code-standard"],
        ),
        dimension(
            "agent-guidelines",
            "Agent guidelines",
            "Condense everything learned so far into rules an AI coding agent must follow in this project.",
            true,
            false,
            &["boundary-constraint", "best-practice"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn catalog_ids_are_unique() {
        let dims = default_dimensions();
        let ids: HashSet<_> = dims.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids.len(), dims.len());
    }

    #[test]
    fn catalog_order_is_stable() {
        let dims = default_dimensions();
        assert_eq!(dims.first().map(|d| d.id.as_str()), Some("project-profile"));
        assert_eq!(dims.last().map(|d| d.id.as_str()), Some("agent-guidelines"));
        assert!(dims[0].is_digest_only());
    }
}
