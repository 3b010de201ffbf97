//! Prompt templates and assembly
//!
//! Each analysis type ships a built-in template; operators can override any
//! of them through `app_settings`. Substitution is literal string
//! replacement of `{{name}}`-style placeholders, and unresolved placeholders
//! are left verbatim rather than erroring. Context truncation is a hard
//! character cutoff at the depth's configured budget.

use crate::types::{AnalysisType, Project};

/// System role text for an analysis call
pub fn system_prompt(analysis_type: AnalysisType) -> String {
    format!(
        "You are a senior software consultant producing a {} for a GitHub repository. \
         Respond in well-structured markdown. Base every claim on the provided repository \
         context; do not invent files or features.",
        analysis_type.display_name()
    )
}

/// Built-in user prompt template for an analysis type
pub fn default_template(analysis_type: AnalysisType) -> &'static str {
    match analysis_type {
        AnalysisType::Prd => {
            "Write a product requirements document for the repository {{project_name}} ({{repo_url}}).\n\
             Cover: product vision, target users, core features observed in the code, \
             functional requirements, and a prioritized roadmap.\n\
             Analysis depth: {{depth}}.\n\n\
             Repository context:\n{{context}}"
        }
        AnalysisType::Marketing => {
            "Write a marketing plan for the repository {{project_name}} ({{repo_url}}).\n\
             Cover: positioning, target audience segments, key differentiators found in the \
             code and README, suggested channels, and launch messaging.\n\
             Analysis depth: {{depth}}.\n\n\
             Repository context:\n{{context}}"
        }
        AnalysisType::Security => {
            "Write a security review for the repository {{project_name}} ({{repo_url}}).\n\
             Cover: authentication and authorization handling, secret management, dependency \
             risks from the manifest, input validation, and concrete remediations ranked by \
             severity.\n\
             Analysis depth: {{depth}}.\n\n\
             Repository context:\n{{context}}"
        }
        AnalysisType::Performance => {
            "Write a performance review for the repository {{project_name}} ({{repo_url}}).\n\
             Cover: hot paths visible in the source excerpts, data-access patterns, caching \
             opportunities, and measurable optimization suggestions.\n\
             Analysis depth: {{depth}}.\n\n\
             Repository context:\n{{context}}"
        }
        AnalysisType::Architecture => {
            "Write an architecture review for the repository {{project_name}} ({{repo_url}}).\n\
             Cover: module boundaries from the file structure, dependency choices, coupling \
             concerns, and an evolution plan.\n\
             Analysis depth: {{depth}}.\n\n\
             Repository context:\n{{context}}"
        }
        AnalysisType::CodeQuality => {
            "Write a code quality review for the repository {{project_name}} ({{repo_url}}).\n\
             Cover: readability, test coverage signals, error handling patterns, and the top \
             refactoring candidates with justification.\n\
             Analysis depth: {{depth}}.\n\n\
             Repository context:\n{{context}}"
        }
    }
}

/// Literal `{{name}}` substitution; unknown placeholders stay verbatim
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", name), value);
    }
    out
}

/// Hard character cutoff with a truncation marker
pub fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let mut out: String = text.chars().take(budget).collect();
    out.push_str("\n...[truncated]");
    out
}

/// Assemble the combined repository context, truncated to the depth budget.
pub fn build_context(project: &Project, budget: usize) -> String {
    let mut sections = Vec::new();
    if let Some(readme) = &project.snapshot.readme {
        sections.push(format!("## README\n{}", readme));
    }
    if let Some(structure) = &project.snapshot.file_structure {
        sections.push(format!("## File structure\n{}", structure));
    }
    if let Some(manifest) = &project.snapshot.dependency_manifest {
        sections.push(format!("## Dependencies\n{}", manifest));
    }
    if let Some(excerpts) = &project.snapshot.source_excerpts {
        sections.push(format!("## Source excerpts\n{}", excerpts));
    }
    if let Some(config) = &project.snapshot.repo_config {
        sections.push(format!("## Configuration\n{}", config));
    }
    truncate_chars(&sections.join("\n\n"), budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RepoSnapshot;
    use chrono::Utc;

    #[test]
    fn render_replaces_known_placeholders() {
        let out = render(
            "Analyze {{project_name}} at {{repo_url}}",
            &[("project_name", "demo"), ("repo_url", "https://x")],
        );
        assert_eq!(out, "Analyze demo at https://x");
    }

    #[test]
    fn unresolved_placeholders_stay_verbatim() {
        let out = render("Hello {{name}}, depth {{depth}}", &[("depth", "critical")]);
        assert_eq!(out, "Hello {{name}}, depth critical");
    }

    #[test]
    fn truncation_is_a_hard_cutoff() {
        let text = "a".repeat(100);
        let out = truncate_chars(&text, 10);
        assert!(out.starts_with("aaaaaaaaaa"));
        assert!(out.ends_with("...[truncated]"));
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn context_includes_cached_sections() {
        let project = Project {
            id: "p1".to_string(),
            user_id: "u1".to_string(),
            name: "demo".to_string(),
            repo_url: "https://github.com/acme/demo".to_string(),
            snapshot: RepoSnapshot {
                readme: Some("# Demo readme".to_string()),
                dependency_manifest: Some("serde = \"1\"".to_string()),
                ..Default::default()
            },
            analysis_status: "idle".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let context = build_context(&project, 10_000);
        assert!(context.contains("## README"));
        assert!(context.contains("# Demo readme"));
        assert!(context.contains("## Dependencies"));
        assert!(!context.contains("## Source excerpts"));
    }

    #[test]
    fn every_template_carries_the_context_placeholder() {
        for t in AnalysisType::ALL {
            assert!(default_template(t).contains("{{context}}"), "{:?}", t);
        }
    }
}
