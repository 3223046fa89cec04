//! Text rendering of run summaries and previews

use colored::{ColoredString, Colorize};
use reconcile::{ExportValue, NodeOutcome, NodeReport, PlannedAction, Preview, RunSummary};
use serde_json::Value;

/// Shown in place of secret values
pub const SECRET_MASK: &str = "[secret]";

// ============================================================================
// Run Summary
// ============================================================================

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", summary.deployment.bold()));

    for report in summary.nodes.iter().chain(&summary.deletions) {
        out.push_str(&format!(
            "  {} {} {}\n",
            outcome_symbol(&report.outcome),
            report.id,
            report.kind.dimmed()
        ));
        match &report.outcome {
            NodeOutcome::Failed { failure } => {
                out.push_str(&format!("      {}\n", failure.cause.to_string().red()));
            }
            NodeOutcome::Retained { reason } => {
                out.push_str(&format!("      {}\n", reason.yellow()));
            }
            _ => {}
        }
    }

    out.push('\n');
    if summary.is_success() {
        out.push_str(&format!("  {} Stack converged successfully!\n", "✓".green().bold()));
    } else if summary.cancelled {
        out.push_str(&format!("  {} Run cancelled\n", "⚠".yellow().bold()));
    } else {
        out.push_str(&format!("  {} Stack converged with errors\n", "⚠".yellow().bold()));
    }

    let counts = summary.counts();
    for (count, label) in [
        (counts.created, "created"),
        (counts.updated, "updated"),
        (counts.replaced, "replaced"),
        (counts.deleted, "deleted"),
        (counts.unchanged, "unchanged"),
        (counts.read, "read"),
        (counts.retained, "retained"),
    ] {
        if count > 0 {
            out.push_str(&format!("    • {count} {} {label}\n", resources(count)));
        }
    }
    if counts.failed > 0 {
        out.push_str(&format!(
            "    • {} {} failed\n",
            counts.failed,
            resources(counts.failed).red()
        ));
    }
    if counts.cancelled > 0 {
        out.push_str(&format!(
            "    • {} {} not started\n",
            counts.cancelled,
            resources(counts.cancelled)
        ));
    }

    if !summary.exports.is_empty() {
        out.push_str(&format!("\n{}\n", "Outputs".cyan().bold()));
        for (name, export) in &summary.exports {
            let shown = match export {
                ExportValue::Known { secret: true, .. } => SECRET_MASK.dimmed().to_string(),
                ExportValue::Known { value, .. } => display_value(value),
                ExportValue::Unavailable { reason } => {
                    format!("<unavailable: {reason}>").dimmed().to_string()
                }
            };
            out.push_str(&format!("  {}: {shown}\n", name.dimmed()));
        }
    }
    out
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    print!("{}", render_summary(summary));
}

/// Outputs of one node, with secrets masked
pub fn render_outputs(report: &NodeReport) -> String {
    let mut out = String::new();
    for (name, value) in &report.outputs {
        let shown = if report.is_secret(name) {
            SECRET_MASK.to_string()
        } else {
            display_value(value)
        };
        out.push_str(&format!("  {}: {shown}\n", name.dimmed()));
    }
    out
}

fn outcome_symbol(outcome: &NodeOutcome) -> ColoredString {
    match outcome {
        NodeOutcome::Created => "+".green(),
        NodeOutcome::Updated => "~".yellow(),
        NodeOutcome::Replaced => "±".magenta(),
        NodeOutcome::Unchanged => "=".dimmed(),
        NodeOutcome::Read => "<".blue(),
        NodeOutcome::Deleted => "-".red(),
        NodeOutcome::Retained { .. } => "!".yellow(),
        NodeOutcome::Failed { .. } => "✗".red().bold(),
        NodeOutcome::Cancelled => "○".dimmed(),
    }
}

// ============================================================================
// Preview
// ============================================================================

pub fn render_preview(preview: &Preview) -> String {
    let mut out = String::new();
    out.push_str(&format!("{} {}\n", "Preview".bold(), preview.deployment.bold()));

    for planned in preview.nodes.iter().chain(&preview.deletions) {
        let symbol = action_symbol(&planned.action);
        let mut line = format!("  {symbol} {} {}", planned.id, planned.kind.dimmed());
        match &planned.action {
            PlannedAction::Update { inputs_known: false } => {
                line.push_str(&format!(" {}", "(inputs known after apply)".dimmed()));
            }
            PlannedAction::Retain { reason } => {
                line.push_str(&format!(" {}", format!("({reason})").yellow()));
            }
            PlannedAction::Conflict { reason } => {
                line.push_str(&format!(" {}", format!("({reason})").red()));
            }
            _ => {}
        }
        out.push_str(&line);
        out.push('\n');
        if !planned.changed_inputs.is_empty() {
            out.push_str(&format!(
                "      {} {}\n",
                "changed:".dimmed(),
                planned.changed_inputs.join(", ")
            ));
        }
    }

    let plan = preview.summary();
    out.push('\n');
    if plan.has_changes() {
        out.push_str(&format!(
            "  {} to create, {} to update, {} to replace, {} to delete\n",
            plan.creates, plan.updates, plan.replaces, plan.deletes
        ));
    } else {
        out.push_str(&format!("  {} No changes\n", "✓".green().bold()));
    }
    if plan.conflicts > 0 {
        out.push_str(&format!(
            "  {} {} {} cannot be applied\n",
            "⚠".yellow().bold(),
            plan.conflicts,
            resources(plan.conflicts)
        ));
    }
    out
}

pub fn print_preview(preview: &Preview) {
    println!();
    print!("{}", render_preview(preview));
}

fn action_symbol(action: &PlannedAction) -> ColoredString {
    let symbol = action.symbol();
    match action {
        PlannedAction::Create => symbol.green(),
        PlannedAction::Update { .. } => symbol.yellow(),
        PlannedAction::Replace => symbol.magenta(),
        PlannedAction::NoChange => symbol.dimmed(),
        PlannedAction::Read => symbol.blue(),
        PlannedAction::Delete => symbol.red(),
        PlannedAction::Retain { .. } => symbol.yellow(),
        PlannedAction::Conflict { .. } => symbol.red().bold(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resources(count: usize) -> &'static str {
    if count == 1 { "resource" } else { "resources" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reconcile::{FailureCause, PlannedNode, ProviderError};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn summary(nodes: Vec<NodeReport>, exports: BTreeMap<String, ExportValue>) -> RunSummary {
        RunSummary {
            deployment: "ci".into(),
            nodes,
            deletions: Vec::new(),
            exports,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_successful_summary() {
        colored::control::set_override(false);
        let exports = BTreeMap::from([
            (
                "url".to_string(),
                ExportValue::Known {
                    value: json!("https://ci.example.com"),
                    secret: false,
                },
            ),
            (
                "token".to_string(),
                ExportValue::Known {
                    value: json!("hunter2"),
                    secret: true,
                },
            ),
        ]);
        let text = render_summary(&summary(
            vec![
                NodeReport::new("vpc", "aws:ec2/vpc", NodeOutcome::Created),
                NodeReport::new("dns", "cloudflare:Record", NodeOutcome::Created),
                NodeReport::new("zone", "cloudflare:Zone", NodeOutcome::Read),
            ],
            exports,
        ));

        assert!(text.contains("  + vpc aws:ec2/vpc"));
        assert!(text.contains("  < zone cloudflare:Zone"));
        assert!(text.contains("✓ Stack converged successfully!"));
        assert!(text.contains("• 2 resources created"));
        assert!(text.contains("• 1 resource read"));
        assert!(text.contains("url: https://ci.example.com"));
        assert!(text.contains("token: [secret]"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_render_failed_summary() {
        colored::control::set_override(false);
        let text = render_summary(&summary(
            vec![
                NodeReport::new(
                    "volume",
                    "aws:ebs/volume",
                    NodeOutcome::failed(
                        "volume",
                        FailureCause::Provider {
                            error: ProviderError::fatal("quota exceeded"),
                        },
                    ),
                ),
                NodeReport::new("claim", "k8s:pvc", NodeOutcome::Cancelled),
            ],
            BTreeMap::from([(
                "size".to_string(),
                ExportValue::Unavailable {
                    reason: "volume failed".into(),
                },
            )]),
        ));

        assert!(text.contains("✗ volume"));
        assert!(text.contains("quota exceeded"));
        assert!(text.contains("⚠ Stack converged with errors"));
        assert!(text.contains("• 1 resource failed"));
        assert!(text.contains("• 1 resource not started"));
        assert!(text.contains("size: <unavailable: volume failed>"));
    }

    #[test]
    fn test_render_outputs_masks_secrets() {
        colored::control::set_override(false);
        let mut report = NodeReport::new("key", "aws:iam/AccessKey", NodeOutcome::Created);
        report.outputs.insert("id".into(), json!("AKIA123"));
        report.outputs.insert("secret".into(), json!("s3cr3t"));
        report.outputs.insert("port".into(), json!(443));
        report.secret_outputs.insert("secret".into());

        let text = render_outputs(&report);
        assert!(text.contains("id: AKIA123"));
        assert!(text.contains("port: 443"));
        assert!(text.contains("secret: [secret]"));
        assert!(!text.contains("s3cr3t"));
    }

    #[test]
    fn test_render_preview() {
        colored::control::set_override(false);
        let preview = Preview {
            deployment: "ci".into(),
            nodes: vec![
                PlannedNode {
                    id: "service".into(),
                    kind: "k8s:Service".into(),
                    action: PlannedAction::Update { inputs_known: true },
                    changed_inputs: vec!["port".into()],
                },
                PlannedNode {
                    id: "dns".into(),
                    kind: "cloudflare:Record".into(),
                    action: PlannedAction::Update {
                        inputs_known: false,
                    },
                    changed_inputs: Vec::new(),
                },
            ],
            deletions: vec![PlannedNode {
                id: "old".into(),
                kind: "aws:s3/bucket".into(),
                action: PlannedAction::Delete,
                changed_inputs: Vec::new(),
            }],
        };

        let text = render_preview(&preview);
        assert!(text.contains("~ service"));
        assert!(text.contains("changed: port"));
        assert!(text.contains("(inputs known after apply)"));
        assert!(text.contains("- old"));
        assert!(text.contains("0 to create, 2 to update, 0 to replace, 1 to delete"));
    }

    #[test]
    fn test_render_empty_preview() {
        colored::control::set_override(false);
        let preview = Preview {
            deployment: "ci".into(),
            nodes: Vec::new(),
            deletions: Vec::new(),
        };
        assert!(render_preview(&preview).contains("No changes"));
    }
}
