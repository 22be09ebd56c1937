use strata_db::{Direction, MigrationState, MigrationStatus, RunReport, Version};

const APPLIED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render the `strata status` box: summary line, then one row per migration.
pub fn render_status(statuses: &[MigrationStatus], current: Option<Version>) -> String {
    let version = env!("CARGO_PKG_VERSION");

    let applied = statuses
        .iter()
        .filter(|s| s.state == MigrationState::Applied)
        .count();
    let pending = statuses
        .iter()
        .filter(|s| s.state == MigrationState::Pending)
        .count();
    let current = current.map_or_else(|| "none".to_string(), |v| v.to_string());

    // Column widths
    let version_w = statuses
        .iter()
        .map(|s| s.version.to_string().len())
        .max()
        .unwrap_or(0)
        .max("VERSION".len());
    let name_w = statuses
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let state_w = "orphaned".len();
    let applied_w = "YYYY-MM-DD HH:MM:SS".len();

    let title = format!("Strata v{version}");
    let inner = (version_w + name_w + state_w + applied_w + 6).max(title.len() + 4);

    let top = format!("╭─── {title} {}╮", "─".repeat(inner - title.len() - 3));
    let bottom = format!("╰{}╯", "─".repeat(inner + 2));
    let row = |content: &str| format!("│ {content:<inner$} │");
    let columns = |v: &str, n: &str, s: &str, a: &str| {
        format!("{v:<version_w$}  {n:<name_w$}  {s:<state_w$}  {a}")
    };

    let mut lines = vec![top];
    lines.push(row(&format!("current version  {current}")));
    lines.push(row(&format!("applied {applied}  pending {pending}")));
    lines.push(row(&"─".repeat(inner)));

    if statuses.is_empty() {
        lines.push(row("no migrations found"));
    } else {
        lines.push(row(&columns("VERSION", "NAME", "STATE", "APPLIED AT")));
        for status in statuses {
            let applied_at = status
                .applied_at
                .map_or_else(|| "-".to_string(), |t| t.format(APPLIED_AT_FORMAT).to_string());
            lines.push(row(&columns(
                &status.version.to_string(),
                &status.name,
                state_label(status.state),
                &applied_at,
            )));
        }
    }

    lines.push(bottom);
    lines.join("\n")
}

/// One line per migration touched by a run.
pub fn render_report(report: &RunReport) -> String {
    let verb = match report.direction {
        Direction::Up => "applied",
        Direction::Down => "reverted",
    };
    if report.is_empty() {
        return format!("nothing to do ({verb} 0 migrations)");
    }

    report
        .steps
        .iter()
        .map(|step| {
            format!(
                "{verb} {} {} ({} ms)",
                step.version, step.name, step.execution_ms
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn state_label(state: MigrationState) -> &'static str {
    match state {
        MigrationState::Applied => "applied",
        MigrationState::Pending => "pending",
        MigrationState::Orphaned => "orphaned",
    }
}
