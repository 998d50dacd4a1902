use color_eyre::Result;
use serde_json::Value;
use tutorhost_core::{format_status_message, to_json_response, CommandInfo, ExecutionOutcome};

use crate::cli::TutorhostCli;
use crate::style::Style;

pub fn emit_output(
    cli: &TutorhostCli,
    info: CommandInfo,
    outcome: &ExecutionOutcome,
) -> Result<i32> {
    let code = outcome.exit_code();
    let style = Style::new(cli.no_color, atty::is(atty::Stream::Stdout));

    if cli.json {
        let payload = to_json_response(info, outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet {
        let message = format_status_message(info, &outcome.message);
        println!("{}", style.status(outcome.status, &message));
        if let Some(table) = render_details(&style, info, &outcome.details) {
            println!("{table}");
        }
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("{}", style.info(&format!("Hint: {hint}")));
        }
    }

    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details.get("hint").and_then(Value::as_str)
}

fn render_details(style: &Style, info: CommandInfo, details: &Value) -> Option<String> {
    match (info.group, info.name) {
        ("bundles", "list") => render_bundles(style, details),
        ("bundles", "sync") => render_sync_failures(style, details),
        ("queue", "pending") => render_pending(style, details),
        ("queue", "dead-letters") => render_dead_letters(style, details),
        ("sidecar", "start") => details
            .get("stderrTail")
            .and_then(Value::as_str)
            .filter(|tail| !tail.is_empty())
            .map(|tail| {
                let mut out = style.table_header("sidecar stderr (tail):");
                for line in tail.lines() {
                    out.push('\n');
                    out.push_str(&style.dim(&format!("  {line}")));
                }
                out
            }),
        _ => None,
    }
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn number(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map_or_else(|| "-".to_string(), |n| n.to_string())
}

fn table(style: &Style, header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(idx) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }
    let pad = |cells: &[String]| {
        cells
            .iter()
            .enumerate()
            .map(|(idx, cell)| format!("{cell:<width$}", width = widths[idx]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let header_cells: Vec<String> = header.iter().map(ToString::to_string).collect();
    let mut out = style.table_header(&pad(&header_cells));
    for row in rows {
        out.push('\n');
        out.push_str(&pad(row));
    }
    out
}

fn render_bundles(style: &Style, details: &Value) -> Option<String> {
    let bundles = details.get("bundles")?.as_array()?;
    if bundles.is_empty() {
        return None;
    }
    let rows: Vec<Vec<String>> = bundles
        .iter()
        .map(|bundle| {
            let present = bundle.get("present").and_then(Value::as_bool).unwrap_or(false);
            vec![
                text(bundle, "bundleType").to_string(),
                text(bundle, "scopeId").to_string(),
                text(bundle, "version").to_string(),
                if present {
                    text(bundle, "path").to_string()
                } else {
                    style.warn(&format!("{} (missing)", text(bundle, "path")))
                },
            ]
        })
        .collect();
    Some(table(style, &["TYPE", "SCOPE", "VERSION", "PATH"], &rows))
}

fn render_sync_failures(style: &Style, details: &Value) -> Option<String> {
    let failed = details.get("failed")?.as_array()?;
    if failed.is_empty() {
        return None;
    }
    let lines: Vec<String> = failed
        .iter()
        .map(|entry| style.warn(&format!("  {}: {}", text(entry, "bundle"), text(entry, "error"))))
        .collect();
    Some(lines.join("\n"))
}

fn render_pending(style: &Style, details: &Value) -> Option<String> {
    let items = details.get("items")?.as_array()?;
    if items.is_empty() {
        return None;
    }
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            vec![
                text(item, "id").to_string(),
                number(item, "retries"),
                number(item, "nextAttemptAt"),
                number(item, "lastErrorStatus"),
            ]
        })
        .collect();
    Some(table(style, &["ID", "RETRIES", "NEXT ATTEMPT (ms)", "LAST STATUS"], &rows))
}

fn render_dead_letters(style: &Style, details: &Value) -> Option<String> {
    let items = details.get("items")?.as_array()?;
    if items.is_empty() {
        return None;
    }
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            vec![
                text(item, "id").to_string(),
                number(item, "retries"),
                text(item, "reason").to_string(),
            ]
        })
        .collect();
    Some(table(style, &["ID", "RETRIES", "REASON"], &rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_items_render_as_aligned_table() {
        let style = Style::new(true, false);
        let details = json!({
            "items": [
                {"id": "a1", "retries": 0, "nextAttemptAt": 10},
                {"id": "b22", "retries": 3, "nextAttemptAt": 2000, "lastErrorStatus": 503},
            ]
        });
        let rendered =
            render_details(&style, CommandInfo::new("queue", "pending"), &details).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID   RETRIES"), "{rendered}");
        assert!(lines[1].ends_with('-'), "{rendered}");
        assert!(lines[2].ends_with("503"), "{rendered}");
    }

    #[test]
    fn empty_lists_render_nothing() {
        let style = Style::new(true, false);
        let details = json!({ "bundles": [] });
        assert!(render_details(&style, CommandInfo::new("bundles", "list"), &details).is_none());
    }
}
