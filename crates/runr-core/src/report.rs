use runr_domain::AuditRecord;

const RESET: &str = "\x1b[0m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[1;37m";

const HEADERS: [&str; 8] = [
    "ID", "Target", "Initiated", "NS", "Script", "Task", "Len", "Result",
];

// Column palette for ordinary rows; the result cell varies by
// outcome, failed rows go all red.
const PALETTE: [&str; 7] = [CYAN, GREEN, MAGENTA, CYAN, GREEN, BLUE, MAGENTA];

/// Renders the run history as an aligned table. Only records with a
/// duration appear, so sub-steps without timing stay out of the
/// summary. Headers repeat at the bottom like the top.
pub fn render(records: &[AuditRecord], color: bool) -> String {
    let mut rows: Vec<[String; 8]> = Vec::new();
    for record in records {
        if record.duration.as_deref().unwrap_or_default().is_empty() {
            continue;
        }
        rows.push([
            record.id.clone(),
            record.target.clone(),
            record.start.clone().unwrap_or_default(),
            record.namespace.clone(),
            record.script.clone(),
            format!("\u{201c}{}\u{201d}", record.task),
            record.duration.clone().unwrap_or_default(),
            record.msg.clone(),
        ]);
    }

    let mut widths = [0usize; 8];
    for (i, header) in HEADERS.iter().enumerate() {
        widths[i] = header.chars().count();
    }
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, &HEADERS.map(String::from), None);
    for row in &rows {
        let colors = if color { Some(row_colors(&row[7])) } else { None };
        push_row(&mut out, &widths, row, colors.as_ref());
    }
    push_row(&mut out, &widths, &HEADERS.map(String::from), None);
    out
}

fn row_colors(msg: &str) -> [&'static str; 8] {
    match msg {
        "failed" | "interrupted" => [RED; 8],
        "repaired" => {
            let mut colors = [""; 8];
            colors[..7].copy_from_slice(&PALETTE);
            colors[7] = YELLOW;
            colors
        }
        _ => {
            let mut colors = [""; 8];
            colors[..7].copy_from_slice(&PALETTE);
            colors[7] = WHITE;
            colors
        }
    }
}

fn push_row(out: &mut String, widths: &[usize; 8], row: &[String; 8], colors: Option<&[&str; 8]>) {
    for (i, cell) in row.iter().enumerate() {
        let padding = widths[i] - cell.chars().count();
        match colors {
            Some(colors) => {
                out.push_str(colors[i]);
                out.push_str(cell);
                out.push_str(RESET);
            }
            None => out.push_str(cell),
        }
        if i + 1 < row.len() {
            out.push_str(&" ".repeat(padding + 1));
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, msg: &str, duration: Option<&str>) -> AuditRecord {
        AuditRecord {
            app: "runr".to_string(),
            id: id.to_string(),
            start: Some("2026-08-29 10:00:00".to_string()),
            namespace: "ns".to_string(),
            script: "job".to_string(),
            target: "local".to_string(),
            task: "unlabeled".to_string(),
            phase: "main".to_string(),
            msg: msg.to_string(),
            code: None,
            stdout: None,
            stderr: None,
            error: None,
            duration: duration.map(str::to_string),
        }
    }

    #[test]
    fn only_timed_records_become_rows() {
        let records = vec![
            record("aaaa", "ok", Some("0.120s")),
            record("bbbb", "ok", None),
        ];
        let table = render(&records, false);
        assert!(table.contains("aaaa"));
        assert!(!table.contains("bbbb"));
    }

    #[test]
    fn headers_bracket_the_table() {
        let table = render(&[record("aaaa", "ok", Some("0.120s"))], false);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert_eq!(lines[0], lines[2]);
    }

    #[test]
    fn columns_are_aligned() {
        let records = vec![
            record("short", "ok", Some("0.1s")),
            record("a-much-longer-id", "failed", Some("12.5s")),
        ];
        let table = render(&records, false);
        let lines: Vec<&str> = table.lines().collect();
        let target_col = lines[0].find("Target").unwrap();
        for line in &lines[1..3] {
            // Every row starts its second column at the same offset.
            assert_eq!(line.chars().nth(target_col - 1), Some(' '));
        }
    }

    #[test]
    fn failed_rows_are_painted_red() {
        let table = render(&[record("aaaa", "failed", Some("0.1s"))], true);
        assert!(table.contains(RED));
        assert!(table.contains(RESET));
    }

    #[test]
    fn plain_mode_has_no_escape_codes() {
        let table = render(&[record("aaaa", "failed", Some("0.1s"))], false);
        assert!(!table.contains('\x1b'));
    }

    #[test]
    fn task_is_typographically_quoted() {
        let table = render(&[record("aaaa", "ok", Some("0.1s"))], false);
        assert!(table.contains("\u{201c}unlabeled\u{201d}"));
    }
}
