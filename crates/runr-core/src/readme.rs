use runr_domain::APP_NAME;

const BOLD: &str = "\x1b[37;1m";
const DIM: &str = "\x1b[38;2;85;85;85m";
const RESET: &str = "\x1b[0m";

/// Renders a documentation file inside a boxed header naming the
/// address it belongs to. A namespace-only token shows `*` for the
/// script slot. Decorated output adds a dim gutter per body line;
/// plain output passes the body through untouched for piping.
pub fn render(token: &str, file_name: &str, body: &str, decorated: bool) -> String {
    let mut parts = token.splitn(2, '/');
    let namespace = parts.next().unwrap_or_default();
    let script = parts.next().unwrap_or("*");

    let title = format!("{APP_NAME} {namespace}:{script} ({file_name})");
    let line = "\u{2500}".repeat(title.chars().count() + 2);

    let mut out = String::new();
    out.push_str(&format!("{line}\u{2510}\n"));
    if decorated {
        out.push_str(&format!(" {BOLD}{title}{RESET} \u{2502}\n"));
    } else {
        out.push_str(&format!(" {title} \u{2502}\n"));
    }
    out.push_str(&format!("{line}\u{2518}\n"));

    if decorated {
        for each in body.lines() {
            out.push_str(&format!(" {DIM}\u{22ee}{RESET} {each}\n"));
        }
        out.push('\n');
    } else {
        out.push_str(body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_only_token_shows_star_script() {
        let out = render("docs", "README.md", "body\n", false);
        assert!(out.contains("runr docs:* (README.md)"));
    }

    #[test]
    fn full_token_names_the_script() {
        let out = render("ns/job", "README", "body\n", false);
        assert!(out.contains("runr ns:job (README)"));
    }

    #[test]
    fn plain_mode_passes_body_through() {
        let out = render("docs", "README", "line one\nline two\n", false);
        assert!(out.ends_with("line one\nline two\n"));
        assert!(!out.contains('\x1b'));
    }

    #[test]
    fn decorated_mode_gutters_each_line() {
        let out = render("docs", "README", "one\ntwo\n", true);
        assert_eq!(out.matches('\u{22ee}').count(), 2);
        assert!(out.contains(BOLD));
    }

    #[test]
    fn box_lines_match_title_width() {
        let out = render("docs", "README", "", false);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0].chars().count(),
            lines[1].chars().count(),
        );
        assert_eq!(lines[0].chars().count(), lines[2].chars().count());
    }
}
