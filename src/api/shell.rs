//! The HTML page served at `/`.
//!
//! The page itself lives in `assets/dashboard.html`; this module fills in
//! the two values it needs from the server.

const DASHBOARD_TEMPLATE: &str = include_str!("../../assets/dashboard.html");

/// Render the dashboard page for `user`.
pub fn render_dashboard(user: &str, refresh_interval_seconds: u64) -> String {
    DASHBOARD_TEMPLATE
        .replace("{{USER}}", &escape_html(user))
        .replace(
            "{{REFRESH_MS}}",
            &refresh_interval_seconds.saturating_mul(1000).to_string(),
        )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
