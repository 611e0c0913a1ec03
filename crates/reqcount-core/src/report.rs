use crate::util::escape_html;
use std::time::Duration;

pub fn format_window(window: Duration) -> String {
    format!("{}s", window.as_secs())
}

pub fn render_report(served: u64, window: Duration, now: &str) -> String {
    format!(
        "Served {} requests in the last {}\nThe time is: {}\n",
        served,
        format_window(window),
        now
    )
}

pub fn render_not_found(path: &str) -> String {
    format!("Requested resource '{}' does not exist\n", escape_html(path))
}

/// Pulls the served count back out of a report body.
pub fn parse_served(body: &str) -> Option<u64> {
    let rest = body.strip_prefix("Served ")?;
    let (count, _) = rest.split_once(' ')?;
    count.parse().ok()
}
