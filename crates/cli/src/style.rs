//! Terminal styling for `mapsync save` and `mapsync diff` output.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Colour a change kind: created green, modified yellow, deleted red.
pub fn change_kind(kind: &str) -> String {
    let style = match kind {
        "created" => Style::new().green(),
        "modified" => Style::new().yellow(),
        "deleted" => Style::new().red(),
        _ => Style::new(),
    };
    style.apply_to(kind).to_string()
}
