use crate::model::Availability;

/// Collapses runs of whitespace; empty text becomes `None`.
pub fn normalize_text(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() { None } else { Some(text) }
}

/// Parses a displayed price such as `123,000원`, `₩1,234,000`, `€1.234,50` or `$19.99`.
///
/// Only the first run of digits and separators is read. When both `.` and `,`
/// occur, the later one is the decimal mark. A single separator followed by
/// exactly three digits is treated as a thousands separator.
pub fn parse_price(raw: &str) -> Option<f64> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let run: String = raw[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let run = run.trim_end_matches(['.', ',']);

    let last_dot = run.rfind('.');
    let last_comma = run.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            let (decimal, thousands) = if d > c { ('.', ',') } else { (',', '.') };
            run.replace(thousands, "").replace(decimal, ".")
        }
        (Some(_), None) => single_separator(run, '.'),
        (None, Some(_)) => single_separator(run, ','),
        (None, None) => run.to_string(),
    };

    normalized.parse::<f64>().ok().filter(|p| p.is_finite())
}

fn single_separator(run: &str, sep: char) -> String {
    let parts: Vec<&str> = run.split(sep).collect();
    let grouped = parts.len() > 2 || parts.last().is_some_and(|tail| tail.len() == 3);
    if grouped {
        parts.concat()
    } else {
        run.replace(sep, ".")
    }
}

/// Maps availability text to a status; missing or empty text is `Unknown`.
pub fn parse_availability(raw: Option<&str>, sold_out_markers: &[String]) -> Availability {
    let Some(text) = raw.and_then(normalize_text) else {
        return Availability::Unknown;
    };
    let lower = text.to_lowercase();
    if sold_out_markers
        .iter()
        .any(|m| lower.contains(&m.to_lowercase()))
    {
        Availability::SoldOut
    } else {
        Availability::Available
    }
}
