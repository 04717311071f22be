use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Render a duration in whole hours and minutes, e.g. `13h 05m`.
pub fn format_secs(secs: u64) -> String {
    format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hours_and_minutes() {
        assert_eq!(format_secs(0), "0h 00m");
        assert_eq!(format_secs(13 * 3600 + 5 * 60 + 59), "13h 05m");
        assert_eq!(format_secs(168 * 3600), "168h 00m");
    }
}
