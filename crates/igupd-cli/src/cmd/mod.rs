pub mod client;
pub mod run;
pub mod schedule;

/// Take `arg` as inline text, or read it from a file when it starts with `@`.
pub fn read_document(arg: &str) -> anyhow::Result<String> {
    use anyhow::Context as _;
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}")),
        None => Ok(arg.to_string()),
    }
}
