use crate::output::{format_secs, print_json};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};

/// Thin HTTP client for a running daemon's RPC façade.
pub struct Client {
    base: String,
}

impl Client {
    pub fn new(url: &str) -> Self {
        Self {
            base: url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn read(response: std::result::Result<ureq::Response, ureq::Error>) -> Result<Value> {
        match response {
            Ok(resp) => Ok(resp.into_json()?),
            Err(ureq::Error::Status(code, resp)) => {
                let body: Value = resp.into_json().unwrap_or(Value::Null);
                let message = body["error"].as_str().unwrap_or("request failed");
                Err(anyhow!("daemon returned {code}: {message}"))
            }
            Err(e) => Err(anyhow!("cannot reach daemon: {e}")),
        }
    }

    pub fn configure(&self, document: &str) -> Result<Value> {
        Self::read(
            ureq::post(&self.url("/api/configuration"))
                .set("content-type", "application/json")
                .send_string(document),
        )
    }

    pub fn check(&self, perform: bool) -> Result<Value> {
        Self::read(
            ureq::post(&self.url("/api/update/check"))
                .send_json(json!({ "perform_update": perform })),
        )
    }

    pub fn snooze(&self, seconds: i64) -> Result<Value> {
        Self::read(ureq::post(&self.url("/api/update/snooze")).send_json(json!({ "seconds": seconds })))
    }

    pub fn status(&self) -> Result<Value> {
        Self::read(ureq::get(&self.url("/api/status")).call())
    }
}

fn result_code(body: &Value) -> Result<i64> {
    body["result"]
        .as_i64()
        .ok_or_else(|| anyhow!("malformed reply: {body}"))
}

fn state_name(code: i64) -> &'static str {
    match code {
        0 => "ready",
        1 => "updates available",
        2 => "in progress",
        -1 => "aborted",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub fn run_configure(client: &Client, document: &str, json: bool) -> Result<()> {
    let text = super::read_document(document)?;
    let body = client.configure(&text)?;
    if json {
        return print_json(&body);
    }
    match result_code(&body)? {
        0 => println!("configuration applied"),
        code => return Err(anyhow!("configuration rejected ({code})")),
    }
    Ok(())
}

pub fn run_check(client: &Client, perform: bool, json: bool) -> Result<()> {
    let body = client.check(perform)?;
    if json {
        return print_json(&body);
    }
    let code = result_code(&body)?;
    println!("update state: {} ({code})", state_name(code));
    Ok(())
}

pub fn run_snooze(client: &Client, seconds: i64, json: bool) -> Result<()> {
    let body = client.snooze(seconds)?;
    if json {
        return print_json(&body);
    }
    match result_code(&body)? {
        0 => println!("reboot snoozed for {seconds}s"),
        -2 => return Err(anyhow!("snooze refused: total pause limit exceeded")),
        code => return Err(anyhow!("snooze refused ({code})")),
    }
    Ok(())
}

pub fn run_status(client: &Client, json: bool) -> Result<()> {
    let body = client.status()?;
    if json {
        return print_json(&body);
    }
    let state = body["state"].as_i64().unwrap_or(i64::MIN);
    println!("state:      {} ({state})", state_name(state));
    println!("boot side:  {}", body["boot_side"].as_str().unwrap_or("?"));
    if body["switch_boot_side"].as_bool().unwrap_or(false) {
        println!("next boot:  other side");
    }
    if let Some(secs) = body["reboot_in_secs"].as_u64() {
        println!("reboot in:  {}", format_secs(secs));
    }
    Ok(())
}
