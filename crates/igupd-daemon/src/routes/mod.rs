pub mod configuration;
pub mod events;
pub mod status;
pub mod update;

use serde::Serialize;

/// Body returned by every integer-result RPC.
#[derive(Debug, Serialize)]
pub struct RpcResult {
    pub result: i32,
}
