//! Filter module executable. All control flows via the bus; there are no
//! command-line arguments.

use anyhow::Result;
use databeam_bus::{BusRouter, RouterConfig};
use databeam_core::{logging, EnvConfig};
use databeam_filter::FilterModule;
use databeam_runtime::ModuleHost;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvConfig::with_module_defaults("Filter");
    logging::init(&env.get("LOGLEVEL"));

    let db_id = env.get("DB_ID");
    anyhow::ensure!(!db_id.is_empty(), "DB_ID not set");

    let token = CancellationToken::new();
    let node_name = format!("{}/m/{}", db_id, env.get("MODULE_NAME"));
    let bus = BusRouter::connect(
        RouterConfig::from_env(&env)?,
        &db_id,
        &node_name,
        token.clone(),
    )
    .await?;

    let module = FilterModule::new(&env);
    let host = ModuleHost::new(module, &env, bus, token)?;
    host.run().await
}
