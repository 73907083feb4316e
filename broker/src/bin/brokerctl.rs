use std::{env, process};

use broker::{BrokerClient, config::DEFAULT_SOCKET, config::SOCKET_VAR};
use serde_json::Map;

const USAGE: &str = "usage: brokerctl <ping | status | load <type> <path> | unload <type> <path>>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let socket = env::var(SOCKET_VAR).unwrap_or_else(|_| DEFAULT_SOCKET.to_string());

    let mut client = BrokerClient::connect(&socket).await.map_err(|e| {
        anyhow::anyhow!("cannot connect to {socket}: {e}")
    })?;

    let res = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["ping"] => client.ping().await,
        ["status"] => client.status().await,
        ["load", model_type, path] => client.load_model(path, model_type, Map::new()).await,
        ["unload", model_type, path] => client.unload_model(path, model_type).await,
        _ => {
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    match res {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    }

    Ok(())
}
