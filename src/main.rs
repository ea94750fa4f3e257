use std::env;

use dotenv::dotenv;

use dirchat::server::Server;
use dirchat::storage::ServerPaths;
use dirchat::tls::TlsIdentity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let addr = env::var("DIRCHAT_ADDR").unwrap_or("0.0.0.0:47474".to_string());
    let data_dir = env::var("DIRCHAT_DATA_DIR").unwrap_or("data".to_string());
    let identity = TlsIdentity::new(
        env::var("DIRCHAT_CA").unwrap_or("certs/ca.pem".to_string()),
        env::var("DIRCHAT_CERT").unwrap_or("certs/server.pem".to_string()),
        env::var("DIRCHAT_KEY").unwrap_or("certs/server.key".to_string()),
    );

    let acceptor = identity.acceptor()?;
    let server = Server::new(ServerPaths::new(data_dir))?;
    tokio::spawn(async move {
        if let Err(e) = server.run(&addr, acceptor).await {
            eprintln!("Server error: {e:#}");
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("Shutting down server...");

    Ok(())
}
