mod convergence;
mod discovery;
mod feed;
mod host;
mod interlock;
mod notify;
mod refresh;
mod registry;
mod retry;
mod services;
mod store;
#[cfg(test)]
mod testing;
mod transport;
mod weather;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
