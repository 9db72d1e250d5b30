mod api;
mod app;
mod climate;
mod gateway;
mod history;
mod light;
mod predictor;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::run().await
}
