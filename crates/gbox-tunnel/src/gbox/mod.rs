pub mod api;
pub mod app;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod net;
pub mod process;
pub mod registry;
pub mod runtime_paths;
pub mod tunnel;

pub async fn run(global: app::GlobalOpts, cmd: app::Command) -> anyhow::Result<()> {
    app::run(global, cmd).await
}
