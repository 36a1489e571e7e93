//! Headless entry point. Brings up every subsystem via `llm_gateway::init`
//! then blocks on the HTTP server, matching spec.md §6's exit codes: `0`
//! normal, `1` fatal init, `2` bad config.

#[tokio::main]
async fn main() {
    llm_gateway::init();
    llm_gateway::server::serve().await;
}
