use axum::{Extension, Router};

use crate::agent::Agent;

pub mod aggrs;
pub mod instances;
pub mod networks;
pub mod nics;
pub mod node;
pub mod status;

pub fn router(agent: Agent) -> Router {
    Router::new()
        .merge(status::router())
        .layer(Extension(agent))
}
