//! The HTTP+WS surface: a single `poem::Route` wiring every endpoint of
//! the external interface onto the `core` managers held in `AppState`.

pub mod middleware;
pub mod routes;
pub mod state;

pub use state::AppState;

use poem::middleware::Tracing;
use poem::{EndpointExt, Route};

/// Build the full application route, with the tracing/auth middleware
/// already attached.
pub fn build_route(state: AppState) -> Route {
    routes::build_routes()
        .with(middleware::AuthStub)
        .with(Tracing)
        .data(state)
}
