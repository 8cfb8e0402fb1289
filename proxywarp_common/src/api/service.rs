use std::sync::Arc;

use axum::{routing::get, Router};

use crate::state::APIState;

use super::{admin, convert};

/// The management surface: home page, conversion endpoints, and (only
/// when the gateway runs in debug mode) the admin diagnostics.
pub fn service(state: Arc<APIState>) -> Router {
    let mut router = Router::new()
        .route("/", get(convert::index))
        .route("/convert", get(convert::get_convert))
        .route("/test-token/:token", get(convert::test_token));

    if state.config.debug {
        router = router
            .route("/admin/diagnostic", get(admin::diagnostic))
            .route("/admin/test-connection", get(admin::test_connection))
            .route("/admin/reload-tokens", get(admin::reload_tokens))
            .route("/admin/add-test-token", get(admin::add_test_token));
    }

    router.with_state(state)
}
