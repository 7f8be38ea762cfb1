//! REST endpoint handlers organized by resource.

pub mod admin;
pub mod disputes;
pub mod marketplace;
pub mod system;
pub mod wallet;

use axum::Router;

use crate::app_state::AppState;

/// Composes all resource routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(marketplace::routes())
        .merge(disputes::routes())
        .merge(wallet::routes())
        .merge(admin::routes())
}
